//! ad-attribution - install attribution for mini-game ad campaigns
//!
//! Records which ad click brought each player in, counts impressions, and
//! reports first-time activations to the ad-analytics platform.

mod api;
mod auth;
mod config;
mod models;
mod service;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::builder::NonEmptyStringValueParser;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth::{HttpTokenSource, RefreshEvent, RefreshPolicy, TokenManager};
use crate::config::Config;
use crate::models::Resp;
use crate::service::{AttributionService, ConversionHook};
use crate::store::{AttributionStore, RedisFieldStore};

#[derive(Parser)]
#[command(name = "ad-attribution")]
#[command(about = "Install attribution and conversion reporting for ad campaigns", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Count an ad impression for a player
    Impression {
        #[arg(long, value_parser = NonEmptyStringValueParser::new())]
        open_id: String,
    },

    /// Record a player's activation, crediting the click on first sight
    Activate {
        #[arg(long, value_parser = NonEmptyStringValueParser::new())]
        open_id: String,

        /// Click identifier from the ad callback
        #[arg(long, value_parser = NonEmptyStringValueParser::new())]
        click_id: String,
    },

    /// Show the attribution record for a player
    Lookup {
        #[arg(long, value_parser = NonEmptyStringValueParser::new())]
        open_id: String,
    },

    /// Acquire an access token once and show its status
    Token {
        /// Exchange credentials a second time once the first token is held
        #[arg(long)]
        refresh: bool,
    },

    /// Keep the access token fresh until interrupted
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Impression { open_id } => {
            let service = AttributionService::new(open_store(&config).await?, None);
            print_envelope(service.on_impression(&open_id).await)?;
        }
        Commands::Activate { open_id, click_id } => {
            let store = open_store(&config).await?;
            let (manager, hook) = match ConversionHook::from_config(&config) {
                Some((manager, hook)) => (Some(manager), Some(hook)),
                None => (None, None),
            };

            // Token acquisition runs beside the write; only the report waits on it.
            let starter = manager.as_ref().map(|manager| {
                let manager = Arc::clone(manager);
                tokio::spawn(async move {
                    if let Err(e) = manager.start().await {
                        tracing::debug!("Token manager stopped before a token arrived: {}", e);
                    }
                })
            });

            let service = AttributionService::new(store, hook);
            let result = service.on_activation(&open_id, &click_id).await;
            service.drain_reports().await;

            if let Some(manager) = manager {
                manager.shutdown().await;
            }
            if let Some(starter) = starter {
                let _ = starter.await;
            }
            print_envelope(result)?;
        }
        Commands::Lookup { open_id } => {
            let service = AttributionService::new(open_store(&config).await?, None);
            print_envelope(service.lookup(&open_id).await)?;
        }
        Commands::Token { refresh } => {
            let (manager, _) = start_token_manager(&config).await?;
            if refresh {
                tracing::info!("Forcing a second token exchange...");
                if let Err(e) = manager.refresh_now().await {
                    println!("Refresh failed: {}", e);
                }
            }

            match manager.current_token() {
                Some(token) if !token.is_expired() => {
                    println!("Access token: valid");
                    println!("  issued_at: {}", token.issued_at);
                    println!("  renews_at: {}", token.expires_at);
                }
                Some(_) => println!("Access token: expired"),
                None => println!("Access token: none"),
            }
            println!("Manager state: {:?}", manager.state());
            manager.shutdown().await;
        }
        Commands::Daemon => {
            run_daemon(&config).await?;
        }
    }

    Ok(())
}

/// Connect to the attribution store and make sure it answers.
async fn open_store(config: &Config) -> Result<AttributionStore> {
    let backend = RedisFieldStore::connect(&config.redis)
        .await
        .with_context(|| format!("Redis init failed ({})", config.redis.address))?;
    let store = AttributionStore::new(Arc::new(backend), config.redis.key_prefix.clone());
    store.ping().await.context("Redis ping failed")?;
    Ok(store)
}

/// Build the token manager and block until it holds a token. Ctrl-C aborts.
async fn start_token_manager(config: &Config) -> Result<(TokenManager, reqwest::Client)> {
    let http = api::build_http_client(&config.http)?;
    let source =
        HttpTokenSource::new(http.clone(), &config.token).context("Invalid token configuration")?;
    let manager = TokenManager::new(Arc::new(source), RefreshPolicy::from_config(&config.token));

    tokio::select! {
        result = manager.start() => {
            result.context("Token manager failed to start")?;
        }
        _ = tokio::signal::ctrl_c() => {
            manager.shutdown().await;
            bail!("Interrupted before an access token was acquired");
        }
    }
    Ok((manager, http))
}

async fn run_daemon(config: &Config) -> Result<()> {
    let (manager, _) = start_token_manager(config).await?;
    let mut events = manager.subscribe();

    println!("Token manager running. (Ctrl-C to stop)");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RefreshEvent::Refreshed { expires_at }) => {
                    println!("Token renewed, next renewal at {}", expires_at);
                }
                Ok(RefreshEvent::Failed { attempt, retry_in, error }) => {
                    println!(
                        "Renewal attempt {} failed ({}), retrying in {:?}",
                        attempt, error, retry_in
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {} refresh events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// Print a result in the `{err_no, err_msg, data}` envelope. A failed
/// result is also returned as an error so the process exits non-zero.
fn print_envelope<T: Serialize, E: std::fmt::Display>(result: Result<T, E>) -> Result<()> {
    let resp: Resp<T> = result.into();
    println!(
        "{}",
        serde_json::to_string_pretty(&resp).context("Failed to serialize response")?
    );
    if !resp.is_success() {
        bail!("{}", resp.err_msg);
    }
    Ok(())
}
