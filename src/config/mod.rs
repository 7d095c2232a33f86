//! Process configuration
//!
//! Loaded once at startup from a TOML file plus a handful of environment
//! overrides, then handed to component constructors. Nothing below `main`
//! reads the environment.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Environment overrides, applied after the config file.
const ENV_REDIS_ADDRESS: &str = "REDIS_ADDRESS";
const ENV_REDIS_USERNAME: &str = "REDIS_USERNAME";
const ENV_REDIS_PASSWORD: &str = "REDIS_PASSWORD";
const ENV_APP_ID: &str = "AD_APP_ID";
const ENV_APP_SECRET: &str = "AD_APP_SECRET";

/// Application configuration
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub token: TokenConfig,
    pub conversion: ConversionConfig,
    pub http: HttpConfig,
}

/// Connection parameters for the attribution key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// `host:port`
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
    /// Prefix prepended to every openId to form the hash key.
    pub key_prefix: String,
    /// Upper bound on a single store round trip.
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6379".to_string(),
            username: None,
            password: None,
            db: 0,
            key_prefix: "open:".to_string(),
            timeout_ms: 2000,
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Token endpoint credentials and refresh policy.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub endpoint: String,
    pub app_id: String,
    pub app_secret: String,
    /// Subtracted from the issuer-declared TTL before scheduling renewal.
    pub safety_margin_secs: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://developer.toutiao.com/api/apps/v2/token".to_string(),
            app_id: String::new(),
            app_secret: String::new(),
            safety_margin_secs: 300,
            base_backoff_ms: 1000,
            max_backoff_secs: 60,
        }
    }
}

// Hand-written so the secret never reaches a log line.
impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("endpoint", &self.endpoint)
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .field("safety_margin_secs", &self.safety_margin_secs)
            .field("base_backoff_ms", &self.base_backoff_ms)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .finish()
    }
}

/// Conversion reporting to the ad-analytics platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub enabled: bool,
    pub endpoint: String,
    /// Event type sent for a first-time activation.
    pub event_type: String,
    /// How long a report waits for the first access token before it is dropped.
    pub token_wait_secs: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://analytics.oceanengine.com/api/v2/conversion".to_string(),
            event_type: "active".to_string(),
            token_wait_secs: 10,
        }
    }
}

impl ConversionConfig {
    pub fn token_wait(&self) -> Duration {
        Duration::from_secs(self.token_wait_secs)
    }
}

/// Outbound HTTP client settings shared by the token and conversion calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// When set, only this CA certificate (PEM) is trusted.
    pub pinned_ca_pem: Option<PathBuf>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            pinned_ca_pem: None,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Get config file path
    fn default_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "ad-attribution", "ad-attribution")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Load configuration from `path` (or the platform default), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::parse(&content)?
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Apply overrides from a variable lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(addr) = get(ENV_REDIS_ADDRESS) {
            self.redis.address = addr;
        }
        if let Some(user) = get(ENV_REDIS_USERNAME) {
            self.redis.username = Some(user);
        }
        if let Some(pass) = get(ENV_REDIS_PASSWORD) {
            self.redis.password = Some(pass);
        }
        if let Some(id) = get(ENV_APP_ID) {
            self.token.app_id = id;
        }
        if let Some(secret) = get(ENV_APP_SECRET) {
            self.token.app_secret = secret;
        }
    }
}
