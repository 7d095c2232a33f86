//! Self-refreshing access token manager
//!
//! `start` blocks until the first token is in hand (retrying transient
//! failures forever), then spawns one renewal task that sleeps until the
//! token's refresh deadline and acquires a replacement.
//!
//! Two locks, two jobs:
//! - `gate` (async mutex) owns the backoff state and admits one refresh
//!   attempt at a time, scheduled or manual.
//! - `current` (RwLock around an `Arc`) is only held to clone or swap the
//!   pointer, so readers never wait on a refresh round trip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::endpoint::TokenSource;
use super::tokens::AccessToken;
use super::TokenError;
use crate::config::TokenConfig;

const EVENT_CAPACITY: usize = 64;

/// Timing knobs for acquisition and renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub safety_margin: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RefreshPolicy {
    pub fn from_config(config: &TokenConfig) -> Self {
        Self {
            safety_margin: Duration::from_secs(config.safety_margin_secs),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
        }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from_config(&TokenConfig::default())
    }
}

/// Where the manager is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    Uninitialized,
    /// First acquisition in flight; no token yet.
    Acquiring,
    Valid { expires_at: DateTime<Utc> },
    /// Renewal in flight; the previous token is still served.
    Refreshing,
    /// Last attempt failed; next one after `retry_in`.
    Failed { attempt: u32, retry_in: Duration },
    Stopped,
}

/// Emitted after every refresh attempt.
#[derive(Debug, Clone)]
pub enum RefreshEvent {
    Refreshed {
        expires_at: DateTime<Utc>,
    },
    Failed {
        attempt: u32,
        retry_in: Duration,
        error: String,
    },
}

type Slot = Arc<RwLock<Option<Arc<AccessToken>>>>;

/// Cheap, cloneable reader of the current token.
#[derive(Clone)]
pub struct TokenHandle {
    slot: Slot,
    state: watch::Receiver<TokenState>,
}

impl TokenHandle {
    /// The latest valid token, or `None` before the first acquisition.
    pub fn current(&self) -> Option<Arc<AccessToken>> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Like [`current`](Self::current), but if no token has been installed
    /// yet, wait up to `limit` for the first one.
    pub async fn wait_current(&self, limit: Duration) -> Option<Arc<AccessToken>> {
        if let Some(token) = self.current() {
            return Some(token);
        }

        let mut state = self.state.clone();
        let _ = tokio::time::timeout(
            limit,
            state.wait_for(|s| matches!(s, TokenState::Valid { .. } | TokenState::Stopped)),
        )
        .await;
        self.current()
    }
}

struct Shared {
    source: Arc<dyn TokenSource>,
    policy: RefreshPolicy,
    current: TokenHandle,
    gate: tokio::sync::Mutex<Backoff>,
    state: watch::Sender<TokenState>,
    events: broadcast::Sender<RefreshEvent>,
    reschedule: Notify,
    cancel: CancellationToken,
}

impl Shared {
    fn install(&self, token: Arc<AccessToken>) {
        *self.current.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }

    /// The current token if it is not `stale`.
    fn replaced_since(&self, stale: &Option<Arc<AccessToken>>) -> Option<Arc<AccessToken>> {
        let current = self.current.current()?;
        match stale {
            Some(old) if Arc::ptr_eq(old, &current) => None,
            _ => Some(current),
        }
    }

    /// One request to the token source. Caller holds the gate.
    ///
    /// Success installs the token and clears `backoff`. Failure leaves both
    /// the backoff and the published state to the caller.
    async fn attempt(&self, backoff: &mut Backoff) -> Result<Arc<AccessToken>, TokenError> {
        let in_flight = if self.current.current().is_some() {
            TokenState::Refreshing
        } else {
            TokenState::Acquiring
        };
        self.state.send_replace(in_flight);

        let issued = self.source.fetch().await?;
        let token = Arc::new(AccessToken::from_issued(issued, self.policy.safety_margin));
        self.install(Arc::clone(&token));
        backoff.reset();

        tracing::info!("Access token refreshed, renewing at {}", token.expires_at);
        self.state.send_replace(TokenState::Valid {
            expires_at: token.expires_at,
        });
        let _ = self.events.send(RefreshEvent::Refreshed {
            expires_at: token.expires_at,
        });
        Ok(token)
    }

    /// Record a failed scheduled attempt and return the delay before the next.
    fn schedule_retry(&self, backoff: &mut Backoff, error: &TokenError) -> Duration {
        let retry_in = backoff.fail();
        let attempt = backoff.failures();

        tracing::warn!(
            "Token acquisition attempt {} failed: {}. Retrying in {:?}",
            attempt,
            error,
            retry_in
        );
        self.state.send_replace(TokenState::Failed { attempt, retry_in });
        let _ = self.events.send(RefreshEvent::Failed {
            attempt,
            retry_in,
            error: error.to_string(),
        });
        retry_in
    }

    /// Retry until a new token is installed. Only fails on shutdown.
    async fn acquire(&self) -> Result<Arc<AccessToken>, TokenError> {
        let stale = self.current.current();

        loop {
            let retry_in = {
                let mut backoff = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(TokenError::Shutdown),
                    guard = self.gate.lock() => guard,
                };

                // A manual refresh may have landed while we waited or slept.
                if let Some(fresh) = self.replaced_since(&stale) {
                    return Ok(fresh);
                }

                let outcome = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(TokenError::Shutdown),
                    outcome = self.attempt(&mut backoff) => outcome,
                };
                match outcome {
                    Ok(token) => return Ok(token),
                    Err(e) => self.schedule_retry(&mut backoff, &e),
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TokenError::Shutdown),
                _ = tokio::time::sleep(retry_in) => {}
            }
        }
    }
}

/// Owns the current access token and the task that keeps it fresh.
pub struct TokenManager {
    shared: Arc<Shared>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenManager {
    pub fn new(source: Arc<dyn TokenSource>, policy: RefreshPolicy) -> Self {
        let (state, state_rx) = watch::channel(TokenState::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                source,
                policy,
                current: TokenHandle {
                    slot: Arc::new(RwLock::new(None)),
                    state: state_rx,
                },
                gate: tokio::sync::Mutex::new(Backoff::new(
                    policy.base_backoff,
                    policy.max_backoff,
                )),
                state,
                events,
                reschedule: Notify::new(),
                cancel: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Acquire the first token, then start background renewal.
    ///
    /// Transient failures are retried with backoff for as long as it takes;
    /// this only returns an error if called twice or if `shutdown` is
    /// requested before a token arrives.
    pub async fn start(&self) -> Result<Arc<AccessToken>, TokenError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TokenError::AlreadyStarted);
        }

        tracing::info!("Acquiring initial access token...");
        let token = self.shared.acquire().await?;

        let handle = tokio::spawn(renewal_loop(Arc::clone(&self.shared)));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(token)
    }

    /// The latest valid token. Never waits on a refresh in flight.
    pub fn current_token(&self) -> Option<Arc<AccessToken>> {
        self.shared.current.current()
    }

    pub fn handle(&self) -> TokenHandle {
        self.shared.current.clone()
    }

    pub fn state(&self) -> TokenState {
        self.shared.state.borrow().clone()
    }

    /// Refresh outcomes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.shared.events.subscribe()
    }

    /// Make one refresh attempt now, queued behind any attempt in flight.
    ///
    /// On success the renewal timer is rescheduled from the new token. On
    /// failure the current token is kept, the state reverts to what it was
    /// before the attempt and the scheduled retry delay is left untouched.
    pub async fn refresh_now(&self) -> Result<Arc<AccessToken>, TokenError> {
        if self.shared.cancel.is_cancelled() {
            return Err(TokenError::Shutdown);
        }

        let token = {
            let mut backoff = self.shared.gate.lock().await;
            let before = self.state();
            match self.shared.attempt(&mut backoff).await {
                Ok(token) => token,
                Err(e) => {
                    tracing::warn!("Manual token refresh failed: {}", e);
                    self.shared.state.send_replace(before);
                    return Err(e);
                }
            }
        };
        self.shared.reschedule.notify_one();
        Ok(token)
    }

    /// Stop renewal: cancels any retry sleep or pending timer and waits for
    /// the background task to exit.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();

        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Token renewal task ended abnormally: {}", e);
            }
        }
        self.shared.state.send_replace(TokenState::Stopped);
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn renewal_loop(shared: Arc<Shared>) {
    loop {
        let deadline = shared
            .current
            .current()
            .map(|t| t.refresh_at())
            .unwrap_or_else(Instant::now);

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = shared.reschedule.notified() => continue,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        tracing::debug!("Access token due for renewal");
        if shared.acquire().await.is_err() {
            break;
        }
    }

    shared.state.send_replace(TokenState::Stopped);
    tracing::debug!("Token renewal task stopped");
}
