//! Redis-backed `FieldStore`
//!
//! One multiplexed `ConnectionManager` shared by all callers; it reconnects
//! on its own after a dropped connection. Every command is bounded by the
//! configured timeout so a stalled server cannot pin a request task.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;

use super::{FieldStore, StoreError};
use crate::config::RedisConfig;

impl From<::redis::RedisError> for StoreError {
    fn from(e: ::redis::RedisError) -> Self {
        StoreError::Unavailable(Box::new(e))
    }
}

pub struct RedisFieldStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisFieldStore {
    /// Open a managed connection to the server named in `config`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let url = connection_url(config)?;
        let client = ::redis::Client::open(url.as_str())?;
        let timeout = config.timeout();

        tracing::debug!("Connecting to redis at {}", config.address);
        let conn = bounded(timeout, ConnectionManager::new(client)).await?;

        Ok(Self { conn, timeout })
    }
}

/// Build `redis://[user[:pass]@]host:port/db`, percent-encoding credentials.
fn connection_url(config: &RedisConfig) -> Result<url::Url, StoreError> {
    let invalid = |reason: String| StoreError::Unavailable(reason.into());

    let mut url = url::Url::parse(&format!("redis://{}/{}", config.address, config.db))
        .map_err(|e| invalid(format!("invalid redis address {:?}: {}", config.address, e)))?;

    if let Some(user) = config.username.as_deref().filter(|u| !u.is_empty()) {
        url.set_username(user)
            .map_err(|_| invalid("redis username rejected".to_string()))?;
    }
    if let Some(pass) = config.password.as_deref().filter(|p| !p.is_empty()) {
        url.set_password(Some(pass))
            .map_err(|_| invalid("redis password rejected".to_string()))?;
    }
    Ok(url)
}

/// The server answered, but the stored value does not fit the command
/// (HINCRBY on a non-integer field).
fn is_value_error(e: &::redis::RedisError) -> bool {
    matches!(
        e.kind(),
        ::redis::ErrorKind::ResponseError | ::redis::ErrorKind::TypeError
    )
}

/// Run a redis future under `limit`, mapping both failure kinds to `StoreError`.
async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = ::redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

#[async_trait]
impl FieldStore for RedisFieldStore {
    async fn set_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        bounded(self.timeout, conn.hset_nx(key, field, value)).await
    }

    async fn increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let outcome = tokio::time::timeout(self.timeout, conn.hincr(key, field, delta)).await;
        match outcome {
            Ok(Err(e)) if is_value_error(&e) => {
                let value: Option<String> = bounded(self.timeout, conn.hget(key, field)).await?;
                Err(StoreError::Corrupt {
                    key: key.to_string(),
                    field: field.to_string(),
                    value: value.unwrap_or_default(),
                })
            }
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    async fn get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        bounded(self.timeout, conn.hget(key, field)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = bounded(
            self.timeout,
            ::redis::cmd("PING").query_async(&mut conn),
        )
        .await?;
        tracing::debug!("redis ping: {}", pong);
        Ok(())
    }
}
