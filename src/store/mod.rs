//! Attribution store
//!
//! Maps an openId to the click that drove the install, plus an impression
//! counter. Each player is one hash in the backing key-value store:
//!
//! ```text
//! {prefix}{openId}   clickId     -> first click credited (HSETNX, never overwritten)
//!                    impression  -> impression counter (HINCRBY)
//! ```
//!
//! The store issues no retries. Every backend failure reaches the caller
//! as [`StoreError`].

#[cfg(test)]
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::AttributionRecord;

pub use self::redis::RedisFieldStore;

const CLICK_FIELD: &str = "clickId";
const IMPRESSION_FIELD: &str = "impression";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from the attribution store.
///
/// `Unavailable` and `Timeout` both mean the remote store could not be
/// used; `Corrupt` means it answered with data we cannot interpret.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("attribution store unavailable: {0}")]
    Unavailable(#[source] BoxError),

    #[error("attribution store did not answer within {0:?}")]
    Timeout(Duration),

    #[error("field {field} of {key} holds non-numeric value {value:?}")]
    Corrupt {
        key: String,
        field: String,
        value: String,
    },
}

impl StoreError {
    /// True for failures to reach the remote store at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// The three hash-field primitives the attribution store relies on.
///
/// Implementations must make `set_if_absent` and `increment` atomic with
/// respect to concurrent callers on the same key. A missing key or field
/// is `Ok(None)` from `get`, never an error.
#[async_trait]
pub trait FieldStore: Send + Sync {
    /// Write `value` only if `field` is unset. Returns whether it was written.
    async fn set_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError>;

    /// Add `delta` to an integer field (missing counts as 0), returning the new value.
    async fn increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    async fn get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Round trip used at startup to fail fast on a bad address.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Idempotent click attribution and impression counting per openId.
#[derive(Clone)]
pub struct AttributionStore {
    backend: Arc<dyn FieldStore>,
    key_prefix: String,
}

impl AttributionStore {
    pub fn new(backend: Arc<dyn FieldStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            backend,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, open_id: &str) -> String {
        format!("{}{}", self.key_prefix, open_id)
    }

    /// Check the backend is reachable.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.backend.ping().await
    }

    /// Record `click_id` for `open_id` unless a click is already recorded.
    ///
    /// Returns `true` only for the call that wrote the click. Uses the
    /// backend's conditional write directly, so of any number of concurrent
    /// calls for one openId exactly one returns `true`.
    pub async fn set_click_if_absent(
        &self,
        open_id: &str,
        click_id: &str,
    ) -> Result<bool, StoreError> {
        let key = self.key(open_id);
        let applied = self
            .backend
            .set_if_absent(&key, CLICK_FIELD, click_id)
            .await?;
        tracing::debug!("Set click for {} if absent: applied={}", open_id, applied);
        Ok(applied)
    }

    /// The click credited for `open_id`, or `None` for a player with no click yet.
    pub async fn get_click_id(&self, open_id: &str) -> Result<Option<String>, StoreError> {
        self.backend.get(&self.key(open_id), CLICK_FIELD).await
    }

    /// Count one impression, creating the record on first use.
    pub async fn increment_impression(&self, open_id: &str) -> Result<u64, StoreError> {
        let key = self.key(open_id);
        let count = self.backend.increment(&key, IMPRESSION_FIELD, 1).await?;
        u64::try_from(count).map_err(|_| StoreError::Corrupt {
            key,
            field: IMPRESSION_FIELD.to_string(),
            value: count.to_string(),
        })
    }

    /// Impressions seen for `open_id`; 0 for an unknown player.
    pub async fn get_impression_count(&self, open_id: &str) -> Result<u64, StoreError> {
        let key = self.key(open_id);
        match self.backend.get(&key, IMPRESSION_FIELD).await? {
            None => Ok(0),
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| StoreError::Corrupt {
                key,
                field: IMPRESSION_FIELD.to_string(),
                value: raw,
            }),
        }
    }

    /// Both fields for `open_id`.
    pub async fn record(&self, open_id: &str) -> Result<AttributionRecord, StoreError> {
        let (click_id, impression_count) = futures::try_join!(
            self.get_click_id(open_id),
            self.get_impression_count(open_id)
        )?;
        Ok(AttributionRecord {
            open_id: open_id.to_string(),
            click_id,
            impression_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryFieldStore;
    use super::*;

    fn store() -> AttributionStore {
        AttributionStore::new(Arc::new(MemoryFieldStore::new()), "open:")
    }

    /// Backend whose every call fails, standing in for an unreachable server.
    struct DownStore;

    #[async_trait]
    impl FieldStore for DownStore {
        async fn set_if_absent(&self, _: &str, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn increment(&self, _: &str, _: &str, _: i64) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn get(&self, _: &str, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_first_impression_creates_record() {
        let store = store();
        assert_eq!(store.increment_impression("u1").await.unwrap(), 1);
        assert_eq!(store.get_impression_count("u1").await.unwrap(), 1);
        assert_eq!(store.get_click_id("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_player_reads_as_empty() {
        let store = store();
        assert_eq!(store.get_impression_count("nobody").await.unwrap(), 0);
        assert_eq!(store.get_click_id("nobody").await.unwrap(), None);

        let record = store.record("nobody").await.unwrap();
        assert!(!record.is_attributed());
        assert_eq!(record.impression_count, 0);
    }

    #[tokio::test]
    async fn test_first_click_wins() {
        let store = store();
        assert!(store.set_click_if_absent("u1", "c100").await.unwrap());
        assert_eq!(store.get_click_id("u1").await.unwrap().as_deref(), Some("c100"));

        assert!(!store.set_click_if_absent("u1", "c200").await.unwrap());
        assert_eq!(store.get_click_id("u1").await.unwrap().as_deref(), Some("c100"));

        // Same value again still reports not applied.
        assert!(!store.set_click_if_absent("u1", "c100").await.unwrap());
    }

    #[tokio::test]
    async fn test_click_and_impressions_share_record() {
        let store = store();
        store.increment_impression("u2").await.unwrap();
        store.increment_impression("u2").await.unwrap();
        store.set_click_if_absent("u2", "c7").await.unwrap();

        let record = store.record("u2").await.unwrap();
        assert_eq!(
            record,
            AttributionRecord {
                open_id: "u2".to_string(),
                click_id: Some("c7".to_string()),
                impression_count: 2,
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_click_has_one_winner() {
        let store = store();
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let click = format!("c{}", i);
                let applied = store.set_click_if_absent("race", &click).await.unwrap();
                (click, applied)
            }));
        }

        let mut winners = Vec::new();
        for h in handles {
            let (click, applied) = h.await.unwrap();
            if applied {
                winners.push(click);
            }
        }

        assert_eq!(winners.len(), 1);
        let stored = store.get_click_id("race").await.unwrap();
        assert_eq!(stored.as_deref(), Some(winners[0].as_str()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = store();
        let n = 200;
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_impression("busy").await.unwrap() })
            })
            .collect();

        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        seen.sort_unstable();

        assert_eq!(store.get_impression_count("busy").await.unwrap(), n);
        // Every intermediate count was handed out exactly once.
        assert_eq!(seen, (1..=n).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_non_numeric_counter_is_corrupt() {
        let backend = Arc::new(MemoryFieldStore::new());
        backend.set_if_absent("open:u3", "impression", "lots").await.unwrap();
        let store = AttributionStore::new(backend, "open:");

        match store.get_impression_count("u3").await {
            Err(StoreError::Corrupt { key, value, .. }) => {
                assert_eq!(key, "open:u3");
                assert_eq!(value, "lots");
            }
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backend_failure_is_surfaced() {
        let store = AttributionStore::new(Arc::new(DownStore), "open:");

        let err = store.set_click_if_absent("u1", "c1").await.unwrap_err();
        assert!(err.is_unavailable());
        let err = store.increment_impression("u1").await.unwrap_err();
        assert!(err.is_unavailable());
        let err = store.get_click_id("u1").await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_key_prefix_isolates_records() {
        let backend: Arc<dyn FieldStore> = Arc::new(MemoryFieldStore::new());
        let a = AttributionStore::new(Arc::clone(&backend), "open:");
        let b = AttributionStore::new(backend, "staging:");

        a.set_click_if_absent("u1", "c1").await.unwrap();
        assert_eq!(b.get_click_id("u1").await.unwrap(), None);
        assert!(b.set_click_if_absent("u1", "c2").await.unwrap());
    }
}
