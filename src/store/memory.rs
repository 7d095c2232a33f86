//! In-process `FieldStore` with the same atomicity as the remote store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{FieldStore, StoreError};

type Hash = HashMap<String, String>;

#[derive(Default)]
pub struct MemoryFieldStore {
    hashes: Mutex<HashMap<String, Hash>>,
}

impl MemoryFieldStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FieldStore for MemoryFieldStore {
    async fn set_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        let hash = hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        let hash = hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::Corrupt {
                key: key.to_string(),
                field: field.to_string(),
                value: raw.clone(),
            })?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
