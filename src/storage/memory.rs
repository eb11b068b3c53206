//! In-process key-value store
//!
//! Mirrors the semantics of a browser-style extension storage area: values
//! are JSON, writes replace whole keys, and an optional byte quota rejects a
//! `set` that would grow the store past its limit.

use super::KeyValueStore;
use crate::error::{ChatshardError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<String, Value>,
    quota_bytes: Option<usize>,
    write_log: Vec<String>,
}

/// Key-value store held entirely in memory
///
/// # Examples
///
/// ```
/// use chatshard::storage::{KeyValueStore, MemoryStore};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let store = MemoryStore::new();
/// store.set_one("k", serde_json::json!(1)).await.unwrap();
/// assert_eq!(store.get_one("k").await.unwrap(), Some(serde_json::json!(1)));
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store without a quota
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that rejects writes beyond `quota_bytes`
    pub fn with_quota(quota_bytes: usize) -> Self {
        let store = Self::default();
        store.set_quota(Some(quota_bytes));
        store
    }

    /// Change the quota; `None` removes it
    pub fn set_quota(&self, quota_bytes: Option<usize>) {
        self.lock().quota_bytes = quota_bytes;
    }

    /// Sorted list of stored keys
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of successful writes to `key`
    pub fn write_count(&self, key: &str) -> usize {
        self.lock().write_log.iter().filter(|k| *k == key).count()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn encoded_size(key: &str, value: &Value) -> usize {
    key.len() + value.to_string().len()
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>> {
        let inner = self.lock();
        Ok(keys
            .iter()
            .filter_map(|k| inner.entries.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<()> {
        let mut inner = self.lock();

        if let Some(quota) = inner.quota_bytes {
            let untouched: usize = inner
                .entries
                .iter()
                .filter(|(k, _)| !items.contains_key(*k))
                .map(|(k, v)| encoded_size(k, v))
                .sum();
            let incoming: usize = items.iter().map(|(k, v)| encoded_size(k, v)).sum();
            if untouched + incoming > quota {
                return Err(ChatshardError::Storage(format!(
                    "quota exceeded: {} bytes requested, limit {}",
                    untouched + incoming,
                    quota
                ))
                .into());
            }
        }

        for (key, value) in items {
            inner.write_log.push(key.clone());
            inner.entries.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let mut inner = self.lock();
        for key in keys {
            inner.entries.remove(key);
        }
        Ok(())
    }
}
