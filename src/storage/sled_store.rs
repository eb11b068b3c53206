//! Durable key-value store backed by `sled`
//!
//! Each `set` call is applied as one `sled::Batch`, so a multi-key write is
//! atomic and a single shard is never observed half-written.

use super::KeyValueStore;
use crate::error::{ChatshardError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sled::Db;
use std::collections::HashMap;
use std::path::Path;

/// Key-value store persisted in an embedded `sled` database
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open or create a store at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the database directory
    ///
    /// # Errors
    ///
    /// Returns `ChatshardError::Storage` if the database cannot be opened
    ///
    /// # Examples
    ///
    /// ```
    /// use chatshard::storage::SledStore;
    ///
    /// # fn main() -> chatshard::error::Result<()> {
    /// let dir = tempfile::tempdir()?;
    /// let store = SledStore::open(dir.path().join("chats.db"))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| ChatshardError::Storage(format!("Failed to open database: {}", e)))?;
        Ok(Self { db })
    }

    /// Open a throwaway database that is deleted when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| ChatshardError::Storage(format!("Failed to open database: {}", e)))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl KeyValueStore for SledStore {
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self
                .db
                .get(key.as_bytes())
                .map_err(|e| ChatshardError::Storage(format!("Get failed: {}", e)))?
            else {
                continue;
            };

            // An undecodable value is reported as missing so the caller's
            // recovery path handles it like any other lost shard.
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => {
                    found.insert(key.clone(), value);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping undecodable stored value");
                }
            }
        }
        Ok(found)
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (key, value) in &items {
            let bytes = serde_json::to_vec(value)
                .map_err(|e| ChatshardError::Storage(format!("Serialization failed: {}", e)))?;
            batch.insert(key.as_bytes(), bytes);
        }

        self.db
            .apply_batch(batch)
            .map_err(|e| ChatshardError::Storage(format!("Insert failed: {}", e)))?;

        self.db
            .flush_async()
            .await
            .map_err(|e| ChatshardError::Storage(format!("Flush failed: {}", e)))?;

        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(key.as_bytes());
        }

        self.db
            .apply_batch(batch)
            .map_err(|e| ChatshardError::Storage(format!("Remove failed: {}", e)))?;

        self.db
            .flush_async()
            .await
            .map_err(|e| ChatshardError::Storage(format!("Flush failed: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (SledStore, TempDir) {
        let dir = TempDir::new().expect("failed to create tempdir");
        let store = SledStore::open(dir.path().join("chats.db")).expect("failed to open store");
        (store, dir)
    }

    #[tokio::test]
    async fn test_set_and_get_roundtrip() {
        let (store, _dir) = create_test_store();
        store
            .set_one("chat_1", json!({"id": "1", "title": "t"}))
            .await
            .expect("set failed");

        let value = store.get_one("chat_1").await.expect("get failed");
        assert_eq!(value, Some(json!({"id": "1", "title": "t"})));
    }

    #[tokio::test]
    async fn test_get_skips_missing_keys() {
        let (store, _dir) = create_test_store();
        store.set_one("a", json!(1)).await.expect("set failed");

        let found = store
            .get(&["a".to_string(), "missing".to_string()])
            .await
            .expect("get failed");
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("a"));
    }

    #[tokio::test]
    async fn test_get_skips_undecodable_value() {
        let (store, _dir) = create_test_store();
        store.db.insert("broken", &b"{not json"[..]).unwrap();

        let found = store.get(&["broken".to_string()]).await.expect("get failed");
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_remove_deletes_keys() {
        let (store, _dir) = create_test_store();
        store.set_one("a", json!(1)).await.unwrap();
        store.set_one("b", json!(2)).await.unwrap();

        store
            .remove(&["a".to_string(), "absent".to_string()])
            .await
            .expect("remove failed");

        assert!(store.get_one("a").await.unwrap().is_none());
        assert_eq!(store.get_one("b").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_temporary_store() {
        let store = SledStore::temporary().unwrap();
        store.set_one("k", json!("v")).await.unwrap();
        assert_eq!(store.get_one("k").await.unwrap(), Some(json!("v")));
    }
}
