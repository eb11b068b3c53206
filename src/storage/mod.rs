//! Key-value storage backends for chat shards
//!
//! The persistence engine talks to storage only through [`KeyValueStore`]:
//! asynchronous `get`/`set`/`remove` over opaque string keys holding JSON
//! values. Writes are last-writer-wins per key and there are no transactions;
//! a single `set` call is the unit of atomicity.
//!
//! Two implementations are provided:
//!
//! - [`SledStore`]: durable, backed by an embedded `sled` database
//! - [`MemoryStore`]: in-process map with an optional byte quota

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

pub mod keys;
pub mod memory;
pub mod sled_store;
pub mod types;

pub use memory::MemoryStore;
pub use sled_store::SledStore;
pub use types::ChatSummary;

/// Asynchronous key-value store consumed by the chat persistence engine
///
/// Implementations must apply each `set` as one atomic write per key: a
/// reader never observes a partially written value.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the values stored under `keys`
    ///
    /// Keys that are absent are simply missing from the returned map.
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>>;

    /// Store every entry of `items`, replacing existing values
    async fn set(&self, items: HashMap<String, Value>) -> Result<()>;

    /// Remove `keys`; removing an absent key is not an error
    async fn remove(&self, keys: &[String]) -> Result<()>;

    /// Fetch a single key
    async fn get_one(&self, key: &str) -> Result<Option<Value>> {
        let mut found = self.get(&[key.to_string()]).await?;
        Ok(found.remove(key))
    }

    /// Store a single key
    async fn set_one(&self, key: &str, value: Value) -> Result<()> {
        let mut items = HashMap::with_capacity(1);
        items.insert(key.to_string(), value);
        self.set(items).await
    }
}
