//! chatshard - streaming chat client with sharded local history
//!
//! This library provides a chat persistence engine over a key-value store,
//! a streaming completion client, and the glue that keeps the two in order.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `chat`: Chat data model and the `ChatManager` persistence engine
//! - `storage`: Key-value store trait, key layout, and sled/in-memory backends
//! - `completion`: Streaming OpenAI-compatible client with throttled snapshots
//! - `view_sync`: Ordered application of snapshots to the engine and the view
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chatshard::chat::{ChatManager, Message, TokioScheduler};
//! use chatshard::storage::SledStore;
//! use chatshard::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let store = SledStore::open(config.storage.resolved_path()?)?;
//!     let manager = ChatManager::new(
//!         Arc::new(store),
//!         Arc::new(TokioScheduler::default()),
//!         config.storage.clone(),
//!     );
//!     manager.initialize().await?;
//!     manager.add_message_to_current_chat(Message::user("Hello"))?;
//!     manager.dispose().await?;
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod cli;
pub mod commands;
pub mod completion;
pub mod config;
pub mod error;
pub mod storage;
pub mod view_sync;

// Re-export commonly used types
pub use chat::{Chat, ChatManager, Message, MessageUpdate, Role};
pub use completion::{CompletionClient, Snapshot, StreamOutcome};
pub use config::Config;
pub use error::{ChatshardError, Result};

#[cfg(test)]
pub mod test_utils;
