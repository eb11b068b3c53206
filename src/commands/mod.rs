/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `chat`: streamed turns, one-shot or interactive
- `history`: listing, creating, switching, deleting and showing chats

Both build the persistence engine through [`open_manager`].
*/

use crate::chat::{ChatManager, TokioScheduler};
use crate::config::Config;
use crate::error::Result;
use crate::storage::SledStore;
use std::sync::Arc;

pub mod chat;
pub mod history;

/// Open the configured store and initialize a [`ChatManager`] over it
///
/// # Errors
///
/// Returns an error if the store cannot be opened or read.
pub async fn open_manager(config: &Config) -> Result<ChatManager> {
    let path = config.storage.resolved_path()?;
    tracing::debug!("Opening chat store at {}", path.display());

    let store = SledStore::open(&path)?;
    let scheduler = TokioScheduler::new(
        config.storage.idle_delay(),
        config.storage.flush_budget(),
    );
    let manager = ChatManager::new(
        Arc::new(store),
        Arc::new(scheduler),
        config.storage.clone(),
    );
    manager.initialize().await?;
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_manager_creates_store_and_default_chat() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.path = Some(dir.path().join("db").to_string_lossy().to_string());

        let manager = open_manager(&config).await.unwrap();
        assert_eq!(manager.chat_ids().len(), 1);
        manager.dispose().await.unwrap();
    }
}
