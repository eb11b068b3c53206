//! Test utilities for chatshard
//!
//! Shared builders for managers over an in-memory store driven by a
//! [`ManualScheduler`], plus error assertion helpers.

use crate::chat::{Chat, ChatManager, ManualScheduler, Message};
use crate::config::StorageConfig;
use crate::storage::MemoryStore;
use serde_json::Value;
use std::sync::Arc;

/// Build a manager over `store` without initializing it
pub fn manager_over(store: Arc<MemoryStore>) -> (ChatManager, Arc<ManualScheduler>) {
    let scheduler = Arc::new(ManualScheduler::new());
    let manager = ChatManager::new(store, scheduler.clone(), StorageConfig::default());
    (manager, scheduler)
}

/// Build an initialized manager over an empty store with background work drained
pub async fn manual_manager() -> (ChatManager, Arc<MemoryStore>, Arc<ManualScheduler>) {
    let store = Arc::new(MemoryStore::new());
    let (manager, scheduler) = manager_over(store.clone());
    manager
        .initialize()
        .await
        .expect("Failed to initialize manager");
    scheduler.run_until_idle().await;
    (manager, store, scheduler)
}

/// A chat with one user message, serialized the way the legacy blob stores it
pub fn legacy_chat(id: &str, title: &str, text: &str) -> Value {
    let mut chat = Chat::new(id, title);
    chat.messages.push(Message::user(text));
    serde_json::to_value(chat).expect("Failed to serialize chat")
}

/// Assert that an error contains the expected message
///
/// # Panics
///
/// Panics if the result is Ok or if the error doesn't contain the expected message
pub fn assert_error_contains<T>(result: anyhow::Result<T>, expected: &str) {
    match result {
        Ok(_) => panic!("Expected error containing '{}' but got Ok", expected),
        Err(e) => {
            let error_msg = e.to_string();
            assert!(
                error_msg.contains(expected),
                "Error message '{}' does not contain '{}'",
                error_msg,
                expected
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatshardError;

    #[tokio::test]
    async fn test_manual_manager_is_clean() {
        let (manager, store, scheduler) = manual_manager().await;
        assert!(manager.is_clean());
        assert_eq!(scheduler.pending(), 0);
        assert!(!store.keys().is_empty());
    }

    #[test]
    fn test_legacy_chat_shape() {
        let value = legacy_chat("7", "Old", "hello");
        assert_eq!(value["id"], "7");
        assert_eq!(value["messages"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn test_assert_error_contains_success() {
        let result: anyhow::Result<()> = Err(ChatshardError::Config("test error message".into()).into());
        assert_error_contains(result, "test error");
    }

    #[test]
    #[should_panic(expected = "Expected error containing")]
    fn test_assert_error_contains_ok() {
        assert_error_contains(Ok(()), "error");
    }

    #[test]
    #[should_panic(expected = "does not contain")]
    fn test_assert_error_contains_wrong_message() {
        let result: anyhow::Result<()> = Err(ChatshardError::Config("different error".into()).into());
        assert_error_contains(result, "not present");
    }
}
