//! Error types for Chatshard
//!
//! This module defines all error types used throughout the crate,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for Chatshard operations
///
/// Covers the chat persistence engine (lookups, storage failures), the
/// streaming completion client (cancellation, misfiled reasoning, malformed
/// chunks) and the ambient concerns (configuration, IO, HTTP).
#[derive(Error, Debug)]
pub enum ChatshardError {
    /// A chat id given to switch/delete/rename does not exist
    #[error("Chat not found: {0}")]
    NotFound(String),

    /// A mutation needed a current chat but none is selected
    #[error("No active chat selected")]
    NoActiveChat,

    /// The key-value store rejected a call
    #[error("Storage error: {0}")]
    Storage(String),

    /// The user cancelled an in-flight stream
    #[error("Stream aborted by user")]
    StreamAborted,

    /// The model placed reasoning tokens in the `content` field
    #[error("Reasoning detected in content field (marker: {marker})")]
    MisfiledReasoning {
        /// The configured marker that matched the start of the content
        marker: String,
    },

    /// A single SSE data line did not contain valid JSON
    #[error("Malformed stream chunk: {0}")]
    MalformedChunk(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Completion endpoint returned a non-success response
    #[error("Provider error: {0}")]
    Provider(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ChatshardError {
    /// Returns true when the error is a user cancellation rather than a failure
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::StreamAborted)
    }
}

/// Result type alias for Chatshard operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation. Callers that
/// need to branch on the failure kind use `downcast_ref::<ChatshardError>()`.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error_display() {
        let error = ChatshardError::NotFound("1700000000000".to_string());
        assert_eq!(error.to_string(), "Chat not found: 1700000000000");
    }

    #[test]
    fn test_no_active_chat_display() {
        assert_eq!(
            ChatshardError::NoActiveChat.to_string(),
            "No active chat selected"
        );
    }

    #[test]
    fn test_storage_error_display() {
        let error = ChatshardError::Storage("quota exceeded".to_string());
        assert_eq!(error.to_string(), "Storage error: quota exceeded");
    }

    #[test]
    fn test_misfiled_reasoning_display() {
        let error = ChatshardError::MisfiledReasoning {
            marker: "<think>".to_string(),
        };
        assert!(error.to_string().contains("<think>"));
    }

    #[test]
    fn test_malformed_chunk_display() {
        let error = ChatshardError::MalformedChunk("{oops".to_string());
        assert_eq!(error.to_string(), "Malformed stream chunk: {oops");
    }

    #[test]
    fn test_is_abort() {
        assert!(ChatshardError::StreamAborted.is_abort());
        assert!(!ChatshardError::NoActiveChat.is_abort());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ChatshardError = io_error.into();
        assert!(matches!(error, ChatshardError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{invalid json}").unwrap_err();
        let error: ChatshardError = json_error.into();
        assert!(matches!(error, ChatshardError::Serialization(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: : yaml").unwrap_err();
        let error: ChatshardError = yaml_error.into();
        assert!(matches!(error, ChatshardError::Yaml(_)));
    }

    #[test]
    fn test_downcast_from_anyhow() {
        let err: anyhow::Error = ChatshardError::NotFound("x".to_string()).into();
        assert!(matches!(
            err.downcast_ref::<ChatshardError>(),
            Some(ChatshardError::NotFound(id)) if id == "x"
        ));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ChatshardError>();
    }
}
