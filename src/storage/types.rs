use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Listing metadata for a stored chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    /// Unique identifier for the chat
    pub id: String,
    /// User-friendly title
    pub title: String,
    /// When the chat was created
    pub created_at: DateTime<Utc>,
    /// When the chat was last updated
    pub updated_at: DateTime<Utc>,
    /// Number of messages in the chat
    pub message_count: usize,
    /// Whether this is the current chat of the session
    pub is_current: bool,
}
