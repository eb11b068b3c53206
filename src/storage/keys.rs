//! Storage key layout
//!
//! The in-memory chat map is authoritative; these keys are its derived,
//! sharded projection.

/// Key holding the JSON array of chat ids that should have shards
pub const INDEX_KEY: &str = "chatIndex";

/// Prefix of the per-chat shard keys
pub const SHARD_PREFIX: &str = "chat_";

/// Prefix of the per-session current chat pointer
pub const SESSION_CURRENT_PREFIX: &str = "currentChatId_";

/// Process-wide "last active chat" pointer
pub const LAST_ACTIVE_KEY: &str = "lastActiveChatId";

/// Pre-sharding layout: one array holding every chat
pub const LEGACY_CHATS_KEY: &str = "chatHistory";

/// Pre-sharding global current chat pointer
pub const LEGACY_CURRENT_KEY: &str = "currentChatId";

/// Layout version marker, written once migration has completed
pub const VERSION_KEY: &str = "storageVersion";

/// Layout version written by this crate
pub const STORAGE_VERSION: u64 = 2;

/// Shard key for a chat id
///
/// # Examples
///
/// ```
/// use chatshard::storage::keys::shard_key;
///
/// assert_eq!(shard_key("1700000000000"), "chat_1700000000000");
/// ```
pub fn shard_key(chat_id: &str) -> String {
    format!("{}{}", SHARD_PREFIX, chat_id)
}

/// Current chat pointer key for one session
pub fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_CURRENT_PREFIX, session_id)
}

/// Chat id encoded in a shard key, if `key` is one
pub fn chat_id_from_shard_key(key: &str) -> Option<&str> {
    key.strip_prefix(SHARD_PREFIX).filter(|id| !id.is_empty())
}
