//! Chat persistence engine
//!
//! [`ChatManager`] owns the authoritative in-memory set of chats and keeps the
//! key-value store in sync with it:
//!
//! - every mutation is applied synchronously in memory and marks state dirty
//! - a [`BackgroundScheduler`] runs incremental flush passes that write at
//!   most one unit of work per priority tier, yielding between tiers
//! - chats are stored one shard per key, listed by an index key, and lazily
//!   migrated from the legacy single-array layout

mod flush;
mod manager;
pub mod scheduler;
pub mod types;

pub use flush::{SaveState, SaveTicket};
pub use manager::ChatManager;
pub use scheduler::{BackgroundScheduler, BackgroundTask, ManualScheduler, TokioScheduler};
pub use types::{
    Chat, ContentPart, ImageUrl, Message, MessageContent, MessageUpdate, RefEntry, Role,
};
