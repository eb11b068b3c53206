//! Chat data model
//!
//! These types are both the in-memory model owned by
//! [`ChatManager`](crate::chat::ChatManager) and the JSON persisted in each
//! shard. The field names follow the stored layout (`createdAt`,
//! `reasoning_content`, ...), so existing shards stay readable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt
    System,
    /// Human user
    User,
    /// Model output
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// Image reference inside a multi-part message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// Image location (http(s) or data URL)
    pub url: String,
}

/// One part of a multi-part message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text
    Text { text: String },
    /// Image attachment
    ImageUrl { image_url: ImageUrl },
}

/// Message body: either plain text or a list of typed parts
///
/// Serialized untagged, so a stored string and a stored part array both
/// deserialize into the matching variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text body
    Text(String),
    /// Multi-part body (text and images)
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text of the message, joining the text parts of a multi-part body
    ///
    /// # Examples
    ///
    /// ```
    /// use chatshard::chat::{ContentPart, ImageUrl, MessageContent};
    ///
    /// let content = MessageContent::Parts(vec![
    ///     ContentPart::Text { text: "look".to_string() },
    ///     ContentPart::ImageUrl { image_url: ImageUrl { url: "data:,".to_string() } },
    ///     ContentPart::Text { text: "here".to_string() },
    /// ]);
    /// assert_eq!(content.text(), "look\nhere");
    /// ```
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// True when the body holds no text and no parts
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author role
    pub role: Role,
    /// Message body
    #[serde(default)]
    pub content: MessageContent,
    /// Reasoning text streamed separately from the answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Set while an assistant message is still being streamed
    #[serde(default, skip_serializing_if = "is_false")]
    pub updating: bool,
}

impl Message {
    /// Creates a settled message with plain-text content
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning_content: None,
            updating: false,
        }
    }

    /// Creates a new user message
    ///
    /// # Examples
    ///
    /// ```
    /// use chatshard::chat::{Message, Role};
    ///
    /// let msg = Message::user("Hello, assistant!");
    /// assert_eq!(msg.role, Role::User);
    /// ```
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new assistant message
    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a new system message
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }

    /// Empty assistant message that anchors incoming stream content
    pub fn placeholder() -> Self {
        Self {
            updating: true,
            ..Self::assistant("")
        }
    }
}

/// Partial message used to merge a stream snapshot into the last message
///
/// Each present field replaces the stored value; absent fields are left
/// untouched. Values are full accumulated snapshots, never deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageUpdate {
    /// Replacement content
    pub content: Option<String>,
    /// Replacement reasoning text
    pub reasoning_content: Option<String>,
    /// New value of the `updating` marker
    pub updating: Option<bool>,
}

impl MessageUpdate {
    /// Update that only marks the last message as settled
    pub fn settled() -> Self {
        Self {
            updating: Some(false),
            ..Self::default()
        }
    }

    /// Apply the update to `message`
    pub fn apply_to(&self, message: &mut Message) {
        if let Some(content) = &self.content {
            message.content = MessageContent::Text(content.clone());
        }
        if let Some(reasoning) = &self.reasoning_content {
            message.reasoning_content = Some(reasoning.clone());
        }
        if let Some(updating) = self.updating {
            message.updating = updating;
        }
    }
}

/// Reference from a chat to an external cached resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefEntry {
    /// Storage key of the referenced resource
    pub key: String,
    /// Video the resource was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    /// Language of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    /// When the reference was last refreshed
    pub updated_at: DateTime<Utc>,
}

impl RefEntry {
    /// Creates a reference to `key` stamped with the current time
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            video_id: None,
            lang: None,
            updated_at: Utc::now(),
        }
    }
}

/// One conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    /// Creation-timestamp-derived unique id
    pub id: String,
    /// Display title
    pub title: String,
    /// Ordered messages; only the last may be `updating`
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation or switch
    pub updated_at: DateTime<Utc>,
    /// External resources referenced by this chat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_refs: Option<Vec<RefEntry>>,
}

impl Chat {
    /// Creates an empty chat
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            transcript_refs: None,
        }
    }

    /// Record a mutation
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Keys of every external resource this chat references
    pub fn ref_keys(&self) -> impl Iterator<Item = &str> {
        self.transcript_refs
            .iter()
            .flatten()
            .map(|entry| entry.key.as_str())
    }
}
