//! Chat message types for the `ProjChat` channel protocol.
//!
//! These are the JSON payloads carried inside `new-message` and
//! `message-edited` events and returned by the initial-messages REST call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message content size in bytes (16 KB).
pub const MAX_CONTENT_SIZE: usize = 16 * 1024;

/// Prefix of identifiers minted locally for optimistic placeholders.
const LOCAL_ID_PREFIX: &str = "local-";

/// Identifier of a message.
///
/// Canonical ids are assigned by the server and are opaque strings. Ids
/// created with [`MessageId::local`] are only ever used for optimistic
/// placeholders and never leave the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a server-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh canonical identifier (UUID v7, time-ordered).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Mints an identifier for a local, not yet confirmed, message.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Whether this id was minted by [`MessageId::local`].
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    /// Whether this id can have come from the server: non-empty and not in
    /// the placeholder namespace.
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        !self.0.is_empty() && !self.is_local()
    }

    /// Returns the string form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a project member (user).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps a user identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a chat channel (one per project).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Wraps a channel identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat message as exchanged with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Canonical (or, for placeholders, local) identifier.
    pub id: MessageId,
    /// Channel the message belongs to.
    pub channel_id: ChannelId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Display name of the author at send time.
    pub sender_name: String,
    /// Avatar of the author, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar_url: Option<String>,
    /// Message text.
    pub content: String,
    /// Members mentioned in `content`.
    #[serde(default)]
    pub mentioned_user_ids: Vec<UserId>,
    /// Server creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    /// Whether the message has been edited.
    #[serde(default)]
    pub is_edited: bool,
    /// Client-chosen correlation id echoed back by the server for the
    /// sender's own messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

impl Message {
    /// Checks the edit-flag invariant: `is_edited` iff `edited_at` is set.
    #[must_use]
    pub const fn edit_flags_consistent(&self) -> bool {
        self.is_edited == self.edited_at.is_some()
    }

    /// Marks the message as edited at `at` with new content.
    pub fn apply_edit(&mut self, content: String, at: DateTime<Utc>) {
        self.content = content;
        self.edited_at = Some(at);
        self.is_edited = true;
    }
}

/// Error returned when message content fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Content is empty or whitespace only.
    #[error("message content is empty")]
    Empty,
    /// Content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates outgoing message content.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] if the content is empty or only
/// whitespace, or [`ValidationError::TooLarge`] if it exceeds
/// [`MAX_CONTENT_SIZE`].
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let size = content.len();
    if size > MAX_CONTENT_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_CONTENT_SIZE,
        });
    }
    Ok(())
}
