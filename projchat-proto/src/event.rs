//! Channel events exchanged over the real-time connection.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`.
//! [`ClientEvent`] flows client → server, [`ServerEvent`] server → client.

use serde::{Deserialize, Serialize};

use crate::message::{ChannelId, Message, MessageId, UserId};
use crate::typing::{TypingSignal, TypingUpdate};

/// Payload of a `send-message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Target channel.
    pub channel_id: ChannelId,
    /// Message text.
    pub content: String,
    /// Members mentioned in `content`.
    #[serde(default)]
    pub mentioned_user_ids: Vec<UserId>,
    /// Correlation id the server echoes back on the broadcast copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// Events sent by a client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// First frame of every connection.
    Authenticate {
        /// Session token issued by the dashboard's auth service.
        token: String,
    },
    /// Start receiving broadcasts for a channel.
    JoinChannel {
        /// The channel to join.
        channel_id: ChannelId,
    },
    /// Stop receiving broadcasts for a channel.
    LeaveChannel {
        /// The channel to leave.
        channel_id: ChannelId,
    },
    /// Post a message to a channel.
    SendMessage(OutgoingMessage),
    /// Local typing state changed.
    Typing(TypingSignal),
}

impl ClientEvent {
    /// The wire name of this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::JoinChannel { .. } => "join-channel",
            Self::LeaveChannel { .. } => "leave-channel",
            Self::SendMessage(_) => "send-message",
            Self::Typing(_) => "typing",
        }
    }
}

// Hand-written so the auth token never ends up in logs.
impl std::fmt::Debug for ClientEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authenticate { .. } => f
                .debug_struct("Authenticate")
                .field("token", &"<redacted>")
                .finish(),
            Self::JoinChannel { channel_id } => f
                .debug_struct("JoinChannel")
                .field("channel_id", channel_id)
                .finish(),
            Self::LeaveChannel { channel_id } => f
                .debug_struct("LeaveChannel")
                .field("channel_id", channel_id)
                .finish(),
            Self::SendMessage(msg) => f.debug_tuple("SendMessage").field(msg).finish(),
            Self::Typing(signal) => f.debug_tuple("Typing").field(signal).finish(),
        }
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Handshake accepted.
    Authenticated {
        /// Identity the token resolved to.
        user_id: UserId,
    },
    /// Handshake rejected. The server closes the connection afterwards.
    AuthFailed {
        /// Human-readable reason.
        reason: String,
    },
    /// A message was posted to a joined channel.
    NewMessage {
        /// The message with its canonical id.
        message: Message,
    },
    /// A message was edited.
    MessageEdited {
        /// The full, updated message.
        message: Message,
    },
    /// A message was deleted.
    MessageDeleted {
        /// Id of the deleted message.
        message_id: MessageId,
    },
    /// Another member's typing state changed.
    UserTyping(TypingUpdate),
    /// The server reports a non-fatal error.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

impl ServerEvent {
    /// The wire name of this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::AuthFailed { .. } => "auth-failed",
            Self::NewMessage { .. } => "new-message",
            Self::MessageEdited { .. } => "message-edited",
            Self::MessageDeleted { .. } => "message-deleted",
            Self::UserTyping(_) => "user-typing",
            Self::Error { .. } => "error",
        }
    }
}
