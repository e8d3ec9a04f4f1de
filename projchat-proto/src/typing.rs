//! Typing indicator payloads for real-time keystroke status.

use serde::{Deserialize, Serialize};

use crate::message::{ChannelId, UserId};

/// Outbound typing signal for the local user (`typing` event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    /// The channel where typing is occurring.
    pub channel_id: ChannelId,
    /// Whether the user started (`true`) or stopped (`false`) typing.
    pub is_typing: bool,
}

/// Inbound typing update for another member (`user-typing` event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    /// The member who is typing (or stopped typing).
    pub user_id: UserId,
    /// Display name of that member.
    pub user_name: String,
    /// Whether the member is currently typing.
    pub is_typing: bool,
}
