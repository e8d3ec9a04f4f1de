//! Channel registry for the broker.
//!
//! Tracks which connections have joined each channel and keeps the channel's
//! message log. Channels are created on first use and live for the lifetime
//! of the process.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use projchat_proto::message::{ChannelId, Message, MessageId};
use tokio::sync::RwLock;

/// Identifier the broker assigns to each accepted WebSocket.
pub type ConnectionId = u64;

#[derive(Debug, Default)]
struct Channel {
    subscribers: HashSet<ConnectionId>,
    log: Vec<Message>,
}

/// In-memory channel directory.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Channel>>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `conn` to `channel_id`. Returns `false` if it already was.
    pub async fn join(&self, channel_id: &ChannelId, conn: ConnectionId) -> bool {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel_id.clone())
            .or_default()
            .subscribers
            .insert(conn)
    }

    /// Unsubscribe `conn` from `channel_id`. Returns `false` if it was not
    /// subscribed.
    pub async fn leave(&self, channel_id: &ChannelId, conn: ConnectionId) -> bool {
        let mut channels = self.channels.write().await;
        channels
            .get_mut(channel_id)
            .is_some_and(|c| c.subscribers.remove(&conn))
    }

    /// Unsubscribe `conn` everywhere, returning the channels it had joined.
    pub async fn leave_all(&self, conn: ConnectionId) -> Vec<ChannelId> {
        let mut channels = self.channels.write().await;
        channels
            .iter_mut()
            .filter_map(|(id, c)| c.subscribers.remove(&conn).then(|| id.clone()))
            .collect()
    }

    /// Whether `conn` has joined `channel_id`.
    pub async fn is_subscribed(&self, channel_id: &ChannelId, conn: ConnectionId) -> bool {
        let channels = self.channels.read().await;
        channels
            .get(channel_id)
            .is_some_and(|c| c.subscribers.contains(&conn))
    }

    /// Connections currently subscribed to `channel_id`.
    pub async fn subscribers(&self, channel_id: &ChannelId) -> Vec<ConnectionId> {
        let channels = self.channels.read().await;
        channels
            .get(channel_id)
            .map(|c| c.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Append a message to its channel's log.
    pub async fn append(&self, message: Message) {
        let mut channels = self.channels.write().await;
        channels
            .entry(message.channel_id.clone())
            .or_default()
            .log
            .push(message);
    }

    /// The channel's log in posting order.
    pub async fn messages(&self, channel_id: &ChannelId) -> Vec<Message> {
        let channels = self.channels.read().await;
        channels
            .get(channel_id)
            .map(|c| c.log.clone())
            .unwrap_or_default()
    }

    /// Replace a message's content, returning the updated copy.
    pub async fn edit(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        content: String,
        at: DateTime<Utc>,
    ) -> Option<Message> {
        let mut channels = self.channels.write().await;
        let message = channels
            .get_mut(channel_id)?
            .log
            .iter_mut()
            .find(|m| &m.id == message_id)?;
        message.apply_edit(content, at);
        Some(message.clone())
    }

    /// Remove a message from the log. Returns `false` if it was not there.
    pub async fn delete(&self, channel_id: &ChannelId, message_id: &MessageId) -> bool {
        let mut channels = self.channels.write().await;
        let Some(channel) = channels.get_mut(channel_id) else {
            return false;
        };
        let before = channel.log.len();
        channel.log.retain(|m| &m.id != message_id);
        channel.log.len() != before
    }
}
