//! Chat session layer for `ProjChat`.
//!
//! [`ChatSession`] is what a UI talks to. It composes the
//! [`ConnectionManager`], the [`MessageStore`](store::MessageStore), the
//! [`TypingPresenceTracker`](typing::TypingPresenceTracker) and the mention
//! helpers for one open channel.
//!
//! # Tasks
//!
//! ```text
//! ConnectionManager ── ConnectionEvent ──> pump ── SessionEvent ──> UI
//!        ^                                  │
//!        │                                  └─ store + tracker (one lock per event)
//!        └── typing forwarder <── LocalTyping ── tracker
//! ```
//!
//! Every inbound event is applied to the store and tracker under a single
//! lock acquisition, so no reader ever observes a half-applied event.

pub mod mention;
pub mod store;
pub mod typing;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use projchat_proto::event::{ClientEvent, OutgoingMessage};
use projchat_proto::member::Member;
use projchat_proto::message::{ChannelId, Message, MessageId, UserId, ValidationError, validate_content};
use projchat_proto::typing::TypingSignal;

use crate::api::{ApiError, ChatApi};
use crate::config::{ConnectionConfig, TypingConfig};
use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState, InboundEvent,
    Subscription,
};
use crate::transport::Connector;

use self::mention::{MentionInsertion, MentionTrigger, Roster};
use self::store::{DayLabel, MessageStore};
use self::typing::{LocalTyping, TypingEntry, TypingPresenceTracker};

/// Errors surfaced by [`ChatSession`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// Message content was rejected before any network call.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The channel connection failed or is not usable.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A REST call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The server reported an error about a previous request.
    #[error("server error: {0}")]
    Server(String),
}

/// Events delivered to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A message was added or changed.
    MessageUpserted(Message),
    /// A message (or a failed placeholder) was removed.
    MessageRemoved(MessageId),
    /// The set of remote typers changed.
    TypingChanged(Vec<TypingEntry>),
    /// The connection state changed; composing is allowed only when
    /// [`ConnectionState::can_compose`] holds.
    ConnectionStateChanged(ConnectionState),
    /// A fatal, protocol or server error to show to the user.
    Error(ChatError),
}

/// Parameters of a chat session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Channel to open.
    pub channel_id: ChannelId,
    /// The logged-in member.
    pub user_id: UserId,
    /// Session token for the connection handshake.
    pub auth_token: String,
    /// Typing presence settings.
    pub typing: TypingConfig,
    /// Capacity of the [`SessionEvent`] queue.
    pub event_buffer: usize,
}

/// Store and tracker, mutated together.
struct SessionState {
    store: MessageStore,
    typing: TypingPresenceTracker,
}

/// One open project chat.
pub struct ChatSession<C: Connector, A: ChatApi> {
    channel_id: ChannelId,
    user_id: UserId,
    me: Option<Member>,
    roster: Roster,
    connection: Arc<ConnectionManager<C>>,
    api: A,
    state: Arc<Mutex<SessionState>>,
    events: mpsc::Sender<SessionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Connector, A: ChatApi> ChatSession<C, A> {
    /// Open a session: fetch the roster and the initial messages, then start
    /// connecting to the channel.
    ///
    /// Returns the session and the queue of [`SessionEvent`]s for the UI.
    ///
    /// # Errors
    ///
    /// [`ChatError::Api`] if either REST fetch fails.
    pub async fn open(
        config: SessionConfig,
        connection_config: ConnectionConfig,
        connector: C,
        api: A,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), ChatError> {
        let roster: Roster = api.fetch_roster(&config.channel_id).await?.into();
        let initial = api.fetch_initial_messages(&config.channel_id).await?;

        let mut store = MessageStore::new();
        let loaded = store.load(initial);
        tracing::info!(
            channel = %config.channel_id,
            messages = loaded,
            members = roster.len(),
            "chat session opened"
        );

        let sweep_interval = config.typing.sweep_interval;
        let (typing, typing_rx) = TypingPresenceTracker::new(config.typing);
        let state = Arc::new(Mutex::new(SessionState { store, typing }));

        let connection = Arc::new(ConnectionManager::new(connector, connection_config));
        let subscription = connection.subscribe();
        let (events, events_rx) = mpsc::channel(config.event_buffer.max(1));

        let pump = tokio::spawn(pump(
            subscription,
            Arc::clone(&state),
            events.clone(),
            config.user_id.clone(),
            sweep_interval,
        ));
        let forwarder = tokio::spawn(forward_typing(
            typing_rx,
            Arc::clone(&connection),
            config.channel_id.clone(),
        ));

        connection.connect(config.channel_id.clone(), config.auth_token)?;

        let me = roster.iter().find(|m| m.id == config.user_id).cloned();
        let session = Self {
            channel_id: config.channel_id,
            user_id: config.user_id,
            me,
            roster,
            connection,
            api,
            state,
            events,
            tasks: Mutex::new(vec![pump, forwarder]),
        };
        Ok((session, events_rx))
    }

    /// Send a message to the channel.
    ///
    /// The content is validated first; nothing touches the network if it is
    /// empty, whitespace-only or too large. Mentions are extracted from the
    /// text against the roster. An optimistic placeholder is inserted and
    /// announced right away, and replaced once the server broadcast arrives.
    /// Returns the placeholder.
    ///
    /// # Errors
    ///
    /// - [`ChatError::Validation`] for bad content.
    /// - [`ChatError::Connection`] if not connected or the write failed; the
    ///   placeholder is removed again in that case.
    pub async fn send(&self, content: &str) -> Result<Message, ChatError> {
        validate_content(content)?;
        if !self.connection.state().can_compose() {
            return Err(ConnectionError::NotConnected.into());
        }

        let mentioned_user_ids = mention::extract_mentioned_user_ids(content, &self.roster);
        let client_message_id = uuid::Uuid::now_v7().to_string();
        let placeholder = Message {
            id: MessageId::local(),
            channel_id: self.channel_id.clone(),
            sender_id: self.user_id.clone(),
            sender_name: self
                .me
                .as_ref()
                .map_or_else(|| self.user_id.to_string(), |m| m.name.clone()),
            sender_avatar_url: self.me.as_ref().and_then(|m| m.avatar_url.clone()),
            content: content.to_string(),
            mentioned_user_ids: mentioned_user_ids.clone(),
            created_at: Utc::now(),
            edited_at: None,
            is_edited: false,
            client_message_id: Some(client_message_id.clone()),
        };

        {
            let mut state = self.state.lock();
            state.store.insert_pending(placeholder.clone());
            state.typing.local_signal(false);
        }
        let _ = self
            .events
            .send(SessionEvent::MessageUpserted(placeholder.clone()))
            .await;

        let event = ClientEvent::SendMessage(OutgoingMessage {
            channel_id: self.channel_id.clone(),
            content: content.to_string(),
            mentioned_user_ids,
            client_message_id: Some(client_message_id),
        });
        if let Err(e) = self.connection.send(event).await {
            tracing::warn!(err = %e, "send-message failed");
            let discarded = self.state.lock().store.discard_pending(&placeholder.id);
            if discarded {
                let _ = self
                    .events
                    .send(SessionEvent::MessageRemoved(placeholder.id.clone()))
                    .await;
            }
            return Err(e.into());
        }
        Ok(placeholder)
    }

    /// Report local typing activity (`true` on keystroke, `false` when the
    /// input is cleared or blurred).
    pub fn set_typing(&self, is_typing: bool) {
        self.state.lock().typing.local_signal(is_typing);
    }

    /// Delete a message through the REST API and drop it locally.
    ///
    /// A placeholder only exists on this client, so it is discarded without
    /// a REST call.
    ///
    /// # Errors
    ///
    /// [`ChatError::Api`] if the REST call fails; the store is untouched.
    pub async fn delete_message(&self, message_id: &MessageId) -> Result<(), ChatError> {
        if message_id.is_local() {
            let discarded = self.state.lock().store.discard_pending(message_id);
            if discarded {
                let _ = self
                    .events
                    .send(SessionEvent::MessageRemoved(message_id.clone()))
                    .await;
            }
            return Ok(());
        }
        self.api.delete_message(&self.channel_id, message_id).await?;
        let removed = self.state.lock().store.remove(message_id).is_some();
        if removed {
            let _ = self
                .events
                .send(SessionEvent::MessageRemoved(message_id.clone()))
                .await;
        }
        Ok(())
    }

    /// Snapshot of the message log in display order.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().store.iter().cloned().collect()
    }

    /// Number of messages in the log.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.state.lock().store.len()
    }

    /// The message log partitioned into calendar days of `now`'s time zone.
    #[must_use]
    pub fn grouped_by_day<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Vec<(DayLabel, Vec<Message>)> {
        let state = self.state.lock();
        state
            .store
            .grouped_by_day(now)
            .into_iter()
            .map(|g| (g.label, g.messages.into_iter().cloned().collect()))
            .collect()
    }

    /// Remote members currently typing, oldest first.
    #[must_use]
    pub fn active_typers(&self) -> Vec<TypingEntry> {
        self.state.lock().typing.active_typers(&self.user_id)
    }

    /// The channel roster.
    #[must_use]
    pub const fn roster(&self) -> &Roster {
        &self.roster
    }

    /// The REST collaborator.
    #[must_use]
    pub const fn api(&self) -> &A {
        &self.api
    }

    /// The open channel.
    #[must_use]
    pub const fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// The connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// A receiver observing connection state changes.
    #[must_use]
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// The `@token` being typed at `cursor`, if any.
    #[must_use]
    pub fn detect_trigger(&self, text: &str, cursor: usize) -> Option<MentionTrigger> {
        mention::detect_trigger(text, cursor)
    }

    /// Roster members matching `token`.
    #[must_use]
    pub fn query_candidates(&self, token: &str) -> Vec<&Member> {
        mention::query_candidates(&self.roster, token)
    }

    /// Complete the mention at `cursor` with `member`.
    #[must_use]
    pub fn insert_mention(&self, text: &str, cursor: usize, member: &Member) -> Option<MentionInsertion> {
        mention::insert_mention(text, cursor, member)
    }

    /// Close the session: cancel the typing timer, unsubscribe from the
    /// connection, leave the channel and close the transport.
    pub async fn dispose(&self) {
        self.state.lock().typing.dispose();
        self.connection.unsubscribe_all();
        self.connection.disconnect().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(channel = %self.channel_id, "chat session closed");
    }
}

impl<C: Connector, A: ChatApi> Drop for ChatSession<C, A> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Apply connection events to the store and tracker and translate them
/// into session events. Also sweeps lapsed typing indicators.
async fn pump(
    mut subscription: Subscription,
    state: Arc<Mutex<SessionState>>,
    events: mpsc::Sender<SessionEvent>,
    self_id: UserId,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let outgoing = tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => apply(&state, &self_id, event),
                None => break,
            },
            _ = sweep.tick() => sweep_typing(&state, &self_id),
        };
        for event in outgoing {
            // A dropped receiver only means nobody is watching; keep the
            // store current.
            let _ = events.send(event).await;
        }
    }
    tracing::debug!("session pump exiting");
}

fn apply(state: &Mutex<SessionState>, self_id: &UserId, event: ConnectionEvent) -> Vec<SessionEvent> {
    let inbound = match event {
        ConnectionEvent::StateChanged(s) => return vec![SessionEvent::ConnectionStateChanged(s)],
        ConnectionEvent::Error(e) => return vec![SessionEvent::Error(ChatError::Connection(e))],
        ConnectionEvent::Inbound(inbound) => inbound,
    };

    let mut state = state.lock();
    let mut out = Vec::new();
    match inbound {
        InboundEvent::NewMessage(message) => {
            let reconciled = state.store.reconcile(message.clone());
            if let Some(placeholder) = reconciled.replaced {
                out.push(SessionEvent::MessageRemoved(placeholder));
            }
            if reconciled.outcome.changed() {
                out.push(SessionEvent::MessageUpserted(message));
            }
        }
        InboundEvent::MessageEdited(message) => {
            if state.store.apply_edit(message.clone()).changed() {
                out.push(SessionEvent::MessageUpserted(message));
            }
        }
        InboundEvent::MessageDeleted(id) => {
            if state.store.remove(&id).is_some() {
                out.push(SessionEvent::MessageRemoved(id));
            }
        }
        InboundEvent::UserTyping(update) => {
            if &update.user_id != self_id
                && state
                    .typing
                    .remote_update(update.user_id, update.user_name, update.is_typing)
            {
                out.push(SessionEvent::TypingChanged(state.typing.active_typers(self_id)));
            }
        }
        InboundEvent::ServerError(reason) => {
            out.push(SessionEvent::Error(ChatError::Server(reason)));
        }
    }
    out
}

fn sweep_typing(state: &Mutex<SessionState>, self_id: &UserId) -> Vec<SessionEvent> {
    let mut state = state.lock();
    if state.typing.prune_expired(Instant::now()) {
        vec![SessionEvent::TypingChanged(state.typing.active_typers(self_id))]
    } else {
        Vec::new()
    }
}

/// Send local typing signals to the channel while connected.
async fn forward_typing<C: Connector>(
    mut signals: mpsc::UnboundedReceiver<LocalTyping>,
    connection: Arc<ConnectionManager<C>>,
    channel_id: ChannelId,
) {
    while let Some(signal) = signals.recv().await {
        if !connection.state().can_compose() {
            continue;
        }
        let event = ClientEvent::Typing(TypingSignal {
            channel_id: channel_id.clone(),
            is_typing: signal.is_typing(),
        });
        if let Err(e) = connection.send(event).await {
            tracing::debug!(err = %e, "typing signal not sent");
        }
    }
}
