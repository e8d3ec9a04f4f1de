//! Channel connection state machine.
//!
//! [`ConnectionManager`] owns the connection to the chat server for one
//! channel. A supervisor task holds the transport: it runs the
//! authentication handshake, joins the channel, forwards outbound commands,
//! fans inbound events out to subscribers and reconnects with exponential
//! backoff after a drop.
//!
//! ```text
//! Disconnected -connect-> Connecting -ack-> Connected -drop-> Reconnecting -ack-> Connected
//!                         Connecting -auth error-> Fatal
//!                                   Reconnecting -retries exhausted-> Fatal
//! ```
//!
//! `Fatal` is terminal until the next [`ConnectionManager::connect`].

pub mod backoff;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use projchat_proto::event::{ClientEvent, ServerEvent};
use projchat_proto::message::{ChannelId, Message, MessageId};
use projchat_proto::typing::TypingUpdate;

use crate::config::ConnectionConfig;
use crate::transport::{Connector, Transport, TransportError};

use self::backoff::Backoff;

/// Observable state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Authenticated and joined.
    Connected,
    /// Waiting for or performing a reconnect after a drop.
    Reconnecting,
    /// Authentication was rejected or retries ran out.
    Fatal,
}

impl ConnectionState {
    /// Whether the UI may compose and send messages.
    #[must_use]
    pub const fn can_compose(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The server rejected the session token.
    #[error("authentication rejected: {reason}")]
    Auth {
        /// Reason given by the server.
        reason: String,
    },

    /// Reconnection gave up.
    #[error("gave up reconnecting after {attempts} attempts")]
    RetriesExhausted {
        /// Reconnect attempts made.
        attempts: u32,
    },

    /// An inbound frame was malformed or unexpected. The frame is dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation needs a `Connected` manager.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while a connection is already running.
    #[error("a connection is already active")]
    AlreadyActive,

    /// The transport failed while sending.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Whether this error moved the manager to [`ConnectionState::Fatal`].
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::RetriesExhausted { .. })
    }
}

/// A server event for the joined channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A message was posted.
    NewMessage(Message),
    /// A message was edited.
    MessageEdited(Message),
    /// A message was deleted.
    MessageDeleted(MessageId),
    /// A member started or stopped typing.
    UserTyping(TypingUpdate),
    /// The server reported an error about a previous request.
    ServerError(String),
}

/// Event delivered to every [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// An inbound server event.
    Inbound(InboundEvent),
    /// A fatal or protocol error.
    Error(ConnectionError),
}

/// Receiving end of [`ConnectionManager::subscribe`].
///
/// Ends (`recv` returns `None`) after [`ConnectionManager::unsubscribe_all`]
/// or when the manager is dropped.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Subscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }

    /// Take an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.try_recv().ok()
    }
}

/// State shared between the manager handle and its supervisor task.
struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl Shared {
    fn publish(&self, event: &ConnectionEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!(%state, "connection state changed");
            self.publish(&ConnectionEvent::StateChanged(state));
        }
    }

    fn fail(&self, error: ConnectionError) {
        tracing::error!(err = %error, "connection failed");
        self.publish(&ConnectionEvent::Error(error));
        self.set_state(ConnectionState::Fatal);
    }

    fn protocol_error(&self, detail: String) {
        tracing::warn!(%detail, "dropping inbound frame");
        self.publish(&ConnectionEvent::Error(ConnectionError::Protocol(detail)));
    }
}

/// Commands from the manager handle to the supervisor.
enum Command {
    Send {
        event: ClientEvent,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// A running supervisor.
struct ActiveSession {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Manages the connection to one channel.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    session: Mutex<Option<ActiveSession>>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a disconnected manager.
    pub fn new(connector: C, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector: Arc::new(connector),
            config,
            shared: Arc::new(Shared {
                state_tx,
                subscribers: Mutex::new(Vec::new()),
            }),
            session: Mutex::new(None),
        }
    }

    /// Start connecting to `channel_id` with `auth_token`.
    ///
    /// Returns as soon as the supervisor task is spawned; progress is
    /// observable through [`subscribe`](Self::subscribe) and
    /// [`watch_state`](Self::watch_state). Must be called within a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::AlreadyActive`] if a previous `connect` is still
    /// running (call [`disconnect`](Self::disconnect) first).
    pub fn connect(
        &self,
        channel_id: ChannelId,
        auth_token: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Err(ConnectionError::AlreadyActive);
        }

        tracing::info!(channel = %channel_id, "connecting");
        self.shared.set_state(ConnectionState::Connecting);

        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.command_buffer.max(1));
        let supervisor = Supervisor {
            connector: Arc::clone(&self.connector),
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
            channel_id,
            auth_token: auth_token.into(),
        };
        let task = tokio::spawn(supervisor.run(cmd_rx));
        *session = Some(ActiveSession { cmd_tx, task });
        Ok(())
    }

    /// Send an event to the server. Nothing is queued while not connected.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NotConnected`] unless the state is `Connected`.
    /// - [`ConnectionError::Transport`] if the write failed; the connection
    ///   then moves to `Reconnecting`.
    pub async fn send(&self, event: ClientEvent) -> Result<(), ConnectionError> {
        if !self.state().can_compose() {
            return Err(ConnectionError::NotConnected);
        }
        let cmd_tx = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.cmd_tx.clone())
            .ok_or(ConnectionError::NotConnected)?;

        let (reply, response) = oneshot::channel();
        cmd_tx
            .send(Command::Send { event, reply })
            .await
            .map_err(|_| ConnectionError::NotConnected)?;
        response.await.map_err(|_| ConnectionError::NotConnected)?
    }

    /// Leave the channel, close the transport and return to `Disconnected`.
    ///
    /// Safe from any state and idempotent. Waits at most the configured
    /// leave timeout for the graceful part, then aborts the supervisor.
    pub async fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(ActiveSession { cmd_tx, task }) = session {
            if !task.is_finished() {
                let graceful = async {
                    let (reply, done) = oneshot::channel();
                    if cmd_tx.send(Command::Disconnect { reply }).await.is_ok() {
                        let _ = done.await;
                    }
                };
                if tokio::time::timeout(self.config.leave_timeout, graceful)
                    .await
                    .is_err()
                {
                    tracing::warn!("graceful disconnect timed out");
                }
            }
            task.abort();
            let _ = task.await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Register a new subscriber. Every subscriber receives every event
    /// published after it subscribed.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        Subscription { rx }
    }

    /// Drop every subscriber.
    pub fn unsubscribe_all(&self) {
        self.shared.subscribers.lock().clear();
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// A receiver observing state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor task
// ---------------------------------------------------------------------------

/// Result of one connection attempt.
enum Handshake<T> {
    Ready(T),
    Rejected(String),
    Failed(TransportError),
}

/// Why [`Supervisor::serve`] returned.
enum ServeOutcome {
    Dropped,
    Stopped,
}

struct Supervisor<C> {
    connector: Arc<C>,
    shared: Arc<Shared>,
    config: ConnectionConfig,
    channel_id: ChannelId,
    auth_token: String,
}

impl<C: Connector> Supervisor<C> {
    async fn run(self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut backoff = Backoff::new(self.config.reconnect.clone());

        loop {
            let Some(attempt) = self.race_commands(self.establish(), &mut cmd_rx).await else {
                return;
            };

            match attempt {
                Handshake::Ready(transport) => {
                    backoff.reset();
                    self.shared.set_state(ConnectionState::Connected);

                    let join = ClientEvent::JoinChannel {
                        channel_id: self.channel_id.clone(),
                    };
                    let outcome = match transport.send(&join).await {
                        Ok(()) => self.serve(&transport, &mut cmd_rx).await,
                        Err(e) => {
                            tracing::warn!(err = %e, "join-channel failed");
                            ServeOutcome::Dropped
                        }
                    };
                    transport.close().await;
                    match outcome {
                        ServeOutcome::Stopped => return,
                        ServeOutcome::Dropped => {
                            self.shared.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
                Handshake::Rejected(reason) => {
                    self.shared.fail(ConnectionError::Auth { reason });
                    return;
                }
                Handshake::Failed(e) => {
                    tracing::warn!(err = %e, attempt = backoff.attempts(), "connection attempt failed");
                }
            }

            let Some(delay) = backoff.next_delay() else {
                self.shared.fail(ConnectionError::RetriesExhausted {
                    attempts: backoff.attempts(),
                });
                return;
            };
            tracing::debug!(?delay, attempt = backoff.attempts(), "waiting before reconnect");
            let wait = tokio::time::sleep(delay);
            if self.race_commands(wait, &mut cmd_rx).await.is_none() {
                return;
            }
        }
    }

    /// Drive `fut` while answering commands. Sends are refused; returns
    /// `None` on disconnect.
    async fn race_commands<F: Future>(
        &self,
        fut: F,
        cmd_rx: &mut mpsc::Receiver<Command>,
    ) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Some(output),
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(Err(ConnectionError::NotConnected));
                    }
                    Some(Command::Disconnect { reply }) => {
                        let _ = reply.send(());
                        return None;
                    }
                    None => return None,
                },
            }
        }
    }

    /// Open a transport and authenticate.
    async fn establish(&self) -> Handshake<C::Conn> {
        let transport = match self.connector.open().await {
            Ok(t) => t,
            Err(e) => return Handshake::Failed(e),
        };
        let auth = ClientEvent::Authenticate {
            token: self.auth_token.clone(),
        };
        if let Err(e) = transport.send(&auth).await {
            return Handshake::Failed(e);
        }

        let reply = tokio::time::timeout(self.config.handshake_timeout, transport.recv()).await;
        let result = match reply {
            Ok(Ok(ServerEvent::Authenticated { user_id })) => {
                tracing::info!(user = %user_id, channel = %self.channel_id, "authenticated");
                return Handshake::Ready(transport);
            }
            Ok(Ok(ServerEvent::AuthFailed { reason })) => Handshake::Rejected(reason),
            Ok(Ok(other)) => Handshake::Failed(TransportError::Io(std::io::Error::other(format!(
                "unexpected {} during handshake",
                other.name()
            )))),
            Ok(Err(e)) => Handshake::Failed(e),
            Err(_) => Handshake::Failed(TransportError::Timeout),
        };
        transport.close().await;
        result
    }

    /// Pump commands and inbound events until the connection drops or a
    /// disconnect is requested.
    async fn serve(&self, transport: &C::Conn, cmd_rx: &mut mpsc::Receiver<Command>) -> ServeOutcome {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send { event, reply }) => match transport.send(&event).await {
                        Ok(()) => {
                            let _ = reply.send(Ok(()));
                        }
                        Err(TransportError::Malformed(e)) => {
                            let _ = reply.send(Err(ConnectionError::Protocol(e.to_string())));
                        }
                        Err(e) => {
                            tracing::warn!(err = %e, event = event.name(), "send failed");
                            let _ = reply.send(Err(ConnectionError::Transport(e.to_string())));
                            return ServeOutcome::Dropped;
                        }
                    },
                    Some(Command::Disconnect { reply }) => {
                        self.leave(transport).await;
                        let _ = reply.send(());
                        return ServeOutcome::Stopped;
                    }
                    None => {
                        self.leave(transport).await;
                        return ServeOutcome::Stopped;
                    }
                },
                inbound = transport.recv() => match inbound {
                    Ok(event) => self.dispatch(event),
                    Err(TransportError::Malformed(e)) => self.shared.protocol_error(e.to_string()),
                    Err(e) => {
                        tracing::warn!(err = %e, "connection dropped");
                        return ServeOutcome::Dropped;
                    }
                },
            }
        }
    }

    async fn leave(&self, transport: &C::Conn) {
        let leave = ClientEvent::LeaveChannel {
            channel_id: self.channel_id.clone(),
        };
        if let Err(e) = transport.send(&leave).await {
            tracing::debug!(err = %e, "leave-channel not delivered");
        }
    }

    fn dispatch(&self, event: ServerEvent) {
        let inbound = match event {
            ServerEvent::NewMessage { message } if message.channel_id == self.channel_id => {
                InboundEvent::NewMessage(message)
            }
            ServerEvent::MessageEdited { message } if message.channel_id == self.channel_id => {
                InboundEvent::MessageEdited(message)
            }
            ServerEvent::NewMessage { message } | ServerEvent::MessageEdited { message } => {
                self.shared.protocol_error(format!(
                    "message {} belongs to channel {}",
                    message.id, message.channel_id
                ));
                return;
            }
            ServerEvent::MessageDeleted { message_id } => InboundEvent::MessageDeleted(message_id),
            ServerEvent::UserTyping(update) => InboundEvent::UserTyping(update),
            ServerEvent::Error { reason } => {
                tracing::warn!(%reason, "server reported an error");
                InboundEvent::ServerError(reason)
            }
            other @ (ServerEvent::Authenticated { .. } | ServerEvent::AuthFailed { .. }) => {
                self.shared
                    .protocol_error(format!("unexpected {} after handshake", other.name()));
                return;
            }
        };
        self.shared.publish(&ConnectionEvent::Inbound(inbound));
    }
}
