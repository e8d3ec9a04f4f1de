//! Broker core: shared state, WebSocket handler and channel fan-out.
//!
//! Each WebSocket must authenticate with its first frame. After that the
//! connection may join channels, post messages and signal typing. Posted
//! messages get a broker-minted id and timestamp and are broadcast to every
//! subscriber of the channel, the sender included. Typing signals go to the
//! other subscribers only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use projchat_proto::codec;
use projchat_proto::event::{ClientEvent, OutgoingMessage, ServerEvent};
use projchat_proto::member::Member;
use projchat_proto::message::{ChannelId, Message, MessageId};
use projchat_proto::typing::{TypingSignal, TypingUpdate};
use tokio::sync::{RwLock, mpsc};

use crate::channels::{ChannelRegistry, ConnectionId};
use crate::config::{Account, BrokerConfig};

struct Peer {
    member: Member,
    sender: mpsc::UnboundedSender<WsMessage>,
}

/// Shared broker state: live connections, channels and accounts.
pub struct BrokerState {
    connections: RwLock<HashMap<ConnectionId, Peer>>,
    /// Channel subscriptions and message logs.
    pub channels: ChannelRegistry,
    accounts: Vec<Account>,
    max_content_size: usize,
    auth_timeout: Duration,
    next_connection: AtomicU64,
}

impl BrokerState {
    /// State with the given accounts and default limits.
    #[must_use]
    pub fn new(accounts: Vec<Account>) -> Self {
        let defaults = BrokerConfig::default();
        Self {
            connections: RwLock::new(HashMap::new()),
            channels: ChannelRegistry::new(),
            accounts,
            max_content_size: defaults.max_content_size,
            auth_timeout: defaults.auth_timeout,
            next_connection: AtomicU64::new(1),
        }
    }

    /// State built from a resolved [`BrokerConfig`].
    #[must_use]
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            max_content_size: config.max_content_size,
            auth_timeout: config.auth_timeout,
            ..Self::new(config.accounts.clone())
        }
    }

    /// The member a bearer token belongs to.
    #[must_use]
    pub fn authenticate(&self, token: &str) -> Option<&Member> {
        self.accounts
            .iter()
            .find(|a| a.token == token)
            .map(|a| &a.member)
    }

    /// Every known member, in configuration order.
    #[must_use]
    pub fn roster(&self) -> Vec<Member> {
        self.accounts.iter().map(|a| a.member.clone()).collect()
    }

    /// Number of authenticated connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn register(&self, member: Member, sender: mpsc::UnboundedSender<WsMessage>) -> ConnectionId {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections
            .write()
            .await
            .insert(id, Peer { member, sender });
        id
    }

    async fn unregister(&self, conn: ConnectionId) {
        let Some(peer) = self.connections.write().await.remove(&conn) else {
            return;
        };
        for channel_id in self.channels.leave_all(conn).await {
            self.typing_stopped(&channel_id, &peer.member).await;
        }
    }

    /// Tell the remaining subscribers that `member` is no longer typing.
    async fn typing_stopped(&self, channel_id: &ChannelId, member: &Member) {
        let stop = ServerEvent::UserTyping(TypingUpdate {
            user_id: member.id.clone(),
            user_name: member.name.clone(),
            is_typing: false,
        });
        self.broadcast(channel_id, &stop, None).await;
    }

    /// Send a WebSocket Close frame to every connection.
    ///
    /// Each writer task forwards the frame, so clients see the connection
    /// drop. Used for shutdown and to exercise client reconnects.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (conn, peer) in conns.iter() {
            tracing::info!(conn, user = %peer.member.id, "sending close frame");
            let _ = peer.sender.send(WsMessage::Close(None));
        }
    }

    async fn send_to(&self, conn: ConnectionId, event: &ServerEvent) {
        let Some(frame) = encode_frame(event) else {
            return;
        };
        let conns = self.connections.read().await;
        if let Some(peer) = conns.get(&conn) {
            let _ = peer.sender.send(frame);
        }
    }

    /// Deliver `event` to every subscriber of `channel_id` except `skip`.
    async fn broadcast(&self, channel_id: &ChannelId, event: &ServerEvent, skip: Option<ConnectionId>) {
        let Some(frame) = encode_frame(event) else {
            return;
        };
        let subscribers = self.channels.subscribers(channel_id).await;
        let conns = self.connections.read().await;
        let mut delivered = 0usize;
        for conn in subscribers {
            if Some(conn) == skip {
                continue;
            }
            if let Some(peer) = conns.get(&conn)
                && peer.sender.send(frame.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        tracing::debug!(channel = %channel_id, event = event.name(), delivered, "broadcast");
    }

    /// Accept a message from `sender`, log it and broadcast `new-message`.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason if the content is empty or larger
    /// than the configured limit.
    pub async fn post_message(
        &self,
        sender: &Member,
        outgoing: OutgoingMessage,
    ) -> Result<Message, String> {
        if outgoing.content.trim().is_empty() {
            return Err("message content is empty".to_string());
        }
        let size = outgoing.content.len();
        if size > self.max_content_size {
            return Err(format!(
                "message too large ({size} bytes, max {} bytes)",
                self.max_content_size
            ));
        }

        let message = Message {
            id: MessageId::generate(),
            channel_id: outgoing.channel_id,
            sender_id: sender.id.clone(),
            sender_name: sender.name.clone(),
            sender_avatar_url: sender.avatar_url.clone(),
            content: outgoing.content,
            mentioned_user_ids: outgoing.mentioned_user_ids,
            created_at: Utc::now(),
            edited_at: None,
            is_edited: false,
            client_message_id: outgoing.client_message_id,
        };
        self.channels.append(message.clone()).await;
        tracing::info!(
            channel = %message.channel_id,
            message_id = %message.id,
            sender = %sender.id,
            "message posted"
        );
        self.broadcast(
            &message.channel_id,
            &ServerEvent::NewMessage {
                message: message.clone(),
            },
            None,
        )
        .await;
        Ok(message)
    }

    /// Edit a logged message and broadcast `message-edited`.
    pub async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        content: impl Into<String>,
    ) -> Option<Message> {
        let message = self
            .channels
            .edit(channel_id, message_id, content.into(), Utc::now())
            .await?;
        self.broadcast(
            channel_id,
            &ServerEvent::MessageEdited {
                message: message.clone(),
            },
            None,
        )
        .await;
        Some(message)
    }

    /// Delete a logged message and broadcast `message-deleted`.
    ///
    /// Returns `false` if the message does not exist.
    pub async fn delete_message(&self, channel_id: &ChannelId, message_id: &MessageId) -> bool {
        if !self.channels.delete(channel_id, message_id).await {
            return false;
        }
        tracing::info!(channel = %channel_id, message_id = %message_id, "message deleted");
        self.broadcast(
            channel_id,
            &ServerEvent::MessageDeleted {
                message_id: message_id.clone(),
            },
            None,
        )
        .await;
        true
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Wait for `authenticate` within the configured timeout.
/// 2. Reply `authenticated`, or `auth-failed` and close.
/// 3. Serve channel events until either side closes.
/// 4. Unsubscribe from every joined channel.
pub async fn handle_socket(socket: WebSocket, state: Arc<BrokerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let handshake = tokio::time::timeout(state.auth_timeout, wait_for_authenticate(&mut ws_receiver))
        .await
        .unwrap_or_else(|_| Err("authentication timed out".to_string()));
    let member = match handshake {
        Ok(token) => match state.authenticate(&token) {
            Some(member) => member.clone(),
            None => {
                reject(&mut ws_sender, "invalid token").await;
                return;
            }
        },
        Err(reason) => {
            reject(&mut ws_sender, &reason).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let conn = state.register(member.clone(), tx).await;

    let ack = ServerEvent::Authenticated {
        user_id: member.id.clone(),
    };
    let sent = match encode_frame(&ack) {
        Some(frame) => ws_sender.send(frame).await.is_ok(),
        None => false,
    };
    if !sent {
        tracing::error!(conn, user = %member.id, "failed to send authenticated ack");
        state.unregister(conn).await;
        return;
    }
    tracing::info!(conn, user = %member.id, "connection authenticated");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conn, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_text(conn, &member, text.as_str(), &reader_state).await;
                }
                WsMessage::Binary(_) => {
                    let err = ServerEvent::Error {
                        reason: "binary frames are not supported".to_string(),
                    };
                    reader_state.send_to(conn, &err).await;
                }
                WsMessage::Close(_) => {
                    tracing::info!(conn, "received close frame");
                    break;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(conn).await;
    tracing::info!(conn, "connection closed");
}

/// Waits for the first text frame and expects it to be `authenticate`.
///
/// Returns the token, or the reason to report in `auth-failed`.
async fn wait_for_authenticate(
    receiver: &mut (impl StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin),
) -> Result<String, String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Text(text) => {
                return match codec::decode_client(text.as_str()) {
                    Ok(ClientEvent::Authenticate { token }) => Ok(token),
                    Ok(other) => Err(format!("expected authenticate, got {}", other.name())),
                    Err(e) => Err(e.to_string()),
                };
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err("connection closed before authentication".to_string())
}

async fn reject(
    ws_sender: &mut (impl SinkExt<WsMessage, Error = axum::Error> + Unpin),
    reason: &str,
) {
    tracing::warn!(%reason, "rejecting connection");
    let failed = ServerEvent::AuthFailed {
        reason: reason.to_string(),
    };
    if let Some(frame) = encode_frame(&failed) {
        let _ = ws_sender.send(frame).await;
    }
    let _ = ws_sender.send(WsMessage::Close(None)).await;
}

/// Handles one text frame from an authenticated connection.
async fn handle_text(conn: ConnectionId, member: &Member, text: &str, state: &BrokerState) {
    let event = match codec::decode_client(text) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(conn, error = %e, "failed to decode client event");
            let err = ServerEvent::Error {
                reason: format!("malformed event: {e}"),
            };
            state.send_to(conn, &err).await;
            return;
        }
    };

    match event {
        ClientEvent::Authenticate { .. } => {
            let err = ServerEvent::Error {
                reason: "already authenticated".to_string(),
            };
            state.send_to(conn, &err).await;
        }
        ClientEvent::JoinChannel { channel_id } => {
            state.channels.join(&channel_id, conn).await;
            tracing::info!(conn, user = %member.id, channel = %channel_id, "joined channel");
        }
        ClientEvent::LeaveChannel { channel_id } => {
            if state.channels.leave(&channel_id, conn).await {
                state.typing_stopped(&channel_id, member).await;
            }
            tracing::info!(conn, user = %member.id, channel = %channel_id, "left channel");
        }
        ClientEvent::SendMessage(outgoing) => {
            if !state.channels.is_subscribed(&outgoing.channel_id, conn).await {
                let err = ServerEvent::Error {
                    reason: format!("join {} before sending", outgoing.channel_id),
                };
                state.send_to(conn, &err).await;
                return;
            }
            if let Err(reason) = state.post_message(member, outgoing).await {
                tracing::warn!(conn, %reason, "message rejected");
                state.send_to(conn, &ServerEvent::Error { reason }).await;
            }
        }
        ClientEvent::Typing(TypingSignal {
            channel_id,
            is_typing,
        }) => {
            if !state.channels.is_subscribed(&channel_id, conn).await {
                return;
            }
            let update = ServerEvent::UserTyping(TypingUpdate {
                user_id: member.id.clone(),
                user_name: member.name.clone(),
                is_typing,
            });
            state.broadcast(&channel_id, &update, Some(conn)).await;
        }
    }
}

fn encode_frame(event: &ServerEvent) -> Option<WsMessage> {
    match codec::encode_server(event) {
        Ok(text) => Some(WsMessage::Text(text.into())),
        Err(e) => {
            tracing::error!(event = event.name(), error = %e, "failed to encode server event");
            None
        }
    }
}

/// Starts the broker with no accounts on `addr`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    start_server_with_state(addr, Arc::new(BrokerState::new(Vec::new()))).await
}

/// Starts the broker with a pre-configured [`BrokerState`].
///
/// Serves the WebSocket endpoint at `/ws` and the REST routes under `/api`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BrokerState>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .nest("/api", crate::rest::routes())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "broker server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<BrokerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
