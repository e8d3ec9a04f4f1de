// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for connection loss, reconnection and fatal states.
//!
//! These tests validate:
//! - a dropped connection moves the session to `Reconnecting` and back to
//!   `Connected`, re-joining the channel
//! - composing is refused while not connected
//! - exhausting the retry budget ends in `Fatal` with a single error
//! - a rejected token ends in `Fatal` without any retry
//!
//! ## Disconnect simulation
//!
//! A **TCP proxy** sits between the client and the broker. Killing it
//! aborts every proxied connection task, which drops both TCP streams and
//! makes the client's WebSocket reader see the connection end. A new proxy
//! on the same port restores connectivity.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use projchat::api::{HttpChatApi, StaticChatApi};
use projchat::chat::{ChatError, ChatSession, SessionConfig, SessionEvent};
use projchat::config::{ConnectionConfig, ReconnectConfig, TypingConfig};
use projchat::connection::{ConnectionError, ConnectionState};
use projchat::transport::Connector;
use projchat::transport::ws::WsConnector;
use projchat_broker::broker::{self, BrokerState};
use projchat_broker::config::Account;
use projchat_proto::message::{ChannelId, UserId};
use tokio::sync::{mpsc, watch};

const CHANNEL: &str = "proj-reconnect";

// =============================================================================
// TCP Proxy helper
// =============================================================================

/// Forwards a client-facing port to the broker. `kill()` severs every
/// proxied connection at once.
struct TcpProxy {
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(proxy_port: u16, backend: SocketAddr) -> Self {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", proxy_port))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {proxy_port}: {e}"));
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let conn_handles_clone = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client_stream, _)) = listener.accept().await {
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(backend).await
                    else {
                        return;
                    };
                    // No sub-tasks, so aborting this task drops both streams.
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                conn_handles_clone.lock().push(conn_handle);
            }
        });

        Self {
            accept_handle,
            conn_handles,
        }
    }

    fn kill(self) {
        self.accept_handle.abort();
        for h in self.conn_handles.lock().iter() {
            h.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Find a free port by binding to 0 and recording the port.
async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind to port 0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn start_broker() -> (SocketAddr, Arc<BrokerState>) {
    let state = Arc::new(BrokerState::new(vec![
        Account::new("alice-token", "u-alice", "Alice"),
        Account::new("bob-token", "u-bob", "Bob"),
    ]));
    let (addr, _handle) = broker::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start broker");
    (addr, state)
}

fn fast_reconnect(max_retries: u32) -> ConnectionConfig {
    ConnectionConfig {
        handshake_timeout: Duration::from_secs(2),
        leave_timeout: Duration::from_millis(500),
        command_buffer: 16,
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_millis(400),
            max_retries,
        },
    }
}

fn session_config(token: &str, user: &str) -> SessionConfig {
    SessionConfig {
        channel_id: ChannelId::new(CHANNEL),
        user_id: UserId::new(user),
        auth_token: token.to_string(),
        typing: TypingConfig::default(),
        event_buffer: 256,
    }
}

async fn wait_for_state(states: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(15), states.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for {target}"))
        .unwrap();
}

async fn wait_for_subscribers(state: &BrokerState, expected: usize) {
    let channel = ChannelId::new(CHANNEL);
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.channels.subscribers(&channel).await.len() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("broker subscriber count never settled");
}

/// Drain everything queued so far.
fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn connection_errors(events: &[SessionEvent]) -> Vec<&ConnectionError> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Error(ChatError::Connection(err)) => Some(err),
            _ => None,
        })
        .collect()
}

/// A connector that counts how many times it was asked to open.
struct CountingConnector {
    inner: WsConnector,
    opens: Arc<Mutex<usize>>,
}

impl Connector for CountingConnector {
    type Conn = <WsConnector as Connector>::Conn;

    async fn open(&self) -> Result<Self::Conn, projchat::transport::TransportError> {
        *self.opens.lock() += 1;
        self.inner.open().await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn dropped_connection_reconnects_and_rejoins() {
    let (broker_addr, state) = start_broker().await;
    let port = find_free_port().await;
    let proxy = TcpProxy::new(port, broker_addr).await;

    let connector = WsConnector::new(format!("ws://127.0.0.1:{port}/ws"), Duration::from_secs(2));
    let api = HttpChatApi::new(
        &format!("http://{broker_addr}/api"),
        "alice-token",
        Duration::from_secs(5),
    )
    .unwrap();
    let (alice, mut events) = ChatSession::open(
        session_config("alice-token", "u-alice"),
        fast_reconnect(10),
        connector,
        api,
    )
    .await
    .unwrap();
    let mut states = alice.watch_connection_state();
    wait_for_state(&mut states, ConnectionState::Connected).await;
    wait_for_subscribers(&state, 1).await;

    proxy.kill();
    wait_for_state(&mut states, ConnectionState::Reconnecting).await;
    wait_for_subscribers(&state, 0).await;

    let refused = alice.send("are you there?").await;
    assert!(matches!(
        refused,
        Err(ChatError::Connection(ConnectionError::NotConnected))
    ));
    assert_eq!(alice.message_count(), 0);

    let _proxy = TcpProxy::new(port, broker_addr).await;
    wait_for_state(&mut states, ConnectionState::Connected).await;
    wait_for_subscribers(&state, 1).await;

    alice.send("back online").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while state
            .channels
            .messages(&ChannelId::new(CHANNEL))
            .await
            .is_empty()
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message never reached the broker");

    // A transient drop is not reported as an error.
    let seen = drain(&mut events);
    assert!(connection_errors(&seen).is_empty());
    assert!(seen.contains(&SessionEvent::ConnectionStateChanged(
        ConnectionState::Reconnecting
    )));

    alice.dispose().await;
}

#[tokio::test]
async fn server_close_triggers_reconnect() {
    let (addr, state) = start_broker().await;
    let connector = WsConnector::new(format!("ws://{addr}/ws"), Duration::from_secs(2));
    let api =
        HttpChatApi::new(&format!("http://{addr}/api"), "bob-token", Duration::from_secs(5))
            .unwrap();
    let (bob, _events) =
        ChatSession::open(session_config("bob-token", "u-bob"), fast_reconnect(5), connector, api)
            .await
            .unwrap();
    let mut states = bob.watch_connection_state();
    wait_for_state(&mut states, ConnectionState::Connected).await;
    wait_for_subscribers(&state, 1).await;

    state.close_all_connections().await;

    wait_for_state(&mut states, ConnectionState::Reconnecting).await;
    wait_for_state(&mut states, ConnectionState::Connected).await;
    wait_for_subscribers(&state, 1).await;

    bob.dispose().await;
}

#[tokio::test]
async fn exhausted_retries_end_in_fatal() {
    let (broker_addr, state) = start_broker().await;
    let port = find_free_port().await;
    let proxy = TcpProxy::new(port, broker_addr).await;

    let opens = Arc::new(Mutex::new(0usize));
    let connector = CountingConnector {
        inner: WsConnector::new(format!("ws://127.0.0.1:{port}/ws"), Duration::from_secs(1)),
        opens: Arc::clone(&opens),
    };
    let api = StaticChatApi::default();
    let (alice, mut events) = ChatSession::open(
        session_config("alice-token", "u-alice"),
        fast_reconnect(3),
        connector,
        api,
    )
    .await
    .unwrap();
    let mut states = alice.watch_connection_state();
    wait_for_state(&mut states, ConnectionState::Connected).await;
    wait_for_subscribers(&state, 1).await;
    assert_eq!(*opens.lock(), 1);

    proxy.kill();
    wait_for_state(&mut states, ConnectionState::Fatal).await;

    // One successful open plus the three retries.
    assert_eq!(*opens.lock(), 4);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*opens.lock(), 4, "no attempts after Fatal");

    let seen = drain(&mut events);
    let errors = connection_errors(&seen);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ConnectionError::RetriesExhausted { .. }));
    assert!(matches!(
        alice.send("hello?").await,
        Err(ChatError::Connection(ConnectionError::NotConnected))
    ));

    alice.dispose().await;
}

#[tokio::test]
async fn rejected_token_is_fatal_without_retry() {
    let (addr, _state) = start_broker().await;
    let opens = Arc::new(Mutex::new(0usize));
    let connector = CountingConnector {
        inner: WsConnector::new(format!("ws://{addr}/ws"), Duration::from_secs(2)),
        opens: Arc::clone(&opens),
    };
    let (mallory, mut events) = ChatSession::open(
        session_config("forged-token", "u-mallory"),
        fast_reconnect(5),
        connector,
        StaticChatApi::default(),
    )
    .await
    .unwrap();
    let mut states = mallory.watch_connection_state();
    wait_for_state(&mut states, ConnectionState::Fatal).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*opens.lock(), 1);

    let seen = drain(&mut events);
    let errors = connection_errors(&seen);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ConnectionError::Auth { .. }));

    mallory.dispose().await;
}
