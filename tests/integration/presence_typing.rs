// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for typing presence between two sessions.
//!
//! These tests validate:
//! - local typing reaches the other member and is never shown to oneself
//! - inactivity emits a stop that clears the indicator remotely
//! - sending a message ends the typing state
//! - an indicator whose stop is lost expires after its TTL
//! - leaving the channel clears the leaver's indicator

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use projchat::api::HttpChatApi;
use projchat::chat::{ChatSession, SessionConfig, SessionEvent};
use projchat::config::{ConnectionConfig, TypingConfig};
use projchat::connection::ConnectionState;
use projchat::transport::ws::WsConnector;
use projchat_broker::broker::{self, BrokerState};
use projchat_broker::config::Account;
use projchat_proto::message::{ChannelId, UserId};
use tokio::sync::mpsc;

type Session = ChatSession<WsConnector, HttpChatApi>;

const CHANNEL: &str = "proj-typing";

// =============================================================================
// Helpers
// =============================================================================

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

fn typing_config(inactivity_ms: u64, ttl_ms: u64) -> TypingConfig {
    TypingConfig {
        inactivity_timeout: Duration::from_millis(inactivity_ms),
        remote_ttl: Duration::from_millis(ttl_ms),
        sweep_interval: Duration::from_millis(50),
    }
}

async fn open_session(
    addr: SocketAddr,
    state: &BrokerState,
    token: &str,
    user: &str,
    typing: TypingConfig,
    subscribers: usize,
) -> (Session, mpsc::Receiver<SessionEvent>) {
    let config = SessionConfig {
        channel_id: ChannelId::new(CHANNEL),
        user_id: UserId::new(user),
        auth_token: token.to_string(),
        typing,
        event_buffer: 256,
    };
    let connector = WsConnector::new(format!("ws://{addr}/ws"), Duration::from_secs(5));
    let api = HttpChatApi::new(&format!("http://{addr}/api"), token, Duration::from_secs(5))
        .unwrap();
    let (session, events) = ChatSession::open(config, ConnectionConfig::default(), connector, api)
        .await
        .expect("session failed to open");

    let mut states = session.watch_connection_state();
    tokio::time::timeout(
        Duration::from_secs(10),
        states.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("timeout waiting for Connected")
    .unwrap();

    let channel = ChannelId::new(CHANNEL);
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.channels.subscribers(&channel).await.len() != subscribers {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("broker never saw the join");

    (session, events)
}

/// Wait for the next `TypingChanged` and return the typing user ids.
async fn next_typers(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<UserId> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(SessionEvent::TypingChanged(typers))) => {
                return typers.into_iter().map(|t| t.user_id).collect();
            }
            Ok(Some(_other)) => {}
            Ok(None) => panic!("event queue closed while waiting for TypingChanged"),
            Err(_) => panic!("timeout waiting for TypingChanged"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn typing_is_shown_to_others_only() {
    let (addr, state) = start_broker().await;
    let (alice, mut alice_events) =
        open_session(addr, &state, "alice-token", "u-alice", typing_config(5_000, 10_000), 1)
            .await;
    let (bob, mut bob_events) =
        open_session(addr, &state, "bob-token", "u-bob", typing_config(5_000, 10_000), 2).await;

    alice.set_typing(true);
    assert_eq!(next_typers(&mut bob_events).await, vec![UserId::new("u-alice")]);

    let typers = bob.active_typers();
    assert_eq!(typers.len(), 1);
    assert_eq!(typers[0].user_name, "Alice");
    assert!(alice.active_typers().is_empty());

    // Further keystrokes do not produce new broadcasts for the same state.
    alice.set_typing(true);
    alice.set_typing(true);
    bob.set_typing(true);
    assert_eq!(next_typers(&mut alice_events).await, vec![UserId::new("u-bob")]);

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn inactivity_clears_the_indicator() {
    let (addr, state) = start_broker().await;
    let (alice, _alice_events) =
        open_session(addr, &state, "alice-token", "u-alice", typing_config(200, 10_000), 1).await;
    let (bob, mut bob_events) =
        open_session(addr, &state, "bob-token", "u-bob", typing_config(200, 10_000), 2).await;

    let started = tokio::time::Instant::now();
    alice.set_typing(true);
    assert_eq!(next_typers(&mut bob_events).await, vec![UserId::new("u-alice")]);
    assert!(next_typers(&mut bob_events).await.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(bob.active_typers().is_empty());

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn sending_ends_typing() {
    let (addr, state) = start_broker().await;
    let (alice, _alice_events) =
        open_session(addr, &state, "alice-token", "u-alice", typing_config(5_000, 10_000), 1)
            .await;
    let (bob, mut bob_events) =
        open_session(addr, &state, "bob-token", "u-bob", typing_config(5_000, 10_000), 2).await;

    alice.set_typing(true);
    assert_eq!(next_typers(&mut bob_events).await, vec![UserId::new("u-alice")]);

    alice.send("done typing").await.unwrap();
    assert!(next_typers(&mut bob_events).await.is_empty());

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn lost_stop_expires_after_ttl() {
    let (addr, state) = start_broker().await;
    // Alice never stops on her own within the test.
    let (alice, _alice_events) =
        open_session(addr, &state, "alice-token", "u-alice", typing_config(60_000, 60_000), 1)
            .await;
    let (bob, mut bob_events) =
        open_session(addr, &state, "bob-token", "u-bob", typing_config(60_000, 300), 2).await;

    let started = tokio::time::Instant::now();
    alice.set_typing(true);
    assert_eq!(next_typers(&mut bob_events).await, vec![UserId::new("u-alice")]);
    assert!(next_typers(&mut bob_events).await.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(300));

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn leaving_clears_the_leavers_indicator() {
    let (addr, state) = start_broker().await;
    let (alice, _alice_events) =
        open_session(addr, &state, "alice-token", "u-alice", typing_config(60_000, 60_000), 1)
            .await;
    let (bob, mut bob_events) =
        open_session(addr, &state, "bob-token", "u-bob", typing_config(60_000, 60_000), 2).await;

    alice.set_typing(true);
    assert_eq!(next_typers(&mut bob_events).await, vec![UserId::new("u-alice")]);

    alice.dispose().await;
    assert!(next_typers(&mut bob_events).await.is_empty());

    bob.dispose().await;
}
