// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for sending and receiving messages through the broker.
//!
//! Two chat sessions open the same channel over real WebSockets against an
//! in-process broker, with history, roster and deletion going through the
//! broker's REST routes via `HttpChatApi`.
//!
//! These tests validate:
//! - a sent message reaches the other member with its mentions
//! - the sender's optimistic placeholder is replaced by the canonical copy
//! - history fetched on open is in chronological order
//! - edits and REST deletions propagate to every open session

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
use projchat_proto::event::OutgoingMessage;
use projchat_proto::message::{ChannelId, Message, UserId};
use tokio::sync::mpsc;

type Session = ChatSession<WsConnector, HttpChatApi>;

const CHANNEL: &str = "proj-42";

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

/// Open a session for `user` and wait until the broker has it subscribed.
async fn open_session(
    addr: SocketAddr,
    state: &BrokerState,
    token: &str,
    user: &str,
    subscribers: usize,
) -> (Session, mpsc::Receiver<SessionEvent>) {
    let config = SessionConfig {
        channel_id: ChannelId::new(CHANNEL),
        user_id: UserId::new(user),
        auth_token: token.to_string(),
        typing: TypingConfig::default(),
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
    wait_for_subscribers(state, subscribers).await;

    (session, events)
}

async fn wait_for_subscribers(state: &BrokerState, expected: usize) {
    let channel = ChannelId::new(CHANNEL);
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.channels.subscribers(&channel).await.len() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("broker never saw the join");
}

/// Wait for a `SessionEvent` matching a predicate, skipping others.
async fn wait_for_event<F>(
    rx: &mut mpsc::Receiver<SessionEvent>,
    description: &str,
    pred: F,
) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(evt)) if pred(&evt) => return evt,
            Ok(Some(_other)) => {}
            Ok(None) => panic!("event queue closed while waiting for {description}"),
            Err(_) => panic!("timeout waiting for {description}"),
        }
    }
}

/// Wait for the canonical (server-assigned) copy of a message.
async fn wait_for_canonical(rx: &mut mpsc::Receiver<SessionEvent>, content: &str) -> Message {
    let event = wait_for_event(rx, &format!("canonical '{content}'"), |e| {
        matches!(e, SessionEvent::MessageUpserted(m) if m.content == content && !m.id.is_local())
    })
    .await;
    let SessionEvent::MessageUpserted(message) = event else {
        unreachable!()
    };
    message
}

async fn eventually(description: &str, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("condition never held: {description}"));
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn message_reaches_other_member_with_mentions() {
    let (addr, state) = start_broker().await;
    let (alice, mut alice_events) = open_session(addr, &state, "alice-token", "u-alice", 1).await;
    let (bob, mut bob_events) = open_session(addr, &state, "bob-token", "u-bob", 2).await;

    alice.send("morning @Bob, standup?").await.unwrap();

    let received = wait_for_canonical(&mut bob_events, "morning @Bob, standup?").await;
    assert_eq!(received.sender_id, UserId::new("u-alice"));
    assert_eq!(received.sender_name, "Alice");
    assert_eq!(received.mentioned_user_ids, vec![UserId::new("u-bob")]);
    assert_eq!(bob.message_count(), 1);

    let echoed = wait_for_canonical(&mut alice_events, "morning @Bob, standup?").await;
    assert_eq!(echoed.id, received.id);

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn placeholder_is_replaced_by_canonical_copy() {
    let (addr, state) = start_broker().await;
    let (alice, mut events) = open_session(addr, &state, "alice-token", "u-alice", 1).await;

    let placeholder = alice.send("draft plan").await.unwrap();
    assert!(placeholder.id.is_local());

    match wait_for_event(&mut events, "placeholder upsert", |e| {
        matches!(e, SessionEvent::MessageUpserted(_))
    })
    .await
    {
        SessionEvent::MessageUpserted(m) => assert_eq!(m.id, placeholder.id),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        wait_for_event(&mut events, "placeholder removal", |e| {
            matches!(e, SessionEvent::MessageRemoved(_))
        })
        .await,
        SessionEvent::MessageRemoved(placeholder.id.clone())
    );
    let canonical = wait_for_canonical(&mut events, "draft plan").await;
    assert_eq!(canonical.client_message_id, placeholder.client_message_id);

    let messages = alice.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, canonical.id);

    alice.dispose().await;
}

#[tokio::test]
async fn history_is_loaded_in_chronological_order() {
    let (addr, state) = start_broker().await;
    let alice = state.authenticate("alice-token").unwrap().clone();
    for i in 0..5 {
        state
            .post_message(
                &alice,
                OutgoingMessage {
                    channel_id: ChannelId::new(CHANNEL),
                    content: format!("note {i}"),
                    mentioned_user_ids: vec![],
                    client_message_id: None,
                },
            )
            .await
            .unwrap();
    }

    let (bob, _events) = open_session(addr, &state, "bob-token", "u-bob", 1).await;

    let contents: Vec<String> = bob.messages().into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["note 0", "note 1", "note 2", "note 3", "note 4"]);
    assert_eq!(bob.roster().len(), 2);

    bob.dispose().await;
}

#[tokio::test]
async fn rapid_sends_keep_their_order() {
    let (addr, state) = start_broker().await;
    let (alice, _alice_events) = open_session(addr, &state, "alice-token", "u-alice", 1).await;
    let (bob, _bob_events) = open_session(addr, &state, "bob-token", "u-bob", 2).await;

    for i in 0..10 {
        alice.send(&format!("line {i}")).await.unwrap();
    }

    eventually("bob has all ten lines", || bob.message_count() == 10).await;
    let contents: Vec<String> = bob.messages().into_iter().map(|m| m.content).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("line {i}")).collect();
    assert_eq!(contents, expected);

    eventually("alice's placeholders are all reconciled", || {
        let messages = alice.messages();
        messages.len() == 10 && messages.iter().all(|m| !m.id.is_local())
    })
    .await;

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn edits_propagate_to_every_session() {
    let (addr, state) = start_broker().await;
    let (alice, mut alice_events) = open_session(addr, &state, "alice-token", "u-alice", 1).await;
    let (bob, mut bob_events) = open_session(addr, &state, "bob-token", "u-bob", 2).await;

    alice.send("teh release").await.unwrap();
    let original = wait_for_canonical(&mut bob_events, "teh release").await;
    wait_for_canonical(&mut alice_events, "teh release").await;

    state
        .edit_message(&ChannelId::new(CHANNEL), &original.id, "the release")
        .await
        .unwrap();

    for events in [&mut alice_events, &mut bob_events] {
        let edited = wait_for_canonical(events, "the release").await;
        assert_eq!(edited.id, original.id);
        assert!(edited.is_edited);
        assert!(edited.edited_at.is_some());
    }
    assert_eq!(bob.message_count(), 1);
    assert!(bob.messages()[0].is_edited);

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn rest_delete_removes_message_everywhere() {
    let (addr, state) = start_broker().await;
    let (alice, mut alice_events) = open_session(addr, &state, "alice-token", "u-alice", 1).await;
    let (bob, mut bob_events) = open_session(addr, &state, "bob-token", "u-bob", 2).await;

    alice.send("oops, wrong channel").await.unwrap();
    let message = wait_for_canonical(&mut bob_events, "oops, wrong channel").await;
    wait_for_canonical(&mut alice_events, "oops, wrong channel").await;

    alice.delete_message(&message.id).await.unwrap();
    assert_eq!(alice.message_count(), 0);

    assert_eq!(
        wait_for_event(&mut bob_events, "message-deleted", |e| {
            matches!(e, SessionEvent::MessageRemoved(_))
        })
        .await,
        SessionEvent::MessageRemoved(message.id.clone())
    );
    assert_eq!(bob.message_count(), 0);
    assert!(
        state
            .channels
            .messages(&ChannelId::new(CHANNEL))
            .await
            .is_empty()
    );

    // The broker already forgot it.
    assert!(alice.delete_message(&message.id).await.is_err());

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn dispose_leaves_the_channel() {
    let (addr, state) = start_broker().await;
    let (alice, _events) = open_session(addr, &state, "alice-token", "u-alice", 1).await;

    alice.dispose().await;

    wait_for_subscribers(&state, 0).await;
    assert_eq!(alice.connection_state(), ConnectionState::Disconnected);
}
