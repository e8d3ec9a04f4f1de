#![allow(clippy::unwrap_used)]

//! Property-based tests for the channel message store.
//!
//! Uses proptest to verify, for arbitrary sequences of upserts and removals:
//! 1. The store never holds two entries with the same id.
//! 2. Iteration is ordered by `created_at`.
//! 3. The store agrees with a plain map model of the same operations.
//! 4. Re-applying an upsert is a no-op.
//! 5. `grouped_by_day` partitions the log into distinct, ascending days in
//!    any time zone.
//! 6. Delivering any earlier broadcast a second time, at any later point,
//!    leaves the same log as delivering it once, and deleted messages stay
//!    deleted.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, FixedOffset, Utc};
use proptest::prelude::*;
use proptest::sample::Index;
use projchat::chat::store::{MessageStore, UpsertOutcome};
use projchat_proto::message::{ChannelId, Message, MessageId, UserId};

#[derive(Debug, Clone)]
enum Op {
    Upsert { id: u8, secs: i64, content: String },
    Remove { id: u8 },
}

/// Ids come from a small pool so upserts collide and removals hit.
fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..12, 1_700_000_000i64..1_700_600_000, "[a-z ]{1,12}")
            .prop_map(|(id, secs, content)| Op::Upsert { id, secs, content }),
        1 => (0u8..12).prop_map(|id| Op::Remove { id }),
    ]
}

fn make_message(id: u8, secs: i64, content: String) -> Message {
    Message {
        id: MessageId::new(format!("m-{id}")),
        channel_id: ChannelId::new("proj"),
        sender_id: UserId::new("u-1"),
        sender_name: "Alice".into(),
        sender_avatar_url: None,
        content,
        mentioned_user_ids: vec![],
        created_at: DateTime::from_timestamp(secs, 0).unwrap_or_default(),
        edited_at: None,
        is_edited: false,
        client_message_id: None,
    }
}

fn apply(store: &mut MessageStore, model: &mut HashMap<MessageId, Message>, op: Op) {
    match op {
        Op::Upsert { id, secs, content } => {
            let message = make_message(id, secs, content);
            model.insert(message.id.clone(), message.clone());
            store.upsert(message);
        }
        Op::Remove { id } => {
            let id = MessageId::new(format!("m-{id}"));
            model.remove(&id);
            store.remove(&id);
        }
    }
}

/// A broadcast as the server would send it. Every id has one canonical
/// creation, and edit `v` of an id always carries the same content.
#[derive(Debug, Clone)]
enum Broadcast {
    New(u8),
    Edited(u8, u8),
    Deleted(u8),
}

fn arb_broadcast() -> impl Strategy<Value = Broadcast> {
    prop_oneof![
        3 => (0u8..8).prop_map(Broadcast::New),
        2 => (0u8..8, 1u8..5).prop_map(|(id, v)| Broadcast::Edited(id, v)),
        1 => (0u8..8).prop_map(Broadcast::Deleted),
    ]
}

fn created(id: u8) -> Message {
    make_message(id, 1_700_000_000 + i64::from(id) * 60, format!("body {id}"))
}

fn edited(id: u8, version: u8) -> Message {
    let mut message = created(id);
    let at = message.created_at + chrono::Duration::minutes(i64::from(version));
    message.apply_edit(format!("body {id} v{version}"), at);
    message
}

fn deliver_all(broadcasts: &[Broadcast]) -> MessageStore {
    let mut store = MessageStore::new();
    for broadcast in broadcasts {
        match *broadcast {
            Broadcast::New(id) => {
                store.reconcile(created(id));
            }
            Broadcast::Edited(id, version) => {
                store.apply_edit(edited(id, version));
            }
            Broadcast::Deleted(id) => {
                store.remove(&MessageId::new(format!("m-{id}")));
            }
        }
    }
    store
}

proptest! {
    #[test]
    fn store_matches_model(ops in prop::collection::vec(arb_op(), 0..64)) {
        let mut store = MessageStore::new();
        let mut model = HashMap::new();
        for op in ops {
            apply(&mut store, &mut model, op);

            prop_assert_eq!(store.len(), model.len());
            let ids: HashSet<&MessageId> = store.iter().map(|m| &m.id).collect();
            prop_assert_eq!(ids.len(), store.len());
            for (id, expected) in &model {
                prop_assert_eq!(store.get(id), Some(expected));
            }
        }
    }

    #[test]
    fn iteration_is_chronological(ops in prop::collection::vec(arb_op(), 0..64)) {
        let mut store = MessageStore::new();
        let mut model = HashMap::new();
        for op in ops {
            apply(&mut store, &mut model, op);
        }
        let times: Vec<DateTime<Utc>> = store.iter().map(|m| m.created_at).collect();
        prop_assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn repeated_upsert_is_unchanged(
        ops in prop::collection::vec(arb_op(), 0..32),
        id in 0u8..12,
        secs in 1_700_000_000i64..1_700_600_000,
    ) {
        let mut store = MessageStore::new();
        let mut model = HashMap::new();
        for op in ops {
            apply(&mut store, &mut model, op);
        }
        let message = make_message(id, secs, "again".into());
        store.upsert(message.clone());
        let before: Vec<Message> = store.iter().cloned().collect();

        prop_assert_eq!(store.upsert(message), UpsertOutcome::Unchanged);
        let after: Vec<Message> = store.iter().cloned().collect();
        prop_assert_eq!(before, after);
    }

    #[test]
    fn grouped_by_day_is_a_partition(
        ops in prop::collection::vec(arb_op(), 0..64),
        offset_hours in -12i32..=14,
        now_secs in 1_700_000_000i64..1_700_700_000,
    ) {
        let mut store = MessageStore::new();
        let mut model = HashMap::new();
        for op in ops {
            apply(&mut store, &mut model, op);
        }
        let tz = FixedOffset::east_opt(offset_hours * 3600).unwrap();
        let now = DateTime::from_timestamp(now_secs, 0).unwrap_or_default().with_timezone(&tz);

        let groups = store.grouped_by_day(&now);

        let flattened: Vec<&MessageId> =
            groups.iter().flat_map(|g| g.messages.iter().map(|m| &m.id)).collect();
        let in_order: Vec<&MessageId> = store.iter().map(|m| &m.id).collect();
        prop_assert_eq!(flattened, in_order);

        for group in &groups {
            prop_assert!(!group.messages.is_empty());
            for message in &group.messages {
                prop_assert_eq!(message.created_at.with_timezone(&tz).date_naive(), group.date);
            }
        }
        prop_assert!(groups.windows(2).all(|w| w[0].date < w[1].date));
    }

    #[test]
    fn redelivery_is_absorbed(
        broadcasts in prop::collection::vec(arb_broadcast(), 1..48),
        original in any::<Index>(),
        later in any::<Index>(),
    ) {
        let original = original.index(broadcasts.len());
        let position = original + 1 + later.index(broadcasts.len() - original);
        let mut replayed = broadcasts.clone();
        replayed.insert(position, broadcasts[original].clone());

        let once = deliver_all(&broadcasts);
        let twice = deliver_all(&replayed);
        let once_log: Vec<&Message> = once.iter().collect();
        let twice_log: Vec<&Message> = twice.iter().collect();
        prop_assert_eq!(once_log, twice_log);

        for broadcast in &broadcasts {
            if let Broadcast::Deleted(id) = broadcast {
                let deleted_id = MessageId::new(format!("m-{id}"));
                prop_assert!(!twice.contains(&deleted_id));
            }
        }
    }
}
