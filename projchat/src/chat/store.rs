//! Ordered, de-duplicated in-memory message log.
//!
//! [`MessageStore`] keeps messages sorted by `(created_at, arrival sequence)`
//! and indexed by id, so every id appears at most once. Optimistic
//! placeholders inserted while a send is in flight are replaced by the
//! confirmed broadcast in [`MessageStore::reconcile`].
//!
//! Inbound events may be delivered more than once and edits may arrive out
//! of order. [`MessageStore::reconcile`] never overwrites an entry it already
//! holds, [`MessageStore::apply_edit`] ignores edits older than the stored
//! one, and both drop events for ids that were removed (kept as a bounded
//! set of tombstones).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use projchat_proto::message::{Message, MessageId};

/// Sort key: creation time, then arrival order for equal timestamps.
type Key = (DateTime<Utc>, u64);

/// How many removed ids are remembered to reject redelivered events.
pub const MAX_TOMBSTONES: usize = 4096;

/// What an [`MessageStore::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The id was new.
    Inserted,
    /// An existing entry was replaced.
    Updated,
    /// An identical entry was already present.
    Unchanged,
}

impl UpsertOutcome {
    /// Whether the store changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Result of [`MessageStore::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// What happened to the confirmed message.
    pub outcome: UpsertOutcome,
    /// The optimistic placeholder it replaced, if any.
    pub replaced: Option<MessageId>,
}

/// Label of a [`DayGroup`], relative to a reference "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayLabel {
    /// Same calendar day as the reference.
    Today,
    /// The calendar day before the reference.
    Yesterday,
    /// Any other day.
    Date(NaiveDate),
}

impl fmt::Display for DayLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Today => f.write_str("Today"),
            Self::Yesterday => f.write_str("Yesterday"),
            Self::Date(date) => write!(f, "{}", date.format("%B %-d, %Y")),
        }
    }
}

/// Consecutive messages created on the same calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayGroup<'a> {
    /// Display label.
    pub label: DayLabel,
    /// The calendar day, in the reference time zone.
    pub date: NaiveDate,
    /// Messages of that day, in store order.
    pub messages: Vec<&'a Message>,
}

/// The message log of one channel.
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: BTreeMap<Key, Message>,
    index: HashMap<MessageId, Key>,
    next_seq: u64,
    tombstones: HashSet<MessageId>,
    tombstone_order: VecDeque<MessageId>,
}

impl MessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `message`, or replace the entry with the same id.
    ///
    /// A replaced entry keeps its arrival sequence and only moves if its
    /// `created_at` changed. An explicit upsert revives a removed id.
    pub fn upsert(&mut self, message: Message) -> UpsertOutcome {
        if self.tombstones.remove(&message.id) {
            self.tombstone_order.retain(|id| *id != message.id);
        }
        if let Some(&key) = self.index.get(&message.id) {
            if key.0 == message.created_at {
                return match self.entries.get_mut(&key) {
                    Some(existing) if *existing == message => UpsertOutcome::Unchanged,
                    Some(existing) => {
                        *existing = message;
                        UpsertOutcome::Updated
                    }
                    None => {
                        self.entries.insert(key, message);
                        UpsertOutcome::Updated
                    }
                };
            }
            self.entries.remove(&key);
            let moved = (message.created_at, key.1);
            self.index.insert(message.id.clone(), moved);
            self.entries.insert(moved, message);
            return UpsertOutcome::Updated;
        }

        let key = (message.created_at, self.next_seq);
        self.next_seq += 1;
        self.index.insert(message.id.clone(), key);
        self.entries.insert(key, message);
        UpsertOutcome::Inserted
    }

    /// Remove the message with `id`. No-op if absent.
    ///
    /// Server ids are remembered as removed, so a late `new-message` or
    /// `message-edited` for them is dropped.
    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        if !id.is_local() {
            self.bury(id.clone());
        }
        self.take(id)
    }

    /// Whether `id` was removed and is still remembered as such.
    #[must_use]
    pub fn is_removed(&self, id: &MessageId) -> bool {
        self.tombstones.contains(id)
    }

    /// Apply a `message-edited` broadcast.
    ///
    /// An edit older than the stored entry (by `edited_at`, unedited being
    /// oldest) is ignored, as is an edit for a removed id. An edit for an
    /// unknown id is inserted.
    pub fn apply_edit(&mut self, edited: Message) -> UpsertOutcome {
        if self.is_removed(&edited.id) {
            tracing::debug!(id = %edited.id, "ignoring edit of removed message");
            return UpsertOutcome::Unchanged;
        }
        let stale = self
            .get(&edited.id)
            .is_some_and(|current| edited.edited_at < current.edited_at);
        if stale {
            tracing::debug!(id = %edited.id, "ignoring stale edit");
            return UpsertOutcome::Unchanged;
        }
        self.upsert(edited)
    }

    fn take(&mut self, id: &MessageId) -> Option<Message> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    fn bury(&mut self, id: MessageId) {
        if !self.tombstones.insert(id.clone()) {
            return;
        }
        self.tombstone_order.push_back(id);
        while self.tombstone_order.len() > MAX_TOMBSTONES {
            let Some(oldest) = self.tombstone_order.pop_front() else {
                break;
            };
            self.tombstones.remove(&oldest);
        }
    }

    /// Seed the store from a bulk fetch. Returns how many entries changed.
    pub fn load(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        messages
            .into_iter()
            .map(|m| self.upsert(m))
            .filter(|outcome| outcome.changed())
            .count()
    }

    /// Insert an optimistic placeholder for a message being sent.
    ///
    /// Placeholders carry a [`MessageId::local`] id and a client message id
    /// so the confirmed broadcast can replace them.
    pub fn insert_pending(&mut self, placeholder: Message) {
        debug_assert!(placeholder.id.is_local(), "placeholder must use a local id");
        self.upsert(placeholder);
    }

    /// Drop a placeholder whose send failed. Returns `false` if `id` is not
    /// a pending placeholder.
    pub fn discard_pending(&mut self, id: &MessageId) -> bool {
        id.is_local() && self.take(id).is_some()
    }

    /// Apply a server-confirmed message, replacing the placeholder of the
    /// same send if there is one.
    ///
    /// The placeholder is found by the echoed `client_message_id`, or failing
    /// that, as the oldest placeholder from the same sender with the same
    /// content.
    ///
    /// A redelivered message whose id is already present leaves the entry
    /// alone, since it may have been edited since. One whose id was removed
    /// is not inserted again, though its placeholder is still dropped.
    pub fn reconcile(&mut self, confirmed: Message) -> Reconciled {
        if self.index.contains_key(&confirmed.id) {
            return Reconciled {
                outcome: UpsertOutcome::Unchanged,
                replaced: None,
            };
        }

        let placeholder = self.find_placeholder(&confirmed);
        if let Some(placeholder) = &placeholder {
            tracing::debug!(
                placeholder = %placeholder,
                id = %confirmed.id,
                "replacing optimistic placeholder"
            );
            self.take(placeholder);
        }

        let outcome = if self.is_removed(&confirmed.id) {
            tracing::debug!(id = %confirmed.id, "ignoring redelivered removed message");
            UpsertOutcome::Unchanged
        } else {
            self.upsert(confirmed)
        };
        Reconciled {
            outcome,
            replaced: placeholder,
        }
    }

    fn find_placeholder(&self, confirmed: &Message) -> Option<MessageId> {
        let mut pending = self.entries.values().filter(|m| m.id.is_local());

        if let Some(client_id) = confirmed.client_message_id.as_deref() {
            if let Some(found) = pending
                .clone()
                .find(|m| m.client_message_id.as_deref() == Some(client_id))
            {
                return Some(found.id.clone());
            }
        }
        pending
            .find(|m| m.sender_id == confirmed.sender_id && m.content == confirmed.content)
            .map(|m| m.id.clone())
    }

    /// Look up a message by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.index.get(id).and_then(|key| self.entries.get(key))
    }

    /// Whether `id` is present.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    /// Messages in ascending `(created_at, arrival)` order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> + '_ {
        self.entries.values()
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove everything, including the memory of removed ids.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.tombstones.clear();
        self.tombstone_order.clear();
    }

    /// Partition the log into calendar days of `now`'s time zone.
    ///
    /// Days are labelled "Today" and "Yesterday" relative to `now`, and by
    /// date otherwise. Every message appears in exactly one group.
    pub fn grouped_by_day<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Vec<DayGroup<'_>> {
        let tz = now.timezone();
        let today = now.date_naive();
        let yesterday = today.pred_opt();

        let mut groups: Vec<DayGroup<'_>> = Vec::new();
        for message in self.entries.values() {
            let date = message.created_at.with_timezone(&tz).date_naive();
            match groups.last_mut() {
                Some(group) if group.date == date => group.messages.push(message),
                _ => {
                    let label = if date == today {
                        DayLabel::Today
                    } else if Some(date) == yesterday {
                        DayLabel::Yesterday
                    } else {
                        DayLabel::Date(date)
                    };
                    groups.push(DayGroup {
                        label,
                        date,
                        messages: vec![message],
                    });
                }
            }
        }
        groups
    }
}
