//! Typing presence: local debounce and remote indicator expiry.
//!
//! Local keystrokes are collapsed into edge-triggered
//! [`LocalTyping::Start`] / [`LocalTyping::Stop`] signals. The inactivity
//! timer is a task owned by the tracker: it is aborted whenever it is reset
//! and when the tracker is disposed or dropped.
//!
//! Remote indicators expire after a TTL unless refreshed.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use projchat_proto::message::UserId;

use crate::config::TypingConfig;

/// Outbound typing signal for the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTyping {
    /// The user started typing.
    Start,
    /// The user stopped typing.
    Stop,
}

impl LocalTyping {
    /// The `isTyping` flag of the wire event.
    #[must_use]
    pub const fn is_typing(self) -> bool {
        matches!(self, Self::Start)
    }
}

/// A remote member currently typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    /// Who is typing.
    pub user_id: UserId,
    /// Their display name.
    pub user_name: String,
    /// When the current typing streak was first seen.
    pub first_seen: Instant,
    /// When the indicator lapses without a refresh.
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
struct LocalState {
    typing: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    disposed: bool,
}

impl LocalState {
    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Tracks the local user's typing state and remote typing indicators.
#[derive(Debug)]
pub struct TypingPresenceTracker {
    config: TypingConfig,
    local: Arc<Mutex<LocalState>>,
    signals: mpsc::UnboundedSender<LocalTyping>,
    remote: HashMap<UserId, TypingEntry>,
}

impl TypingPresenceTracker {
    /// Create a tracker and the receiver of its local typing signals.
    #[must_use]
    pub fn new(config: TypingConfig) -> (Self, mpsc::UnboundedReceiver<LocalTyping>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            config,
            local: Arc::new(Mutex::new(LocalState::default())),
            signals,
            remote: HashMap::new(),
        };
        (tracker, rx)
    }

    /// Record local typing activity.
    ///
    /// `true` emits [`LocalTyping::Start`] only on the idle-to-typing edge
    /// and (re)arms the inactivity timer, which emits a single
    /// [`LocalTyping::Stop`] when it elapses. `false` cancels the timer and
    /// emits `Stop` at once if the user was typing.
    ///
    /// Must be called within a tokio runtime.
    pub fn local_signal(&self, is_typing: bool) {
        let mut local = self.local.lock();
        if local.disposed {
            return;
        }
        local.cancel_timer();

        if !is_typing {
            if local.typing {
                local.typing = false;
                let _ = self.signals.send(LocalTyping::Stop);
            }
            return;
        }

        if !local.typing {
            local.typing = true;
            let _ = self.signals.send(LocalTyping::Start);
        }

        let generation = local.generation;
        let state = Arc::clone(&self.local);
        let signals = self.signals.clone();
        let timeout = self.config.inactivity_timeout;
        local.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut local = state.lock();
            if local.generation == generation && local.typing {
                local.typing = false;
                local.timer = None;
                tracing::trace!("typing inactivity timeout");
                let _ = signals.send(LocalTyping::Stop);
            }
        }));
    }

    /// Whether the local user is currently considered typing.
    #[must_use]
    pub fn is_local_typing(&self) -> bool {
        self.local.lock().typing
    }

    /// Apply a remote typing update. Returns whether the set of active
    /// typers changed.
    pub fn remote_update(&mut self, user_id: UserId, user_name: String, is_typing: bool) -> bool {
        self.remote_update_at(Instant::now(), user_id, user_name, is_typing)
    }

    /// [`remote_update`](Self::remote_update) at an explicit instant.
    pub fn remote_update_at(
        &mut self,
        now: Instant,
        user_id: UserId,
        user_name: String,
        is_typing: bool,
    ) -> bool {
        if !is_typing {
            return self
                .remote
                .remove(&user_id)
                .is_some_and(|entry| entry.expires_at > now);
        }

        let expires_at = now + self.config.remote_ttl;
        match self.remote.entry(user_id) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let lapsed = entry.expires_at <= now;
                if lapsed {
                    entry.first_seen = now;
                }
                let renamed = entry.user_name != user_name;
                entry.user_name = user_name;
                entry.expires_at = expires_at;
                lapsed || renamed
            }
            Entry::Vacant(vacant) => {
                let user_id = vacant.key().clone();
                vacant.insert(TypingEntry {
                    user_id,
                    user_name,
                    first_seen: now,
                    expires_at,
                });
                true
            }
        }
    }

    /// Unexpired remote typers, oldest streak first, without `excluding`.
    #[must_use]
    pub fn active_typers(&self, excluding: &UserId) -> Vec<TypingEntry> {
        self.active_typers_at(Instant::now(), excluding)
    }

    /// [`active_typers`](Self::active_typers) at an explicit instant.
    #[must_use]
    pub fn active_typers_at(&self, now: Instant, excluding: &UserId) -> Vec<TypingEntry> {
        let mut active: Vec<TypingEntry> = self
            .remote
            .values()
            .filter(|e| e.expires_at > now && &e.user_id != excluding)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        active
    }

    /// Drop lapsed remote entries. Returns whether any were dropped.
    pub fn prune_expired(&mut self, now: Instant) -> bool {
        let before = self.remote.len();
        self.remote.retain(|_, e| e.expires_at > now);
        self.remote.len() != before
    }

    /// Cancel the inactivity timer and forget all state. Later local
    /// signals are ignored.
    pub fn dispose(&mut self) {
        let mut local = self.local.lock();
        local.cancel_timer();
        local.typing = false;
        local.disposed = true;
        drop(local);
        self.remote.clear();
    }
}

impl Drop for TypingPresenceTracker {
    fn drop(&mut self) {
        self.local.lock().cancel_timer();
    }
}
