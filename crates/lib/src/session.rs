//! Thread registry: per-thread ownership and session continuity for the agent.
//!
//! Every thread key maps to an entry guarded by its own async mutex. Holding a [`ThreadGuard`]
//! is the only way to read or change an entry, so two messages in the same thread are handled
//! one after the other while different threads proceed in parallel.
//!
//! The map is bounded: threads that are not owned (rejected, or left unclassified after a failed
//! transcript fetch) are evicted oldest first, owned threads least recently used first. Entries
//! currently locked or waited on are never evicted.

use crate::config::ThreadsConfig;
use crate::routing::{ConversationKey, Ownership};
use rand::seq::IndexedRandom;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// State of an owned thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    /// Agent session id used to resume reasoning context (`-r`).
    pub continuation_token: Option<String>,
    /// Whether a placeholder was ever posted in this thread (selects the placeholder text).
    pub has_posted_first_reply: bool,
    /// ts of the "thinking" message still waiting to be replaced.
    pub pending_placeholder: Option<String>,
}

/// Registry entry: ownership plus conversation state, present only when owned.
#[derive(Debug)]
struct ThreadEntry {
    ownership: Ownership,
    state: Option<ConversationState>,
}

impl ThreadEntry {
    fn unknown() -> Self {
        Self {
            ownership: Ownership::Unknown,
            state: None,
        }
    }
}

/// Size bounds for the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub max_owned: usize,
    pub max_unowned: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_owned: 10_000,
            max_unowned: 1024,
        }
    }
}

/// Texts for the "thinking" message.
#[derive(Debug, Clone)]
pub struct Placeholders {
    first_turn: Vec<String>,
    follow_up: String,
}

impl Placeholders {
    pub fn new(first_turn: Vec<String>, follow_up: impl Into<String>) -> Self {
        Self {
            first_turn,
            follow_up: follow_up.into(),
        }
    }

    pub fn from_config(config: &ThreadsConfig) -> Self {
        Self::new(config.placeholders.clone(), config.follow_up_placeholder.clone())
    }

    fn pick_first(&self) -> String {
        self.first_turn
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| self.follow_up.clone())
    }

    pub fn follow_up(&self) -> &str {
        &self.follow_up
    }
}

impl Default for Placeholders {
    fn default() -> Self {
        Self::from_config(&ThreadsConfig::default())
    }
}

/// Entry counts by ownership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub owned: usize,
    pub rejected: usize,
    pub unknown: usize,
}

struct Slot {
    entry: Arc<AsyncMutex<ThreadEntry>>,
    /// Copy of the entry's ownership, readable without the entry lock.
    ownership: Ownership,
    last_used: u64,
}

impl Slot {
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.entry) > 1
    }
}

#[derive(Default)]
struct RegistryInner {
    slots: HashMap<ConversationKey, Slot>,
    /// Non-owned keys, oldest first.
    unowned: VecDeque<ConversationKey>,
    tick: u64,
}

impl RegistryInner {
    fn owned_count(&self) -> usize {
        self.slots.len() - self.unowned.len()
    }

    fn evict_unowned(&mut self, max: usize) {
        let mut attempts = self.unowned.len();
        while self.unowned.len() > max && attempts > 0 {
            attempts -= 1;
            let Some(key) = self.unowned.pop_front() else {
                break;
            };
            let in_use = self.slots.get(&key).map(Slot::in_use).unwrap_or(false);
            if in_use {
                self.unowned.push_back(key);
            } else {
                log::debug!("registry: evicting unowned thread {}", key);
                self.slots.remove(&key);
            }
        }
    }

    fn evict_owned(&mut self, max: usize) {
        while self.owned_count() > max {
            let victim = self
                .slots
                .iter()
                .filter(|(_, s)| s.ownership == Ownership::Owned && !s.in_use())
                .min_by_key(|(_, s)| s.last_used)
                .map(|(k, _)| k.clone());
            let Some(key) = victim else {
                break;
            };
            log::debug!("registry: evicting least recently used thread {}", key);
            self.slots.remove(&key);
        }
    }

    fn set_ownership(&mut self, key: &ConversationKey, ownership: Ownership, limits: RegistryLimits) {
        let previous = match self.slots.get_mut(key) {
            Some(slot) => std::mem::replace(&mut slot.ownership, ownership),
            None => return,
        };
        match (previous == Ownership::Owned, ownership == Ownership::Owned) {
            (false, true) => {
                self.unowned.retain(|k| k != key);
                self.evict_owned(limits.max_owned);
            }
            (true, false) => {
                self.unowned.push_back(key.clone());
                self.evict_unowned(limits.max_unowned);
            }
            _ => {}
        }
    }
}

fn lock_inner(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory map from thread key to ownership and conversation state.
pub struct ThreadRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    limits: RegistryLimits,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new(RegistryLimits::default())
    }
}

impl ThreadRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            limits,
        }
    }

    pub fn from_config(config: &ThreadsConfig) -> Self {
        Self::new(RegistryLimits {
            max_owned: config.max_owned,
            max_unowned: config.max_unowned,
        })
    }

    /// Wait for exclusive access to a thread. Creates an `Unknown` entry if the key is new.
    pub async fn lock(&self, key: &ConversationKey) -> ThreadGuard {
        let entry = {
            let mut inner = lock_inner(&self.inner);
            inner.tick += 1;
            let tick = inner.tick;
            let entry = match inner.slots.get_mut(key) {
                Some(slot) => {
                    slot.last_used = tick;
                    slot.entry.clone()
                }
                None => {
                    let entry = Arc::new(AsyncMutex::new(ThreadEntry::unknown()));
                    inner.slots.insert(
                        key.clone(),
                        Slot {
                            entry: entry.clone(),
                            ownership: Ownership::Unknown,
                            last_used: tick,
                        },
                    );
                    inner.unowned.push_back(key.clone());
                    entry
                }
            };
            inner.evict_unowned(self.limits.max_unowned);
            entry
        };
        ThreadGuard {
            key: key.clone(),
            entry: entry.lock_owned().await,
            registry: self.inner.clone(),
            limits: self.limits,
        }
    }

    /// Cached ownership without waiting for the entry; `Unknown` if the key is not present.
    pub fn ownership(&self, key: &ConversationKey) -> Ownership {
        lock_inner(&self.inner)
            .slots
            .get(key)
            .map(|s| s.ownership)
            .unwrap_or(Ownership::Unknown)
    }

    /// Copy of a thread's conversation state (waits for any in-flight turn on it).
    pub async fn snapshot(&self, key: &ConversationKey) -> Option<ConversationState> {
        let entry = lock_inner(&self.inner).slots.get(key).map(|s| s.entry.clone())?;
        let guard = entry.lock().await;
        guard.state.clone()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = lock_inner(&self.inner);
        let mut stats = RegistryStats::default();
        for slot in inner.slots.values() {
            match slot.ownership {
                Ownership::Owned => stats.owned += 1,
                Ownership::Rejected => stats.rejected += 1,
                Ownership::Unknown => stats.unknown += 1,
            }
        }
        stats
    }
}

/// Exclusive access to one thread's entry; released on drop.
pub struct ThreadGuard {
    key: ConversationKey,
    entry: OwnedMutexGuard<ThreadEntry>,
    registry: Arc<Mutex<RegistryInner>>,
    limits: RegistryLimits,
}

impl ThreadGuard {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn ownership(&self) -> Ownership {
        self.entry.ownership
    }

    pub fn state(&self) -> Option<&ConversationState> {
        self.entry.state.as_ref()
    }

    fn state_mut(&mut self) -> &mut ConversationState {
        self.entry.state.get_or_insert_with(ConversationState::default)
    }

    fn publish(&self, ownership: Ownership) {
        lock_inner(&self.registry).set_ownership(&self.key, ownership, self.limits);
    }

    /// Classify the thread as owned and create its conversation state. No-op if already owned.
    pub fn mark_owned(&mut self, has_posted_first_reply: bool) {
        if self.entry.ownership == Ownership::Owned {
            return;
        }
        self.entry.ownership = Ownership::Owned;
        self.entry.state = Some(ConversationState {
            has_posted_first_reply,
            ..ConversationState::default()
        });
        self.publish(Ownership::Owned);
    }

    /// Classify the thread as not owned. No conversation state is kept.
    pub fn mark_rejected(&mut self) {
        self.entry.ownership = Ownership::Rejected;
        self.entry.state = None;
        self.publish(Ownership::Rejected);
    }

    /// Start a turn: returns the placeholder text to post.
    ///
    /// The first turn in a thread gets a random pick from the candidates, later turns the follow-up phrase.
    pub fn record_turn_start(&mut self, placeholders: &Placeholders) -> String {
        let state = self.state_mut();
        let text = if state.has_posted_first_reply {
            placeholders.follow_up().to_string()
        } else {
            placeholders.pick_first()
        };
        state.has_posted_first_reply = true;
        text
    }

    pub fn record_placeholder(&mut self, ts: impl Into<String>) {
        self.state_mut().pending_placeholder = Some(ts.into());
    }

    /// Forget the pending placeholder once it has been replaced; returns its ts.
    pub fn clear_placeholder(&mut self) -> Option<String> {
        self.entry.state.as_mut().and_then(|s| s.pending_placeholder.take())
    }

    /// Store the agent session id reported for this thread. Overwrites any previous value.
    pub fn record_token(&mut self, token: impl Into<String>) {
        self.state_mut().continuation_token = Some(token.into());
    }

    pub fn continuation_token(&self) -> Option<&str> {
        self.entry
            .state
            .as_ref()
            .and_then(|s| s.continuation_token.as_deref())
    }
}
