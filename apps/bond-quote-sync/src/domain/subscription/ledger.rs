//! Live Subscription Ledger
//!
//! Tracks which keys the current connection has been asked for and which it
//! has acknowledged, and computes the minimal subscribe/unsubscribe delta
//! against a desired key set.
//!
//! # Entry lifecycle
//!
//! ```text
//! (absent) --reconcile--> Pending --ack--> Live
//!                            |               |
//!                            +---- drop -----+--> Stale --session ready--> Pending
//! ```
//!
//! A nack removes the entry. A key dropped from the desired set is removed
//! immediately and unsubscribed.

use std::collections::{BTreeSet, HashMap};

use super::{SubscriptionChanges, SubscriptionKey};

/// State of one key on the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiveState {
    /// Subscribe sent, not yet acknowledged.
    Pending,
    /// Acknowledged by the server.
    Live,
    /// Acknowledged on a previous connection; must be resubscribed.
    Stale,
}

/// Per-session record of upstream subscriptions.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionLedger {
    entries: HashMap<SubscriptionKey, LiveState>,
}

impl SubscriptionLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff `desired` against the ledger and record the outcome.
    ///
    /// Keys that are pending or live are not resubscribed; keys that are
    /// absent are not unsubscribed. Calling twice with the same set yields an
    /// empty change set the second time.
    pub fn reconcile<'a>(
        &mut self,
        desired: impl IntoIterator<Item = &'a SubscriptionKey>,
    ) -> SubscriptionChanges {
        let desired: BTreeSet<&SubscriptionKey> = desired.into_iter().collect();
        let mut changes = SubscriptionChanges::default();

        for key in &desired {
            match self.entries.get(*key) {
                Some(LiveState::Pending | LiveState::Live) => {}
                Some(LiveState::Stale) | None => {
                    self.entries.insert((*key).clone(), LiveState::Pending);
                    changes.subscribe.insert((*key).clone());
                }
            }
        }

        let removed: Vec<SubscriptionKey> = self
            .entries
            .keys()
            .filter(|key| !desired.contains(key))
            .cloned()
            .collect();
        for key in removed {
            if let Some(state) = self.entries.remove(&key) {
                if state != LiveState::Stale {
                    changes.unsubscribe.insert(key);
                }
            }
        }

        changes
    }

    /// A fresh connection is authenticated: resubscribe the whole desired set.
    ///
    /// Anything left from the previous connection is forgotten; the server
    /// holds no subscriptions for a new connection.
    pub fn session_ready<'a>(
        &mut self,
        desired: impl IntoIterator<Item = &'a SubscriptionKey>,
    ) -> SubscriptionChanges {
        self.entries.clear();
        let keys: BTreeSet<SubscriptionKey> = desired.into_iter().cloned().collect();
        for key in &keys {
            self.entries.insert(key.clone(), LiveState::Pending);
        }
        SubscriptionChanges::subscribe_only(keys)
    }

    /// The connection dropped. Every entry becomes stale.
    pub fn mark_all_stale(&mut self) {
        for state in self.entries.values_mut() {
            *state = LiveState::Stale;
        }
    }

    /// Server acknowledged subscriptions.
    ///
    /// Returns acknowledged keys the ledger no longer wants (removed while the
    /// subscribe was in flight); the caller should unsubscribe them.
    pub fn on_subscribed<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a SubscriptionKey>,
    ) -> Vec<SubscriptionKey> {
        let mut orphaned = Vec::new();
        for key in keys {
            match self.entries.get_mut(key) {
                Some(state) => *state = LiveState::Live,
                None => orphaned.push(key.clone()),
            }
        }
        orphaned
    }

    /// Server rejected subscriptions. Returns how many entries were removed.
    pub fn on_rejected<'a>(&mut self, keys: impl IntoIterator<Item = &'a SubscriptionKey>) -> usize {
        keys.into_iter()
            .filter(|key| self.entries.remove(*key).is_some())
            .count()
    }

    /// Forget everything (logout).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// State of a key.
    #[must_use]
    pub fn state(&self, key: &SubscriptionKey) -> Option<LiveState> {
        self.entries.get(key).copied()
    }

    /// Acknowledged keys.
    pub fn live_keys(&self) -> impl Iterator<Item = &SubscriptionKey> {
        self.entries
            .iter()
            .filter(|(_, state)| **state == LiveState::Live)
            .map(|(key, _)| key)
    }

    /// Number of acknowledged keys.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live_keys().count()
    }

    /// Number of tracked keys in any state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
