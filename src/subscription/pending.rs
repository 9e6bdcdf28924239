//! Pending-delta buffer (component B).
//!
//! Accumulates the add/remove deltas the user has requested since the last
//! request was built. The invariant `to_subscribe ∩ to_unsubscribe = ∅`
//! (spec §3, §8 invariant 1) is enforced structurally: the only way to
//! mutate either set is through [`PendingDelta::subscribe`] /
//! [`PendingDelta::unsubscribe`], which always remove the name from the
//! other set first.

use std::collections::HashSet;

/// Two disjoint sets of resource names awaiting their next request.
#[derive(Debug, Default)]
pub struct PendingDelta {
    to_subscribe: HashSet<String>,
    to_unsubscribe: HashSet<String>,
}

impl PendingDelta {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `name` should be (re-)subscribed to.
    pub fn subscribe(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.to_unsubscribe.remove(&name);
        self.to_subscribe.insert(name);
    }

    /// Record that `name` should be unsubscribed from.
    pub fn unsubscribe(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.to_subscribe.remove(&name);
        self.to_unsubscribe.insert(name);
    }

    /// Names pending subscription.
    pub fn to_subscribe(&self) -> &HashSet<String> {
        &self.to_subscribe
    }

    /// Names pending unsubscription.
    pub fn to_unsubscribe(&self) -> &HashSet<String> {
        &self.to_unsubscribe
    }

    /// Whether either set has pending entries.
    pub fn is_empty(&self) -> bool {
        self.to_subscribe.is_empty() && self.to_unsubscribe.is_empty()
    }

    /// Drain both sets, returning (subscribe, unsubscribe) as sorted vectors
    /// for deterministic wire output, and clear the buffer.
    pub fn drain(&mut self) -> (Vec<String>, Vec<String>) {
        let mut subscribe: Vec<String> = self.to_subscribe.drain().collect();
        let mut unsubscribe: Vec<String> = self.to_unsubscribe.drain().collect();
        subscribe.sort_unstable();
        unsubscribe.sort_unstable();
        (subscribe, unsubscribe)
    }

    /// Discard all pending unsubscribes without sending them. Used when
    /// building the first request of a stream (spec §4.4 item 1: "no
    /// meaningful unsubscribe on a brand-new stream").
    pub fn clear_unsubscribe(&mut self) {
        self.to_unsubscribe.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_then_unsubscribe_keeps_disjoint() {
        let mut pending = PendingDelta::new();
        pending.subscribe("a");
        pending.unsubscribe("a");
        assert!(!pending.to_subscribe().contains("a"));
        assert!(pending.to_unsubscribe().contains("a"));
    }

    #[test]
    fn unsubscribe_then_subscribe_keeps_disjoint() {
        let mut pending = PendingDelta::new();
        pending.unsubscribe("a");
        pending.subscribe("a");
        assert!(pending.to_subscribe().contains("a"));
        assert!(!pending.to_unsubscribe().contains("a"));
    }

    #[test]
    fn drain_empties_and_sorts() {
        let mut pending = PendingDelta::new();
        pending.subscribe("b");
        pending.subscribe("a");
        let (sub, unsub) = pending.drain();
        assert_eq!(sub, vec!["a".to_string(), "b".to_string()]);
        assert!(unsub.is_empty());
        assert!(pending.is_empty());
    }
}
