//! TTL tracker (component C).
//!
//! Tracks a per-resource-name expiry deadline. The tracker itself performs no
//! I/O and owns no clock; the caller (the async worker) is responsible for
//! polling [`TtlTracker::expired_before`] against its own notion of "now" and
//! for scheduling a wakeup at [`TtlTracker::next_deadline`].

use std::collections::HashMap;
use std::time::Instant;

/// Per-resource-name expiry timers.
#[derive(Debug, Default)]
pub struct TtlTracker {
    deadlines: HashMap<String, Instant>,
}

impl TtlTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or rearm) the timer for `name` with an absolute `deadline`.
    pub fn arm(&mut self, name: impl Into<String>, deadline: Instant) {
        self.deadlines.insert(name.into(), deadline);
    }

    /// Cancel any timer for `name`. A no-op if none is armed.
    pub fn cancel(&mut self, name: &str) {
        self.deadlines.remove(name);
    }

    /// The earliest deadline currently armed, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return the names whose deadline is at or before `now`.
    pub fn expired_before(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            self.deadlines.remove(name);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expires_only_past_deadlines() {
        let mut tracker = TtlTracker::new();
        let now = Instant::now();
        tracker.arm("a", now + Duration::from_millis(10));
        tracker.arm("b", now + Duration::from_secs(60));

        let expired = tracker.expired_before(now + Duration::from_millis(20));
        assert_eq!(expired, vec!["a".to_string()]);
        assert_eq!(tracker.next_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn cancel_removes_timer() {
        let mut tracker = TtlTracker::new();
        let now = Instant::now();
        tracker.arm("a", now + Duration::from_millis(10));
        tracker.cancel("a");
        assert!(tracker.expired_before(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn rearming_replaces_deadline() {
        let mut tracker = TtlTracker::new();
        let now = Instant::now();
        tracker.arm("a", now + Duration::from_millis(10));
        tracker.arm("a", now + Duration::from_secs(60));
        assert!(tracker.expired_before(now + Duration::from_millis(20)).is_empty());
    }
}
