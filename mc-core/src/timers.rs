//! Cancellable deadlines owned by a single device session
//!
//! Every timer a component registers lives in a `TimerSet` so teardown can
//! cancel all of them at once and report how many were pending.

use std::collections::BTreeMap;

/// Milliseconds on the session's monotonic clock
pub type Millis = u64;

/// Set of named deadlines, at most one per key
#[derive(Debug, Clone)]
pub struct TimerSet<K: Ord + Clone> {
    deadlines: BTreeMap<K, Millis>,
}

impl<K: Ord + Clone> TimerSet<K> {
    pub fn new() -> Self {
        Self {
            deadlines: BTreeMap::new(),
        }
    }

    /// Schedule `key` to fire at `at`, replacing any pending deadline for it.
    /// Returns the replaced deadline.
    pub fn schedule(&mut self, key: K, at: Millis) -> Option<Millis> {
        self.deadlines.insert(key, at)
    }

    /// Cancel a pending timer. Returns whether it was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Cancel every pending timer and return how many there were
    pub fn cancel_all(&mut self) -> usize {
        let count = self.deadlines.len();
        self.deadlines.clear();
        count
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn deadline(&self, key: &K) -> Option<Millis> {
        self.deadlines.get(key).copied()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Millis> {
        self.deadlines.values().copied().min()
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn take_expired(&mut self, now: Millis) -> Vec<K> {
        let mut due: Vec<(Millis, K)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (*at, k.clone()))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, k)| k).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl<K: Ord + Clone> Default for TimerSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_expired_in_deadline_order() {
        let mut timers = TimerSet::new();
        timers.schedule("b", 200);
        timers.schedule("a", 300);
        timers.schedule("c", 100);

        assert_eq!(timers.next_deadline(), Some(100));
        assert_eq!(timers.take_expired(250), vec!["c", "b"]);
        assert_eq!(timers.len(), 1);
        assert!(timers.is_pending(&"a"));
    }

    #[test]
    fn test_reschedule_replaces() {
        let mut timers = TimerSet::new();
        timers.schedule(1u8, 100);
        assert_eq!(timers.schedule(1u8, 500), Some(100));
        assert!(timers.take_expired(200).is_empty());
    }

    #[test]
    fn test_cancel_all_counts() {
        let mut timers = TimerSet::new();
        timers.schedule(1u8, 10);
        timers.schedule(2u8, 20);
        assert_eq!(timers.cancel_all(), 2);
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}
