//! Per-device listener bookkeeping
//!
//! Listeners are plain (source, event, handler) tuples. The registry is owned
//! by one session and cleared in a single call on teardown.

use super::ChannelKey;

/// What the session does with an event received on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// Forward as a generic "channel attribute observed" signal
    AttributeObserved,
    /// Forward as attribute observed plus "vendor datapoint observed"
    VendorDatapoint,
}

/// One registered listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerEntry {
    pub source: ChannelKey,
    pub event: &'static str,
    pub handler: Handler,
    /// Position in the channel's event-name table (0 = primary)
    pub priority: u8,
}

#[derive(Debug, Default)]
pub struct ListenerRegistry {
    entries: Vec<ListenerEntry>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register a listener. Returns false if (source, event) is already registered.
    pub fn register(&mut self, source: ChannelKey, event: &'static str, handler: Handler, priority: u8) -> bool {
        if self.lookup(source, event).is_some() {
            return false;
        }
        self.entries.push(ListenerEntry {
            source,
            event,
            handler,
            priority,
        });
        true
    }

    /// Find the listener for an event name on a channel (exact match only)
    pub fn lookup(&self, source: ChannelKey, event: &str) -> Option<&ListenerEntry> {
        self.entries
            .iter()
            .find(|e| e.source == source && e.event == event)
    }

    /// Listeners registered on one channel, in priority order
    pub fn for_source(&self, source: ChannelKey) -> Vec<&ListenerEntry> {
        let mut found: Vec<&ListenerEntry> = self.entries.iter().filter(|e| e.source == source).collect();
        found.sort_by_key(|e| e.priority);
        found
    }

    /// Unregister everything. Returns the number of listeners removed.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut reg = ListenerRegistry::new();
        let key = ChannelKey::new(1, 0xEF00);
        assert!(reg.register(key, "dataReport", Handler::VendorDatapoint, 0));
        assert!(!reg.register(key, "dataReport", Handler::VendorDatapoint, 0));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_lookup_is_exact() {
        let mut reg = ListenerRegistry::new();
        let key = ChannelKey::new(2, 0xEF00);
        reg.register(key, "response", Handler::VendorDatapoint, 1);
        assert!(reg.lookup(key, "response").is_some());
        assert!(reg.lookup(key, "Response").is_none());
        assert!(reg.lookup(key, "responses").is_none());
    }

    #[test]
    fn test_clear_returns_count() {
        let mut reg = ListenerRegistry::new();
        reg.register(ChannelKey::new(1, 0xEF00), "dataReport", Handler::VendorDatapoint, 0);
        reg.register(ChannelKey::new(1, 0xFC11), "attributeReport", Handler::AttributeObserved, 0);
        assert_eq!(reg.clear(), 2);
        assert!(reg.is_empty());
    }
}
