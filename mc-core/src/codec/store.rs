//! Latest-value store for decoded datapoints

use std::collections::BTreeMap;

use super::datapoint::DatapointRecord;
use crate::constants::codec::MAX_STORED_DATAPOINTS;
use crate::timers::Millis;

/// Result of applying a record to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Record stored; `first_seen` is true the first time a dp id appears
    Applied { first_seen: bool },
    /// Record older than the stored one; ignored
    Stale { stored_timestamp: Millis },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

/// Per-device datapoint table, one slot per dp id.
///
/// The most recent record by timestamp wins. A record with the same
/// timestamp as the stored one replaces it (arrival order breaks ties).
#[derive(Debug, Default)]
pub struct DatapointStore {
    records: BTreeMap<u8, DatapointRecord>,
}

impl DatapointStore {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, mut record: DatapointRecord) -> ApplyOutcome {
        match self.records.get(&record.dp_id) {
            Some(existing) if record.timestamp < existing.timestamp => ApplyOutcome::Stale {
                stored_timestamp: existing.timestamp,
            },
            Some(existing) => {
                record.occurrence_count = existing.occurrence_count.saturating_add(1);
                self.records.insert(record.dp_id, record);
                ApplyOutcome::Applied { first_seen: false }
            }
            None => {
                debug_assert!(self.records.len() < MAX_STORED_DATAPOINTS);
                record.occurrence_count = 1;
                self.records.insert(record.dp_id, record);
                ApplyOutcome::Applied { first_seen: true }
            }
        }
    }

    pub fn get(&self, dp_id: u8) -> Option<&DatapointRecord> {
        self.records.get(&dp_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatapointRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DataType, DatapointValue};

    fn record(dp_id: u8, value: i32, timestamp: Millis) -> DatapointRecord {
        DatapointRecord {
            dp_id,
            data_type: DataType::Integer32,
            raw_bytes: value.to_be_bytes().to_vec(),
            value: DatapointValue::Integer32(value),
            timestamp,
            occurrence_count: 1,
        }
    }

    #[test]
    fn test_newer_wins_regardless_of_arrival() {
        let mut store = DatapointStore::new();
        assert_eq!(store.apply(record(4, 200, 20)), ApplyOutcome::Applied { first_seen: true });
        assert_eq!(store.apply(record(4, 100, 10)), ApplyOutcome::Stale { stored_timestamp: 20 });
        assert_eq!(store.get(4).map(|r| r.value.clone()), Some(DatapointValue::Integer32(200)));
    }

    #[test]
    fn test_equal_timestamp_replaces_and_counts() {
        let mut store = DatapointStore::new();
        store.apply(record(4, 1, 10));
        assert!(store.apply(record(4, 2, 10)).is_applied());
        let stored = store.get(4).unwrap();
        assert_eq!(stored.value, DatapointValue::Integer32(2));
        assert_eq!(stored.occurrence_count, 2);
    }

    #[test]
    fn test_independent_dp_ids() {
        let mut store = DatapointStore::new();
        store.apply(record(1, 1, 50));
        store.apply(record(2, 2, 10));
        assert_eq!(store.len(), 2);
    }
}
