use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Event sequence number - strictly monotonic u64 across the store
pub type Sequence = u64;

/// An event as handed to a projection shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: Sequence,
    pub event_type: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    pub fn new(sequence: Sequence, event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            event_type: event_type.into(),
            payload,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A contiguous range of the log fetched for one shard.
///
/// `floor` is exclusive and `ceiling` inclusive: the batch covers
/// `(floor, ceiling]`. `events` may be sparse (filtered by the source, or with
/// skipped events removed) but is always in ascending sequence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    pub floor: Sequence,
    pub ceiling: Sequence,
    pub events: Vec<Event>,
}

impl EventBatch {
    pub fn new(floor: Sequence, ceiling: Sequence, events: Vec<Event>) -> Self {
        Self {
            floor,
            ceiling,
            events,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Drop one event from the batch, keeping the range unchanged.
    ///
    /// Returns true if an event with that sequence was present.
    pub fn remove(&mut self, sequence: Sequence) -> bool {
        let before = self.events.len();
        self.events.retain(|e| e.sequence != sequence);
        self.events.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_keeps_range_and_order() {
        let mut batch = EventBatch::new(
            10,
            13,
            vec![
                Event::new(11, "A", vec![]),
                Event::new(12, "B", vec![]),
                Event::new(13, "C", vec![]),
            ],
        );

        assert!(batch.remove(12));
        assert!(!batch.remove(12));
        assert_eq!(batch.floor, 10);
        assert_eq!(batch.ceiling, 13);
        let seqs: Vec<_> = batch.events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![11, 13]);
    }
}
