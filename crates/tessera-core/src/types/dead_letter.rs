use super::event::Sequence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record of an event skipped by `Continuation::SkipEvent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub projection_name: String,
    pub shard_key: String,
    pub event_sequence: Sequence,
    pub event_type: String,
    pub error_summary: String,
    pub recorded_at: DateTime<Utc>,
}
