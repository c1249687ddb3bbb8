use crate::types::{DeadLetterEvent, EventBatch, Sequence, ShardName};
use async_trait::async_trait;

/// Read side of the event store as seen by shard agents
///
/// Errors are returned as `anyhow::Error` so the concrete error type is
/// preserved for exception policies.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Highest sequence known to be durably committed to the log
    async fn high_water_mark(&self) -> anyhow::Result<Sequence>;

    /// Fetch the events for `shard` in `(floor, ceiling]`, ascending
    async fn fetch_batch(
        &self,
        shard: &ShardName,
        floor: Sequence,
        ceiling: Sequence,
    ) -> anyhow::Result<EventBatch>;
}

/// Projection storage: applies batches and tracks per-shard progress
#[async_trait]
pub trait ProjectionSink: Send + Sync {
    /// Last sequence durably applied for `shard` (0 when never run)
    async fn progress(&self, shard: &ShardName) -> anyhow::Result<Sequence>;

    /// Apply a batch and record `batch.ceiling` as the new progress.
    ///
    /// Must be all-or-nothing. When a single event is to blame the error
    /// should carry an [`ApplyEventError`](crate::error::ApplyEventError).
    async fn apply(&self, shard: &ShardName, batch: &EventBatch) -> anyhow::Result<Sequence>;
}

/// Persistent store for skipped events
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, event: DeadLetterEvent) -> anyhow::Result<()>;
}
