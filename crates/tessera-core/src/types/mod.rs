pub mod dead_letter;
pub mod event;
pub mod shard;

pub use dead_letter::DeadLetterEvent;
pub use event::{Event, EventBatch, Sequence};
pub use shard::{AgentStatus, ShardAction, ShardName, ShardState, ALL_SHARD_KEY};
