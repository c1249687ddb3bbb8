pub mod lock;
pub mod projection;

pub use lock::{LockProvider, LockSession};
pub use projection::{DeadLetterSink, EventSource, ProjectionSink};
