//! Tessera Prelude
//!
//! Import this to get all commonly used types and traits:
//!
//! ```
//! use tessera::prelude::*;
//! ```

// Core types
pub use crate::{
    AgentStatus, ApplyEventError, Event, EventBatch, Result, Sequence, ShardName, ShardState,
    TesseraError,
};

// Configuration and policies
pub use crate::{Continuation, DaemonMode, DaemonSettings, ExceptionPolicies};

// Collaborator traits
pub use crate::{DeadLetterSink, EventSource, LockProvider, ProjectionSink};

// Runtime
pub use crate::{
    CoordinatorStatus, DatabaseCatalog, DatabaseRef, ProjectionCoordinator, ProjectionDaemon,
    StaticCatalog,
};

// Implementations
pub use crate::{FileLockProvider, MemoryLockServer, SqliteDeadLetterQueue};
