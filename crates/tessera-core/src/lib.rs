//! Tessera Core: types, traits and policies for the tessera projection daemon
//!
//! This crate defines the pieces shared by every part of the daemon:
//! - Shard identity and state snapshots
//! - Collaborator traits for the event store, projection storage,
//!   dead-letter storage and session-bound advisory locks
//! - Daemon configuration
//! - The continuation policy engine that turns a failure into a decision
//!   (retry, skip, pause or stop)

pub mod config;
pub mod error;
pub mod observe;
pub mod policy;
pub mod traits;
pub mod types;

pub use config::{DaemonMode, DaemonSettings};
pub use error::{ApplyEventError, Result, TesseraError};
pub use policy::{Continuation, ExceptionPolicies, ExceptionPolicy, PolicyMatch};
pub use traits::{DeadLetterSink, EventSource, LockProvider, LockSession, ProjectionSink};
pub use types::{
    AgentStatus, DeadLetterEvent, Event, EventBatch, Sequence, ShardAction, ShardName, ShardState,
};
