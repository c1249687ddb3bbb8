//! Tessera: a projection daemon for event-sourced stores
//!
//! Tessera keeps projections caught up with an event log across a fleet of
//! processes:
//! - **Distributor**: groups shards per physical database into projection sets
//! - **Advisory locks**: session-bound locks decide which process owns a set
//! - **Daemon**: per-database registry of shard agents with start, stop,
//!   pause and wait-for-condition operations
//! - **Agents**: fetch/apply pipelines that consult the exception policies
//!   on every failure
//! - **Coordinator**: the control loop tying it all together
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera::prelude::*;
//!
//! # async fn run(database: DatabaseRef) -> Result<()> {
//! let settings = DaemonSettings::new()
//!     .with_mode(DaemonMode::HotCold)
//!     .with_policies({
//!         let mut policies = ExceptionPolicies::new();
//!         policies.on_apply_error().skip_event();
//!         policies
//!     });
//!
//! let coordinator = ProjectionCoordinator::for_catalog(
//!     settings,
//!     Arc::new(StaticCatalog::single(database)),
//!     vec![ShardName::all("Trips")],
//!     false,
//! )?;
//! coordinator.start().await?;
//! # Ok(())
//! # }
//! ```

mod agent;
pub mod coordinator;
pub mod daemon;
pub mod database;
pub mod dead_letter_queue;
pub mod distributor;
pub mod lock;
pub mod prelude;

// Re-export core types
pub use tessera_core::{
    config::{DaemonMode, DaemonSettings},
    error::{ApplyEventError, Result, TesseraError},
    observe,
    policy::{Continuation, ExceptionPolicies, ExceptionPolicy, PolicyMatch},
    traits::{DeadLetterSink, EventSource, LockProvider, LockSession, ProjectionSink},
    types::{
        AgentStatus, DeadLetterEvent, Event, EventBatch, Sequence, ShardAction, ShardName,
        ShardState, ALL_SHARD_KEY,
    },
};

pub use coordinator::{CoordinatorStatus, ProjectionCoordinator};
pub use daemon::ProjectionDaemon;
pub use database::{DatabaseCatalog, DatabaseRef, DatabaseRefBuilder, StaticCatalog};
pub use dead_letter_queue::{DeadLetterRecord, SqliteDeadLetterQueue};
pub use distributor::{
    distributor_for, random_wait, MultiTenantDistributor, ProjectionDistributor, ProjectionSet,
    SingleTenantDistributor, SoloDistributor,
};
pub use lock::{AdvisoryLock, FileLockProvider, MemoryLockProvider, MemoryLockServer, SessionId};
