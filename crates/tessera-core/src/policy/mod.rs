//! Continuation policy engine
//!
//! Decides, per failure, what a shard agent should do next. The engine is a
//! pure function of the error and the number of consecutive failures at the
//! current position; executing the decision is the daemon's job.

pub mod continuation;
pub mod exception_policy;

pub use continuation::Continuation;
pub use exception_policy::{ExceptionPolicies, ExceptionPolicy, PolicyBuilder, PolicyMatch};
