use crate::error::Result;
use async_trait::async_trait;

/// Opens sessions against the lock primitive of one database
#[async_trait]
pub trait LockProvider: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn LockSession>>;

    /// Label used in logs
    fn describe(&self) -> String;
}

/// A live connection holding zero or more keyed locks.
///
/// Locks belong to the session: when the session dies every lock it held is
/// released by the server without any action on our side.
#[async_trait]
pub trait LockSession: Send + Sync {
    /// Non-blocking attempt; `Ok(false)` when another session owns the lock
    async fn try_lock(&mut self, lock_id: i64) -> Result<bool>;

    async fn unlock(&mut self, lock_id: i64) -> Result<()>;

    /// False once the underlying connection has been lost
    fn is_alive(&self) -> bool;

    async fn close(self: Box<Self>) -> Result<()>;
}
