//! Session-bound advisory locks
//!
//! [`AdvisoryLock`] is the per-database view a coordinator has of the locks
//! it holds. Validity is tied to one live [`LockSession`]: if the session
//! dies, the server releases everything it held and every later
//! [`AdvisoryLock::has_lock`] reports false. Nothing is cached across that
//! boundary.

pub mod file;
pub mod memory;

pub use file::FileLockProvider;
pub use memory::{MemoryLockProvider, MemoryLockServer, SessionId};

use std::collections::BTreeSet;
use std::sync::Arc;
use tessera_core::{observe, LockProvider, LockSession, Result};
use tokio_util::sync::CancellationToken;

/// Keyed distributed mutex for one database
pub struct AdvisoryLock {
    database_id: String,
    provider: Arc<dyn LockProvider>,
    session: Option<Box<dyn LockSession>>,
    held: BTreeSet<i64>,
}

impl AdvisoryLock {
    pub fn new(database_id: impl Into<String>, provider: Arc<dyn LockProvider>) -> Self {
        Self {
            database_id: database_id.into(),
            provider,
            session: None,
            held: BTreeSet::new(),
        }
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// True only while the lock is recorded as held and the session that
    /// holds it is still alive. Never blocks.
    pub fn has_lock(&self, lock_id: i64) -> bool {
        match &self.session {
            Some(session) => session.is_alive() && self.held.contains(&lock_id),
            None => false,
        }
    }

    /// Lock ids currently believed held (empty once the session is lost)
    pub fn held_locks(&self) -> Vec<i64> {
        match &self.session {
            Some(session) if session.is_alive() => self.held.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Non-blocking acquisition attempt. Losing the race is `Ok(false)`.
    pub async fn try_attain_lock(&mut self, lock_id: i64, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        if self.has_lock(lock_id) {
            return Ok(true);
        }

        self.discard_dead_session();
        if self.session.is_none() {
            let session = tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                session = self.provider.open_session() => session?,
            };
            self.session = Some(session);
        }

        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        let acquired = tokio::select! {
            _ = cancel.cancelled() => false,
            acquired = session.try_lock(lock_id) => acquired?,
        };

        observe::record_lock_attempt(acquired);
        if acquired {
            self.held.insert(lock_id);
            tracing::info!(
                database = %self.database_id,
                lock_id,
                provider = %self.provider.describe(),
                "Attained advisory lock"
            );
        } else {
            tracing::debug!(database = %self.database_id, lock_id, "Advisory lock is held elsewhere");
        }
        Ok(acquired)
    }

    /// Explicit release. A session that is already gone counts as released.
    pub async fn release_lock(&mut self, lock_id: i64) -> Result<()> {
        if !self.held.remove(&lock_id) {
            return Ok(());
        }

        if let Some(session) = self.session.as_mut() {
            if session.is_alive() {
                session.unlock(lock_id).await?;
            }
        }
        tracing::info!(database = %self.database_id, lock_id, "Released advisory lock");

        if self.held.is_empty() {
            self.close_session().await;
        }
        Ok(())
    }

    /// Release everything and close the session
    pub async fn dispose(&mut self) -> Result<()> {
        let ids: Vec<i64> = self.held.iter().copied().collect();
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.release_lock(id).await {
                tracing::warn!(database = %self.database_id, lock_id = id, "Failed to release lock: {}", e);
                first_error.get_or_insert(e);
            }
        }
        self.held.clear();
        self.close_session().await;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn discard_dead_session(&mut self) {
        let dead = matches!(&self.session, Some(session) if !session.is_alive());
        if dead {
            tracing::warn!(
                database = %self.database_id,
                lost = ?self.held,
                "Advisory lock session was lost"
            );
            self.session = None;
            self.held.clear();
        }
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                tracing::debug!(database = %self.database_id, "Error closing lock session: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_on(server: &MemoryLockServer) -> AdvisoryLock {
        AdvisoryLock::new("main", Arc::new(server.provider()))
    }

    #[tokio::test]
    async fn test_only_one_holder() {
        let server = MemoryLockServer::new("main");
        let cancel = CancellationToken::new();
        let mut a = lock_on(&server);
        let mut b = lock_on(&server);

        assert!(a.try_attain_lock(4444, &cancel).await.unwrap());
        assert!(!b.try_attain_lock(4444, &cancel).await.unwrap());
        assert!(a.has_lock(4444));
        assert!(!b.has_lock(4444));
    }

    #[tokio::test]
    async fn test_release_hands_over() {
        let server = MemoryLockServer::new("main");
        let cancel = CancellationToken::new();
        let mut a = lock_on(&server);
        let mut b = lock_on(&server);

        assert!(a.try_attain_lock(1, &cancel).await.unwrap());
        a.release_lock(1).await.unwrap();
        assert!(!a.has_lock(1));
        assert!(b.try_attain_lock(1, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_loss_is_detected() {
        let server = MemoryLockServer::new("main");
        let cancel = CancellationToken::new();
        let mut a = lock_on(&server);
        let mut b = lock_on(&server);

        assert!(a.try_attain_lock(9, &cancel).await.unwrap());
        let session = server.holder_of(9).unwrap();
        server.terminate_session(session);

        assert!(!a.has_lock(9));
        assert!(a.held_locks().is_empty());
        assert!(b.try_attain_lock(9, &cancel).await.unwrap());
        assert!(!a.try_attain_lock(9, &cancel).await.unwrap());

        // disposing after the loss is not an error
        a.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_reacquire_after_loss_opens_new_session() {
        let server = MemoryLockServer::new("main");
        let cancel = CancellationToken::new();
        let mut a = lock_on(&server);

        assert!(a.try_attain_lock(2, &cancel).await.unwrap());
        server.terminate_session(server.holder_of(2).unwrap());
        assert!(a.try_attain_lock(2, &cancel).await.unwrap());
        assert!(a.has_lock(2));
    }

    #[tokio::test]
    async fn test_cancelled_token_never_acquires() {
        let server = MemoryLockServer::new("main");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut a = lock_on(&server);

        assert!(!a.try_attain_lock(3, &cancel).await.unwrap());
        assert_eq!(server.holder_of(3), None);
    }
}
