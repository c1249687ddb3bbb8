//! In-process session-bound lock server
//!
//! Behaves like a database's advisory locks: every lock belongs to a session,
//! closing or losing the session releases what it held. Sessions can be
//! terminated from the server side to simulate a dropped connection.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{LockProvider, LockSession, Result, TesseraError};

/// Identifier of one open session
pub type SessionId = u64;

#[derive(Default)]
struct ServerState {
    /// lock id -> owning session
    owners: HashMap<i64, SessionId>,
    /// session -> liveness flag shared with the session handle
    sessions: HashMap<SessionId, Arc<AtomicBool>>,
}

/// Shared lock "database". Clone it to hand the same server to several
/// coordinators.
#[derive(Clone)]
pub struct MemoryLockServer {
    name: Arc<str>,
    state: Arc<Mutex<ServerState>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryLockServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(Mutex::new(ServerState::default())),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn provider(&self) -> MemoryLockProvider {
        MemoryLockProvider {
            server: self.clone(),
        }
    }

    /// Session currently owning `lock_id`, if any
    pub fn holder_of(&self, lock_id: i64) -> Option<SessionId> {
        self.state.lock().owners.get(&lock_id).copied()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Kill a session from the server side, releasing all of its locks.
    ///
    /// Returns false if the session was not open.
    pub fn terminate_session(&self, session: SessionId) -> bool {
        let mut state = self.state.lock();
        let Some(alive) = state.sessions.remove(&session) else {
            return false;
        };
        alive.store(false, Ordering::SeqCst);
        state.owners.retain(|_, owner| *owner != session);
        tracing::debug!(server = %self.name, session, "terminated lock session");
        true
    }

    fn open(&self) -> MemoryLockSession {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.state.lock().sessions.insert(id, alive.clone());
        MemoryLockSession {
            id,
            server: self.clone(),
            alive,
        }
    }

    fn try_lock(&self, session: SessionId, lock_id: i64) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&session) {
            return Err(TesseraError::Connection(format!(
                "lock session {} on {} is closed",
                session, self.name
            )));
        }
        match state.owners.get(&lock_id) {
            Some(owner) => Ok(*owner == session),
            None => {
                state.owners.insert(lock_id, session);
                Ok(true)
            }
        }
    }

    fn unlock(&self, session: SessionId, lock_id: i64) {
        let mut state = self.state.lock();
        if state.owners.get(&lock_id) == Some(&session) {
            state.owners.remove(&lock_id);
        }
    }

    fn close(&self, session: SessionId) {
        let mut state = self.state.lock();
        if let Some(alive) = state.sessions.remove(&session) {
            alive.store(false, Ordering::SeqCst);
        }
        state.owners.retain(|_, owner| *owner != session);
    }
}

/// [`LockProvider`] handing out sessions on a [`MemoryLockServer`]
#[derive(Clone)]
pub struct MemoryLockProvider {
    server: MemoryLockServer,
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    async fn open_session(&self) -> Result<Box<dyn LockSession>> {
        Ok(Box::new(self.server.open()))
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.server.name)
    }
}

pub struct MemoryLockSession {
    id: SessionId,
    server: MemoryLockServer,
    alive: Arc<AtomicBool>,
}

impl MemoryLockSession {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

#[async_trait]
impl LockSession for MemoryLockSession {
    async fn try_lock(&mut self, lock_id: i64) -> Result<bool> {
        self.server.try_lock(self.id, lock_id)
    }

    async fn unlock(&mut self, lock_id: i64) -> Result<()> {
        self.server.unlock(self.id, lock_id);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        // Drop does the work
        Ok(())
    }
}

impl Drop for MemoryLockSession {
    fn drop(&mut self) {
        self.server.close(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_session_is_refused() {
        let server = MemoryLockServer::new("db1");
        let provider = server.provider();

        let mut a = provider.open_session().await.unwrap();
        let mut b = provider.open_session().await.unwrap();

        assert!(a.try_lock(1).await.unwrap());
        assert!(a.try_lock(1).await.unwrap(), "re-entrant for the owner");
        assert!(!b.try_lock(1).await.unwrap());
        assert!(b.try_lock(2).await.unwrap(), "different key is independent");
    }

    #[tokio::test]
    async fn test_terminated_session_loses_locks() {
        let server = MemoryLockServer::new("db1");
        let provider = server.provider();

        let mut a = provider.open_session().await.unwrap();
        let mut b = provider.open_session().await.unwrap();
        assert!(a.try_lock(7).await.unwrap());

        let holder = server.holder_of(7).unwrap();
        assert!(server.terminate_session(holder));
        assert!(!a.is_alive());
        assert!(a.try_lock(7).await.is_err());
        assert!(b.try_lock(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_releases_locks() {
        let server = MemoryLockServer::new("db1");
        let provider = server.provider();

        {
            let mut a = provider.open_session().await.unwrap();
            assert!(a.try_lock(3).await.unwrap());
        }
        assert_eq!(server.holder_of(3), None);
        assert_eq!(server.open_sessions(), 0);
    }
}
