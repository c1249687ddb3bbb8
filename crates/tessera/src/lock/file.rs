//! File-backed advisory locks
//!
//! Each `(database, lock id)` pair maps to one lock file under a shared
//! directory. An exclusive `flock(LOCK_EX | LOCK_NB)` is taken on the open
//! handle; the handle is the session, so the kernel drops the lock when the
//! handle closes or the owning process dies.

use async_trait::async_trait;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tessera_core::{LockProvider, LockSession, Result, TesseraError};

#[derive(Debug, Clone)]
pub struct FileLockProvider {
    dir: PathBuf,
    database: String,
}

impl FileLockProvider {
    /// `dir` must be visible to every competing process
    pub fn new(dir: impl Into<PathBuf>, database: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            database: database.into(),
        }
    }

    pub fn lock_path(&self, lock_id: i64) -> PathBuf {
        self.dir.join(format!("{}.{}.lock", self.database, lock_id))
    }
}

#[async_trait]
impl LockProvider for FileLockProvider {
    async fn open_session(&self) -> Result<Box<dyn LockSession>> {
        fs::create_dir_all(&self.dir)?;
        Ok(Box::new(FileLockSession {
            provider: self.clone(),
            held: HashMap::new(),
        }))
    }

    fn describe(&self) -> String {
        format!("file:{}/{}", self.dir.display(), self.database)
    }
}

pub struct FileLockSession {
    provider: FileLockProvider,
    held: HashMap<i64, File>,
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| TesseraError::Lock(format!("open {}: {}", path.display(), e)))
}

#[async_trait]
impl LockSession for FileLockSession {
    async fn try_lock(&mut self, lock_id: i64) -> Result<bool> {
        if self.held.contains_key(&lock_id) {
            return Ok(true);
        }

        let path = self.provider.lock_path(lock_id);
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                self.held.insert(lock_id, file);
                Ok(true)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(false),
            Err(e) => Err(TesseraError::Lock(format!(
                "flock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn unlock(&mut self, lock_id: i64) -> Result<()> {
        if let Some(file) = self.held.remove(&lock_id) {
            file.unlock()?;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn close(self: Box<Self>) -> Result<()> {
        for (_, file) in self.held {
            // Closing the handle releases the lock even if unlock fails
            let _ = file.unlock();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileLockProvider::new(dir.path(), "main");

        let mut a = provider.open_session().await.unwrap();
        let mut b = provider.open_session().await.unwrap();

        assert!(a.try_lock(4444).await.unwrap());
        assert!(!b.try_lock(4444).await.unwrap());

        a.unlock(4444).await.unwrap();
        assert!(b.try_lock(4444).await.unwrap());
    }

    #[tokio::test]
    async fn test_closing_session_releases() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileLockProvider::new(dir.path(), "tenant_a");

        let mut a = provider.open_session().await.unwrap();
        assert!(a.try_lock(1).await.unwrap());
        a.close().await.unwrap();

        let mut b = provider.open_session().await.unwrap();
        assert!(b.try_lock(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_databases_do_not_share_locks() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = FileLockProvider::new(dir.path(), "tenant_a")
            .open_session()
            .await
            .unwrap();
        let mut b = FileLockProvider::new(dir.path(), "tenant_b")
            .open_session()
            .await
            .unwrap();

        assert!(a.try_lock(4444).await.unwrap());
        assert!(b.try_lock(4444).await.unwrap());
    }
}
