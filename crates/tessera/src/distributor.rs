//! Projection distribution
//!
//! Decides which shards must be co-located under one advisory lock and who
//! gets to run them. One [`ProjectionSet`] is produced per physical database;
//! the set's lock lives in that database, so in multi-tenant mode different
//! processes can own different tenants at the same time.

use crate::database::{DatabaseCatalog, DatabaseRef};
use crate::lock::AdvisoryLock;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{DaemonMode, DaemonSettings, Result, ShardName, TesseraError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Shards that must run together against one database under one lock
#[derive(Debug, Clone)]
pub struct ProjectionSet {
    pub lock_id: i64,
    pub database: DatabaseRef,
    pub names: Vec<ShardName>,
}

impl ProjectionSet {
    pub fn database_id(&self) -> &str {
        self.database.id()
    }
}

#[async_trait]
pub trait ProjectionDistributor: Send + Sync {
    /// Candidate sets, freshly built and in random order
    async fn build_distribution(&self) -> Result<Vec<ProjectionSet>>;

    async fn has_lock(&self, set: &ProjectionSet) -> bool;

    async fn try_attain_lock(&self, set: &ProjectionSet, cancel: &CancellationToken)
        -> Result<bool>;

    async fn release_lock(&self, set: &ProjectionSet) -> Result<()>;

    async fn release_all_locks(&self) -> Result<()>;

    /// Whether releasing a set lets another process pick it up. When false,
    /// a stopped shard stays stopped and its siblings keep running.
    fn can_hand_off(&self) -> bool {
        true
    }

    /// Jittered delay before the first distribution attempt
    async fn random_wait(&self, cancel: &CancellationToken);
}

/// Pick the distributor matching the configured mode and tenancy
pub fn distributor_for(
    settings: &DaemonSettings,
    catalog: Arc<dyn DatabaseCatalog>,
    shards: Vec<ShardName>,
    multi_tenant: bool,
) -> Arc<dyn ProjectionDistributor> {
    match (settings.mode, multi_tenant) {
        (DaemonMode::Solo, _) => Arc::new(SoloDistributor::new(catalog, shards)),
        (DaemonMode::HotCold, false) => Arc::new(SingleTenantDistributor::new(
            catalog,
            shards,
            settings.daemon_lock_id,
            settings.max_startup_jitter(),
        )),
        (DaemonMode::HotCold, true) => Arc::new(MultiTenantDistributor::new(
            catalog,
            shards,
            settings.daemon_lock_id,
            settings.max_startup_jitter(),
        )),
    }
}

/// Sleep for a random duration in `[0, max]`, waking early on cancellation
pub async fn random_wait(max: Duration, cancel: &CancellationToken) {
    if max.is_zero() {
        return;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_millis(millis)) => {}
    }
}

fn build_sets(databases: Vec<DatabaseRef>, shards: &[ShardName], lock_id: i64) -> Vec<ProjectionSet> {
    let mut sets: Vec<ProjectionSet> = databases
        .into_iter()
        .map(|database| ProjectionSet {
            lock_id,
            database,
            names: shards.to_vec(),
        })
        .collect();
    sets.shuffle(&mut rand::thread_rng());
    sets
}

/// Single process: no locking, every set is always owned
pub struct SoloDistributor {
    catalog: Arc<dyn DatabaseCatalog>,
    shards: Vec<ShardName>,
}

impl SoloDistributor {
    pub fn new(catalog: Arc<dyn DatabaseCatalog>, shards: Vec<ShardName>) -> Self {
        Self { catalog, shards }
    }
}

#[async_trait]
impl ProjectionDistributor for SoloDistributor {
    async fn build_distribution(&self) -> Result<Vec<ProjectionSet>> {
        let databases = self.catalog.databases().await?;
        Ok(build_sets(databases, &self.shards, 0))
    }

    async fn has_lock(&self, _set: &ProjectionSet) -> bool {
        true
    }

    async fn try_attain_lock(
        &self,
        _set: &ProjectionSet,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(!cancel.is_cancelled())
    }

    async fn release_lock(&self, _set: &ProjectionSet) -> Result<()> {
        Ok(())
    }

    async fn release_all_locks(&self) -> Result<()> {
        Ok(())
    }

    fn can_hand_off(&self) -> bool {
        false
    }

    async fn random_wait(&self, _cancel: &CancellationToken) {}
}

/// One [`AdvisoryLock`] per database id, created on first use
#[derive(Default)]
struct LockRegistry {
    locks: Mutex<HashMap<String, AdvisoryLock>>,
}

impl LockRegistry {
    async fn has_lock(&self, set: &ProjectionSet) -> bool {
        let locks = self.locks.lock().await;
        locks
            .get(set.database_id())
            .map(|lock| lock.has_lock(set.lock_id))
            .unwrap_or(false)
    }

    async fn try_attain_lock(&self, set: &ProjectionSet, cancel: &CancellationToken) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        let lock = locks
            .entry(set.database_id().to_string())
            .or_insert_with(|| AdvisoryLock::new(set.database_id(), set.database.locks().clone()));
        lock.try_attain_lock(set.lock_id, cancel).await
    }

    async fn release_lock(&self, set: &ProjectionSet) -> Result<()> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(set.database_id()) {
            Some(lock) => lock.release_lock(set.lock_id).await,
            None => Ok(()),
        }
    }

    async fn release_all(&self) -> Result<()> {
        let mut locks = self.locks.lock().await;
        let mut first_error: Option<TesseraError> = None;
        for (database, lock) in locks.iter_mut() {
            if let Err(e) = lock.dispose().await {
                tracing::warn!(database = %database, "Failed to release advisory locks: {}", e);
                first_error.get_or_insert(e);
            }
        }
        locks.clear();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// One database, real locks: at most one competing process runs the shards
pub struct SingleTenantDistributor {
    catalog: Arc<dyn DatabaseCatalog>,
    shards: Vec<ShardName>,
    lock_id: i64,
    max_jitter: Duration,
    locks: LockRegistry,
}

impl SingleTenantDistributor {
    pub fn new(
        catalog: Arc<dyn DatabaseCatalog>,
        shards: Vec<ShardName>,
        lock_id: i64,
        max_jitter: Duration,
    ) -> Self {
        Self {
            catalog,
            shards,
            lock_id,
            max_jitter,
            locks: LockRegistry::default(),
        }
    }
}

#[async_trait]
impl ProjectionDistributor for SingleTenantDistributor {
    async fn build_distribution(&self) -> Result<Vec<ProjectionSet>> {
        let mut databases = self.catalog.databases().await?;
        if databases.len() > 1 {
            tracing::warn!(
                count = databases.len(),
                "Single-tenant distributor found several databases; using the first"
            );
        }
        databases.truncate(1);
        if databases.is_empty() {
            return Err(TesseraError::Config("no database configured".into()));
        }
        Ok(build_sets(databases, &self.shards, self.lock_id))
    }

    async fn has_lock(&self, set: &ProjectionSet) -> bool {
        self.locks.has_lock(set).await
    }

    async fn try_attain_lock(&self, set: &ProjectionSet, cancel: &CancellationToken) -> Result<bool> {
        self.locks.try_attain_lock(set, cancel).await
    }

    async fn release_lock(&self, set: &ProjectionSet) -> Result<()> {
        self.locks.release_lock(set).await
    }

    async fn release_all_locks(&self) -> Result<()> {
        self.locks.release_all().await
    }

    async fn random_wait(&self, cancel: &CancellationToken) {
        random_wait(self.max_jitter, cancel).await
    }
}

/// One lock per tenant database; tenants are spread across processes
pub struct MultiTenantDistributor {
    catalog: Arc<dyn DatabaseCatalog>,
    shards: Vec<ShardName>,
    lock_id: i64,
    max_jitter: Duration,
    locks: LockRegistry,
}

impl MultiTenantDistributor {
    pub fn new(
        catalog: Arc<dyn DatabaseCatalog>,
        shards: Vec<ShardName>,
        lock_id: i64,
        max_jitter: Duration,
    ) -> Self {
        Self {
            catalog,
            shards,
            lock_id,
            max_jitter,
            locks: LockRegistry::default(),
        }
    }
}

#[async_trait]
impl ProjectionDistributor for MultiTenantDistributor {
    async fn build_distribution(&self) -> Result<Vec<ProjectionSet>> {
        let databases = self.catalog.databases().await?;
        Ok(build_sets(databases, &self.shards, self.lock_id))
    }

    async fn has_lock(&self, set: &ProjectionSet) -> bool {
        self.locks.has_lock(set).await
    }

    async fn try_attain_lock(&self, set: &ProjectionSet, cancel: &CancellationToken) -> Result<bool> {
        self.locks.try_attain_lock(set, cancel).await
    }

    async fn release_lock(&self, set: &ProjectionSet) -> Result<()> {
        self.locks.release_lock(set).await
    }

    async fn release_all_locks(&self) -> Result<()> {
        self.locks.release_all().await
    }

    async fn random_wait(&self, cancel: &CancellationToken) {
        random_wait(self.max_jitter, cancel).await
    }
}
