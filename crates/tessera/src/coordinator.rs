//! Projection coordinator: the per-process control loop
//!
//! On every cycle the coordinator rebuilds the distribution, makes sure the
//! sets it owns are running, hands off sets with stopped shards and tries to
//! acquire the ones it does not own yet. A failing cycle is logged and the
//! loop carries on; only `pause` or `stop` end it.

use crate::daemon::ProjectionDaemon;
use crate::database::DatabaseCatalog;
use crate::distributor::{distributor_for, ProjectionDistributor, ProjectionSet};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tessera_core::{AgentStatus, DaemonSettings, Result, ShardName, ShardState};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorStatus {
    Stopped,
    Starting,
    Running,
    Paused,
}

impl fmt::Display for CoordinatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordinatorStatus::Stopped => "stopped",
            CoordinatorStatus::Starting => "starting",
            CoordinatorStatus::Running => "running",
            CoordinatorStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

struct ControlLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct CoordinatorInner {
    settings: Arc<DaemonSettings>,
    distributor: Arc<dyn ProjectionDistributor>,
    daemons: RwLock<HashMap<String, ProjectionDaemon>>,
    status: RwLock<CoordinatorStatus>,
}

pub struct ProjectionCoordinator {
    inner: Arc<CoordinatorInner>,
    control: Mutex<Option<ControlLoop>>,
}

impl ProjectionCoordinator {
    pub fn new(settings: DaemonSettings, distributor: Arc<dyn ProjectionDistributor>) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                settings: Arc::new(settings),
                distributor,
                daemons: RwLock::new(HashMap::new()),
                status: RwLock::new(CoordinatorStatus::Stopped),
            }),
            control: Mutex::new(None),
        })
    }

    /// Coordinator with the distributor matching `settings.mode`
    pub fn for_catalog(
        settings: DaemonSettings,
        catalog: Arc<dyn DatabaseCatalog>,
        shards: Vec<ShardName>,
        multi_tenant: bool,
    ) -> Result<Self> {
        let distributor = distributor_for(&settings, catalog, shards, multi_tenant);
        Self::new(settings, distributor)
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.inner.settings
    }

    pub fn status(&self) -> CoordinatorStatus {
        *self.inner.status.read()
    }

    /// Spawn the control loop. A no-op while it is already running.
    pub async fn start(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        if control.is_some() {
            return Ok(());
        }

        *self.inner.status.write() = CoordinatorStatus::Starting;
        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { inner.run(token).await });
        *control = Some(ControlLoop { cancel, task });

        tracing::info!(mode = ?self.inner.settings.mode, "Projection coordinator started");
        Ok(())
    }

    /// Stop the loop and every agent, release all locks; `resume` restarts.
    pub async fn pause(&self) -> Result<()> {
        self.shutdown(CoordinatorStatus::Paused).await
    }

    pub async fn resume(&self) -> Result<()> {
        if self.status() == CoordinatorStatus::Paused {
            self.start().await
        } else {
            Ok(())
        }
    }

    pub async fn stop(&self) -> Result<()> {
        self.shutdown(CoordinatorStatus::Stopped).await
    }

    /// Daemon for one database, once the coordinator has touched it
    pub fn daemon_for(&self, database_id: &str) -> Option<ProjectionDaemon> {
        self.inner.daemons.read().get(database_id).cloned()
    }

    pub fn daemons(&self) -> Vec<ProjectionDaemon> {
        let mut daemons: Vec<ProjectionDaemon> =
            self.inner.daemons.read().values().cloned().collect();
        daemons.sort_by(|a, b| a.database_id().cmp(b.database_id()));
        daemons
    }

    async fn shutdown(&self, final_status: CoordinatorStatus) -> Result<()> {
        // held until the daemons are drained so a concurrent start waits
        let mut guard = self.control.lock().await;
        let Some(control) = guard.take() else {
            // already down; pausing a stopped coordinator keeps it stopped
            if final_status == CoordinatorStatus::Stopped {
                *self.inner.status.write() = CoordinatorStatus::Stopped;
            }
            return Ok(());
        };

        control.cancel.cancel();
        if let Err(e) = control.task.await {
            tracing::error!("Projection coordinator loop ended abnormally: {}", e);
        }

        let daemons: Vec<ProjectionDaemon> = self.inner.daemons.read().values().cloned().collect();
        for daemon in daemons {
            daemon.shutdown().await;
        }

        let released = self.inner.distributor.release_all_locks().await;
        *self.inner.status.write() = final_status;
        drop(guard);
        tracing::info!(status = %final_status, "Projection coordinator shut down");
        released
    }
}

impl CoordinatorInner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.distributor.random_wait(&cancel).await;
        if cancel.is_cancelled() {
            return;
        }
        *self.status.write() = CoordinatorStatus::Running;

        while !cancel.is_cancelled() {
            let delay = match self.execute_cycle(&cancel).await {
                Ok(true) => self.settings.agent_pause_time(),
                Ok(false) => self.settings.leadership_polling_time(),
                Err(e) => {
                    tracing::error!("Projection coordinator cycle failed: {}", e);
                    self.settings.leadership_polling_time()
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!("Projection coordinator loop exited");
    }

    /// One pass over the distribution. Returns true if any shard is paused.
    async fn execute_cycle(&self, cancel: &CancellationToken) -> Result<bool> {
        let sets = self.distributor.build_distribution().await?;
        for set in &sets {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.process_set(set, cancel).await {
                tracing::error!(
                    database = %set.database_id(),
                    "Failed to process projection set: {}",
                    e
                );
            }
        }

        let any_paused = self
            .daemons
            .read()
            .values()
            .any(|daemon| daemon.any_paused());
        Ok(any_paused)
    }

    async fn process_set(&self, set: &ProjectionSet, cancel: &CancellationToken) -> Result<()> {
        let daemon = self.daemon_for_set(set);

        if self.distributor.has_lock(set).await {
            let stopped: Vec<&ShardName> = set
                .names
                .iter()
                .filter(|name| daemon.status_for(name) == Some(AgentStatus::Stopped))
                .collect();
            if !stopped.is_empty() && self.distributor.can_hand_off() {
                tracing::warn!(
                    database = %set.database_id(),
                    stopped = ?stopped.iter().map(|n| n.identity()).collect::<Vec<_>>(),
                    "Stopped shards found, handing off projection set"
                );
                for name in &set.names {
                    if daemon.status_for(name) != Some(AgentStatus::Stopped) {
                        daemon.stop_agent(name).await?;
                    }
                }
                return self.distributor.release_lock(set).await;
            }

            let now = Utc::now();
            for name in &set.names {
                match daemon.state_for(name) {
                    None => self.start_shard(&daemon, name, cancel).await,
                    Some(state) if self.ready_to_resume(&state, now) => {
                        if let Err(e) = daemon.start_agent(name, cancel).await {
                            tracing::warn!(shard = %name, "Failed to resume paused shard: {}", e);
                            daemon.eject_paused_shard(name).await;
                        }
                    }
                    Some(_) => {}
                }
            }
            return Ok(());
        }

        // lock lost while agents were still running: fence them off first
        let orphaned: Vec<&ShardName> = set
            .names
            .iter()
            .filter(|name| {
                matches!(
                    daemon.status_for(name),
                    Some(AgentStatus::Running) | Some(AgentStatus::Paused)
                )
            })
            .collect();
        if !orphaned.is_empty() {
            tracing::warn!(
                database = %set.database_id(),
                count = orphaned.len(),
                "Advisory lock lost, stopping shards"
            );
            for name in orphaned {
                daemon.stop_agent(name).await?;
            }
        }

        if self.distributor.try_attain_lock(set, cancel).await? {
            tracing::info!(
                database = %set.database_id(),
                shards = set.names.len(),
                "Attained projection set, starting shards"
            );
            for name in &set.names {
                self.start_shard(&daemon, name, cancel).await;
            }
        }
        Ok(())
    }

    async fn start_shard(&self, daemon: &ProjectionDaemon, name: &ShardName, cancel: &CancellationToken) {
        if let Err(e) = daemon.start_agent(name, cancel).await {
            tracing::error!(
                database = %daemon.database_id(),
                shard = %name,
                "Failed to start shard: {}",
                e
            );
        }
    }

    /// Paused for at least the health-check interval, whatever its own delay
    fn ready_to_resume(&self, state: &ShardState, now: DateTime<Utc>) -> bool {
        if state.status != AgentStatus::Paused {
            return false;
        }
        let Some(paused_at) = state.paused_at else {
            return true;
        };
        let health_check = chrono::Duration::from_std(self.settings.health_check_polling_time())
            .unwrap_or_else(|_| chrono::Duration::zero());
        now - paused_at >= health_check
    }

    fn daemon_for_set(&self, set: &ProjectionSet) -> ProjectionDaemon {
        if let Some(daemon) = self.daemons.read().get(set.database_id()) {
            return daemon.clone();
        }
        self.daemons
            .write()
            .entry(set.database_id().to_string())
            .or_insert_with(|| ProjectionDaemon::new(set.database.clone(), self.settings.clone()))
            .clone()
    }
}
