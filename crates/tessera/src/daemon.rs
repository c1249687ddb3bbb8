//! Projection daemon
//!
//! One daemon per database. It owns the registry of shard agents, keyed by
//! [`ShardName::identity`], and is the only thing that changes an agent's
//! [`AgentStatus`]. Start and stop requests are serialized; status reads take
//! a snapshot and never wait on the control loop.
//!
//! Every registry change bumps a `watch` version so the wait helpers wake on
//! state changes instead of polling.

use crate::agent::ShardAgent;
use crate::database::DatabaseRef;
use anyhow::Context;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tessera_core::{
    observe, AgentStatus, DaemonSettings, Result, Sequence, ShardAction, ShardName, ShardState,
    TesseraError,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Which shards a pause or stop applies to
#[derive(Debug, Clone, Copy)]
pub(crate) enum HaltScope<'a> {
    Shard(&'a ShardName),
    Projection(&'a str),
    All,
}

impl HaltScope<'_> {
    fn includes(&self, name: &ShardName) -> bool {
        match self {
            HaltScope::Shard(target) => *target == name,
            HaltScope::Projection(projection) => name.projection_name() == *projection,
            HaltScope::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Halt {
    Pause(Duration),
    Stop,
}

struct AgentEntry {
    state: ShardState,
    /// Bumped on every start; reports from older agents are ignored
    generation: u64,
    cancel: CancellationToken,
    /// Token the agent was started under, reused when a pause expires
    parent: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Detector {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct DaemonShared {
    pub(crate) database: DatabaseRef,
    pub(crate) settings: Arc<DaemonSettings>,
    agents: RwLock<HashMap<String, AgentEntry>>,
    lifecycle: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
    changes: watch::Sender<u64>,
    high_water: watch::Sender<Sequence>,
    waiting: Mutex<BTreeMap<u64, String>>,
    next_wait: AtomicU64,
    detector: Mutex<Option<Detector>>,
}

impl DaemonShared {
    fn publish(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));

        let (mut running, mut paused, mut stopped) = (0, 0, 0);
        for entry in self.agents.read().values() {
            match entry.state.status {
                AgentStatus::Running => running += 1,
                AgentStatus::Paused => paused += 1,
                AgentStatus::Stopped => stopped += 1,
            }
        }
        observe::set_agent_counts(self.database.id(), running, paused, stopped);
    }

    pub(crate) fn observe_high_water_mark(&self, mark: Sequence) {
        let advanced = self.high_water.send_if_modified(|current| {
            if mark > *current {
                *current = mark;
                true
            } else {
                false
            }
        });
        if advanced {
            self.changes.send_modify(|version| *version = version.wrapping_add(1));
        }
    }

    pub(crate) fn subscribe_high_water(&self) -> watch::Receiver<Sequence> {
        self.high_water.subscribe()
    }

    pub(crate) fn record_progress(&self, name: &ShardName, generation: u64, sequence: Sequence) {
        {
            let mut agents = self.agents.write();
            let Some(entry) = agents.get_mut(name.identity()) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            entry.state.last_sequence = sequence;
            entry.state.error_count = 0;
            if entry.state.status == AgentStatus::Running {
                entry.state.last_action = ShardAction::Advanced;
            }
        }
        self.publish();
    }

    pub(crate) fn record_error_count(&self, name: &ShardName, generation: u64, attempts: usize) {
        let mut agents = self.agents.write();
        if let Some(entry) = agents.get_mut(name.identity()) {
            if entry.generation == generation {
                entry.state.error_count = attempts;
            }
        }
    }

    /// Halt requested by a running agent. Dropped if the agent is stale.
    pub(crate) fn halt_from_agent(
        self: &Arc<Self>,
        name: &ShardName,
        generation: u64,
        scope: HaltScope<'_>,
        halt: Halt,
    ) {
        self.halt(scope, halt, Some((name, generation)));
    }

    /// Cancel and mark every matching shard. Never waits on an agent, so it
    /// is safe to call from inside one.
    fn halt(
        self: &Arc<Self>,
        scope: HaltScope<'_>,
        halt: Halt,
        origin: Option<(&ShardName, u64)>,
    ) -> Vec<String> {
        let now = Utc::now();
        let mut affected = Vec::new();
        let mut resumes = Vec::new();
        {
            let mut agents = self.agents.write();
            if let Some((name, generation)) = origin {
                let current = agents
                    .get(name.identity())
                    .map(|entry| entry.generation == generation)
                    .unwrap_or(false);
                if !current {
                    tracing::debug!(shard = %name, "Ignoring halt from a replaced agent");
                    return affected;
                }
            }

            for (identity, entry) in agents.iter_mut() {
                if !scope.includes(&entry.state.name) {
                    continue;
                }
                match halt {
                    Halt::Stop => {
                        if entry.state.status == AgentStatus::Stopped {
                            continue;
                        }
                        entry.cancel.cancel();
                        entry.state.status = AgentStatus::Stopped;
                        entry.state.last_action = ShardAction::Stopped;
                        entry.state.paused_at = None;
                        entry.state.paused_until = None;
                    }
                    Halt::Pause(delay) => {
                        // a stopped shard stays stopped
                        if entry.state.status != AgentStatus::Running {
                            continue;
                        }
                        entry.cancel.cancel();
                        entry.state.status = AgentStatus::Paused;
                        entry.state.last_action = ShardAction::Paused;
                        entry.state.paused_at = Some(now);
                        entry.state.paused_until = Some(
                            now + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::days(365)),
                        );
                        resumes.push((
                            entry.state.name.clone(),
                            entry.generation,
                            delay,
                            entry.parent.clone(),
                        ));
                    }
                }
                affected.push(identity.clone());
            }
        }

        for (name, generation, delay, parent) in resumes {
            self.schedule_resume(name, generation, delay, parent);
        }
        if !affected.is_empty() {
            tracing::info!(
                database = %self.database.id(),
                ?halt,
                shards = ?affected,
                "Halted shards"
            );
            self.publish();
        }
        affected
    }

    fn schedule_resume(
        self: &Arc<Self>,
        name: ShardName,
        generation: u64,
        delay: Duration,
        parent: CancellationToken,
    ) {
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let still_paused = shared
                .agents
                .read()
                .get(name.identity())
                .map(|e| e.generation == generation && e.state.status == AgentStatus::Paused)
                .unwrap_or(false);
            if !still_paused {
                return;
            }

            tracing::info!(shard = %name, "Pause expired, restarting shard");
            let daemon = ProjectionDaemon { shared };
            if let Err(e) = daemon.start_agent(&name, &parent).await {
                tracing::warn!(shard = %name, "Failed to restart paused shard: {}", e);
            }
        });
    }
}

/// Guard removing a wait description when the wait ends or is dropped
struct WaitRegistration<'a> {
    shared: &'a DaemonShared,
    id: u64,
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        self.shared.waiting.lock().remove(&self.id);
    }
}

/// Registry and lifecycle of the shard agents for one database
#[derive(Clone)]
pub struct ProjectionDaemon {
    shared: Arc<DaemonShared>,
}

impl ProjectionDaemon {
    pub fn new(database: DatabaseRef, settings: Arc<DaemonSettings>) -> Self {
        let (changes, _) = watch::channel(0u64);
        let (high_water, _) = watch::channel::<Sequence>(0);
        Self {
            shared: Arc::new(DaemonShared {
                database,
                settings,
                agents: RwLock::new(HashMap::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                next_generation: AtomicU64::new(0),
                changes,
                high_water,
                waiting: Mutex::new(BTreeMap::new()),
                next_wait: AtomicU64::new(0),
                detector: Mutex::new(None),
            }),
        }
    }

    pub fn database(&self) -> &DatabaseRef {
        &self.shared.database
    }

    pub fn database_id(&self) -> &str {
        self.shared.database.id()
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.shared.settings
    }

    /// Start the agent for `name` from its last durable position.
    ///
    /// A running agent is left alone. A paused or stopped one is restarted
    /// with a clean failure count.
    pub async fn start_agent(&self, name: &ShardName, cancel: &CancellationToken) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let previous = {
            let mut agents = self.shared.agents.write();
            match agents.get_mut(name.identity()) {
                Some(entry)
                    if entry.state.status == AgentStatus::Running
                        && !entry.cancel.is_cancelled() =>
                {
                    return Ok(());
                }
                Some(entry) => {
                    entry.cancel.cancel();
                    entry.handle.take()
                }
                None => None,
            }
        };
        if let Some(handle) = previous {
            let _ = handle.await;
        }

        if cancel.is_cancelled() {
            return Err(TesseraError::InvalidState(format!(
                "cannot start {}: shutdown in progress",
                name
            )));
        }

        let position = self
            .shared
            .database
            .projections()
            .progress(name)
            .await
            .with_context(|| format!("reading progress for {}", name))?;

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let agent_cancel = cancel.child_token();
        self.shared.agents.write().insert(
            name.identity().to_string(),
            AgentEntry {
                state: ShardState::started(name.clone(), position),
                generation,
                cancel: agent_cancel.clone(),
                parent: cancel.clone(),
                handle: None,
            },
        );

        let agent = ShardAgent::new(
            name.clone(),
            generation,
            position,
            self.shared.clone(),
            agent_cancel,
        );
        let handle = tokio::spawn(supervise(
            agent,
            Arc::downgrade(&self.shared),
            name.clone(),
            generation,
        ));
        {
            let mut agents = self.shared.agents.write();
            match agents.get_mut(name.identity()) {
                Some(entry) if entry.generation == generation => entry.handle = Some(handle),
                _ => handle.abort(),
            }
        }

        self.shared.publish();
        self.ensure_high_water_detection();
        tracing::info!(
            database = %self.database_id(),
            shard = %name,
            from = position,
            "Started shard agent"
        );
        Ok(())
    }

    /// Graceful stop. The agent finishes its current batch first.
    pub async fn stop_agent(&self, name: &ShardName) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let handle = {
            let mut agents = self.shared.agents.write();
            let entry = agents
                .get_mut(name.identity())
                .ok_or_else(|| TesseraError::NotFound(format!("shard {}", name)))?;
            entry.cancel.cancel();
            entry.state.status = AgentStatus::Stopped;
            entry.state.last_action = ShardAction::Stopped;
            entry.state.paused_at = None;
            entry.state.paused_until = None;
            entry.handle.take()
        };
        self.shared.publish();

        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!(database = %self.database_id(), shard = %name, "Stopped shard agent");
        Ok(())
    }

    /// Forget a paused shard so the next start begins clean. Waits for the
    /// agent to finish its in-flight batch.
    ///
    /// Returns false if the shard is unknown or not paused.
    pub async fn eject_paused_shard(&self, name: &ShardName) -> bool {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let removed = {
            let mut agents = self.shared.agents.write();
            let paused = agents
                .get(name.identity())
                .map(|entry| entry.state.status == AgentStatus::Paused)
                .unwrap_or(false);
            if paused {
                agents.remove(name.identity())
            } else {
                None
            }
        };
        let Some(entry) = removed else {
            return false;
        };

        entry.cancel.cancel();
        self.shared.publish();
        if let Some(handle) = entry.handle {
            let _ = handle.await;
        }
        tracing::warn!(shard = %name, "Ejected paused shard");
        true
    }

    pub async fn pause_shard(&self, name: &ShardName, delay: Duration) -> Result<()> {
        if self.status_for(name).is_none() {
            return Err(TesseraError::NotFound(format!("shard {}", name)));
        }
        self.halt_and_drain(HaltScope::Shard(name), Halt::Pause(delay))
            .await;
        Ok(())
    }

    /// Pause every shard of `projection`. Returns how many were paused.
    pub async fn pause_projection(&self, projection: &str, delay: Duration) -> usize {
        self.halt_and_drain(HaltScope::Projection(projection), Halt::Pause(delay))
            .await
    }

    pub async fn pause_all(&self, delay: Duration) -> usize {
        self.halt_and_drain(HaltScope::All, Halt::Pause(delay)).await
    }

    pub async fn stop_projection(&self, projection: &str) -> usize {
        self.halt_and_drain(HaltScope::Projection(projection), Halt::Stop)
            .await
    }

    pub async fn stop_all(&self) -> usize {
        self.halt_and_drain(HaltScope::All, Halt::Stop).await
    }

    /// Stop every agent, wait for all of them and the high-water detector.
    pub async fn shutdown(&self) {
        {
            let _lifecycle = self.shared.lifecycle.lock().await;
            self.shared.halt(HaltScope::All, Halt::Stop, None);
            let handles: Vec<JoinHandle<()>> = self
                .shared
                .agents
                .write()
                .values_mut()
                .filter_map(|entry| entry.handle.take())
                .collect();
            for handle in handles {
                let _ = handle.await;
            }
        }

        let detector = self.shared.detector.lock().take();
        if let Some(detector) = detector {
            detector.cancel.cancel();
            let _ = detector.handle.await;
        }
        tracing::debug!(database = %self.database_id(), "Projection daemon shut down");
    }

    async fn halt_and_drain(&self, scope: HaltScope<'_>, halt: Halt) -> usize {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let affected = self.shared.halt(scope, halt, None);
        let handles: Vec<JoinHandle<()>> = {
            let mut agents = self.shared.agents.write();
            affected
                .iter()
                .filter_map(|identity| agents.get_mut(identity).and_then(|e| e.handle.take()))
                .collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        affected.len()
    }

    pub fn status_for(&self, name: &ShardName) -> Option<AgentStatus> {
        self.shared
            .agents
            .read()
            .get(name.identity())
            .map(|entry| entry.state.status)
    }

    pub fn state_for(&self, name: &ShardName) -> Option<ShardState> {
        self.shared
            .agents
            .read()
            .get(name.identity())
            .map(|entry| entry.state.clone())
    }

    /// Snapshot of every known shard, ordered by identity
    pub fn current_agents(&self) -> Vec<ShardState> {
        let mut states: Vec<ShardState> = self
            .shared
            .agents
            .read()
            .values()
            .map(|entry| entry.state.clone())
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    pub fn shards_with_status(&self, status: AgentStatus) -> Vec<ShardName> {
        self.current_agents()
            .into_iter()
            .filter(|state| state.status == status)
            .map(|state| state.name)
            .collect()
    }

    pub fn any_paused(&self) -> bool {
        self.shared
            .agents
            .read()
            .values()
            .any(|entry| entry.state.status == AgentStatus::Paused)
    }

    /// Highest sequence seen by the detector or any agent
    pub fn high_water_mark(&self) -> Sequence {
        *self.shared.high_water.borrow()
    }

    /// Descriptions of the wait conditions currently pending
    pub fn waiting_on(&self) -> Vec<String> {
        self.shared.waiting.lock().values().cloned().collect()
    }

    pub async fn wait_for_shard_state(
        &self,
        name: &ShardName,
        sequence: Sequence,
        timeout: Duration,
    ) -> Result<ShardState> {
        let description = format!("shard {} to reach sequence {}", name, sequence);
        self.wait_until(description, timeout, |shared| {
            shared
                .agents
                .read()
                .get(name.identity())
                .filter(|entry| entry.state.last_sequence >= sequence)
                .map(|entry| entry.state.clone())
        })
        .await
    }

    pub async fn wait_for_high_water_mark(&self, sequence: Sequence, timeout: Duration) -> Result<Sequence> {
        self.ensure_high_water_detection();
        let description = format!("high-water mark to reach {}", sequence);
        self.wait_until(description, timeout, |shared| {
            let mark = *shared.high_water.borrow();
            (mark >= sequence).then_some(mark)
        })
        .await
    }

    /// Resolve with the first shard state satisfying `predicate`
    pub async fn wait_for_shard_condition<F>(
        &self,
        predicate: F,
        description: impl Into<String>,
        timeout: Duration,
    ) -> Result<ShardState>
    where
        F: Fn(&ShardState) -> bool + Send + Sync,
    {
        self.wait_until(description.into(), timeout, |shared| {
            shared
                .agents
                .read()
                .values()
                .find(|entry| predicate(&entry.state))
                .map(|entry| entry.state.clone())
        })
        .await
    }

    /// Wait until every running shard has caught up with the high-water mark
    pub async fn wait_for_non_stale_data(&self, timeout: Duration) -> Result<()> {
        self.ensure_high_water_detection();
        self.wait_until("all running shards to reach the high-water mark".to_string(), timeout, |shared| {
            let mark = *shared.high_water.borrow();
            shared
                .agents
                .read()
                .values()
                .filter(|entry| entry.state.status == AgentStatus::Running)
                .all(|entry| entry.state.last_sequence >= mark)
                .then_some(())
        })
        .await
    }

    async fn wait_until<T, F>(&self, description: String, timeout: Duration, check: F) -> Result<T>
    where
        F: Fn(&DaemonShared) -> Option<T> + Send,
        T: Send,
    {
        let id = self.shared.next_wait.fetch_add(1, Ordering::Relaxed);
        self.shared.waiting.lock().insert(id, description.clone());
        let _registration = WaitRegistration {
            shared: &*self.shared,
            id,
        };

        // subscribe before the first check so no change is missed
        let mut changes = self.shared.changes.subscribe();
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                if let Some(found) = check(&*self.shared) {
                    return found;
                }
                if changes.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;

        outcome.map_err(|_| TesseraError::Timeout {
            description,
            timeout,
        })
    }

    fn ensure_high_water_detection(&self) {
        let mut detector = self.shared.detector.lock();
        if let Some(existing) = detector.as_ref() {
            if !existing.handle.is_finished() {
                return;
            }
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(detect_high_water(
            Arc::downgrade(&self.shared),
            cancel.clone(),
            self.shared.settings.high_water_polling_time(),
        ));
        *detector = Some(Detector { cancel, handle });
    }
}

/// Run an agent and stop its shard if the agent panics
async fn supervise(agent: ShardAgent, shared: Weak<DaemonShared>, name: ShardName, generation: u64) {
    let outcome = tokio::spawn(agent.run()).await;
    if let Err(e) = outcome {
        if e.is_panic() {
            tracing::error!(shard = %name, "Shard agent panicked");
            if let Some(shared) = shared.upgrade() {
                shared.halt(HaltScope::Shard(&name), Halt::Stop, Some((&name, generation)));
            }
        }
    }
}

async fn detect_high_water(shared: Weak<DaemonShared>, cancel: CancellationToken, interval: Duration) {
    loop {
        {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let events = shared.database.events().clone();
            match events.high_water_mark().await {
                Ok(mark) => shared.observe_high_water_mark(mark),
                Err(e) => tracing::debug!(
                    database = %shared.database.id(),
                    "High-water detection failed: {:#}",
                    e
                ),
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
