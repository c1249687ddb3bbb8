//! In-memory collaborators shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tessera::{
    ApplyEventError, DaemonMode, DaemonSettings, DatabaseCatalog, DatabaseRef, DeadLetterEvent,
    DeadLetterSink, Event, EventBatch, EventSource, LockProvider, ProjectionSink, Sequence,
    ShardName, StaticCatalog, TesseraError,
};

#[derive(Debug, thiserror::Error)]
pub enum ArithmeticError {
    #[error("divide by zero")]
    DivideByZero,
    #[error("overflow")]
    Overflow,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid operation")]
pub struct InvalidOperation;

#[derive(Debug, thiserror::Error)]
#[error("malformed event")]
pub struct MalformedEvent;

/// Append-only log shared by every shard of one database
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn append(&self, event_type: &str) -> Sequence {
        let mut events = self.events.lock();
        let sequence = events.len() as Sequence + 1;
        events.push(Event::new(sequence, event_type, sequence.to_be_bytes().to_vec()));
        sequence
    }

    pub fn append_many(&self, event_type: &str, count: usize) -> Sequence {
        let mut last = 0;
        for _ in 0..count {
            last = self.append(event_type);
        }
        last
    }
}

#[async_trait]
impl EventSource for MemoryEventStore {
    async fn high_water_mark(&self) -> anyhow::Result<Sequence> {
        Ok(self.events.lock().len() as Sequence)
    }

    async fn fetch_batch(
        &self,
        _shard: &ShardName,
        floor: Sequence,
        ceiling: Sequence,
    ) -> anyhow::Result<EventBatch> {
        let events = self
            .events
            .lock()
            .iter()
            .filter(|e| e.sequence > floor && e.sequence <= ceiling)
            .cloned()
            .collect();
        Ok(EventBatch::new(floor, ceiling, events))
    }
}

type ErrorFactory = Box<dyn Fn() -> anyhow::Error + Send + Sync>;

struct PlannedFailure {
    remaining: usize,
    make: ErrorFactory,
}

/// Projection sink recording applied sequences per shard, with failure
/// injection. Batches are all-or-nothing.
#[derive(Default)]
pub struct RecordingProjection {
    progress: Mutex<HashMap<String, Sequence>>,
    applied: Mutex<HashMap<String, Vec<Sequence>>>,
    failures: Mutex<HashMap<(String, Sequence), PlannedFailure>>,
    rejected_types: Mutex<Vec<String>>,
    progress_failures: Mutex<usize>,
    apply_delays: Mutex<HashMap<String, Duration>>,
}

impl RecordingProjection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail `times` times when `shard` reaches `sequence`
    pub fn fail_at<F>(&self, shard: &ShardName, sequence: Sequence, times: usize, make: F)
    where
        F: Fn() -> anyhow::Error + Send + Sync + 'static,
    {
        self.failures.lock().insert(
            (shard.identity().to_string(), sequence),
            PlannedFailure {
                remaining: times,
                make: Box::new(make),
            },
        );
    }

    /// Every event of this type fails with an [`ApplyEventError`]
    pub fn reject_type(&self, event_type: &str) {
        self.rejected_types.lock().push(event_type.to_string());
    }

    /// Make the next `times` progress reads fail
    pub fn fail_progress(&self, times: usize) {
        *self.progress_failures.lock() = times;
    }

    pub fn progress_failures_left(&self) -> usize {
        *self.progress_failures.lock()
    }

    /// Every apply for `shard` takes at least `delay`
    pub fn slow_apply(&self, shard: &ShardName, delay: Duration) {
        self.apply_delays
            .lock()
            .insert(shard.identity().to_string(), delay);
    }

    pub fn applied(&self, shard: &ShardName) -> Vec<Sequence> {
        self.applied
            .lock()
            .get(shard.identity())
            .cloned()
            .unwrap_or_default()
    }

    pub fn progress_of(&self, shard: &ShardName) -> Sequence {
        self.progress
            .lock()
            .get(shard.identity())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ProjectionSink for RecordingProjection {
    async fn progress(&self, shard: &ShardName) -> anyhow::Result<Sequence> {
        {
            let mut failures = self.progress_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("progress table unavailable");
            }
        }
        Ok(self.progress_of(shard))
    }

    async fn apply(&self, shard: &ShardName, batch: &EventBatch) -> anyhow::Result<Sequence> {
        let delay = self.apply_delays.lock().get(shard.identity()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut failures = self.failures.lock();
            let rejected = self.rejected_types.lock();
            for event in &batch.events {
                if rejected.contains(&event.event_type) {
                    return Err(ApplyEventError::new(event.clone(), MalformedEvent).into());
                }
                let key = (shard.identity().to_string(), event.sequence);
                if let Some(plan) = failures.get_mut(&key) {
                    if plan.remaining > 0 {
                        plan.remaining -= 1;
                        return Err((plan.make)());
                    }
                }
            }
        }

        self.applied
            .lock()
            .entry(shard.identity().to_string())
            .or_default()
            .extend(batch.events.iter().map(|e| e.sequence));
        self.progress
            .lock()
            .insert(shard.identity().to_string(), batch.ceiling);
        Ok(batch.ceiling)
    }
}

#[derive(Default)]
pub struct MemoryDeadLetters {
    events: Mutex<Vec<DeadLetterEvent>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sequences(&self) -> Vec<Sequence> {
        self.events.lock().iter().map(|e| e.event_sequence).collect()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn record(&self, event: DeadLetterEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// One database with in-memory collaborators
pub struct TestDatabase {
    pub events: Arc<MemoryEventStore>,
    pub projections: Arc<RecordingProjection>,
    pub dead_letters: Arc<MemoryDeadLetters>,
    pub database: DatabaseRef,
}

impl TestDatabase {
    pub fn new(id: &str, locks: Arc<dyn LockProvider>) -> Self {
        let events = MemoryEventStore::new();
        let projections = RecordingProjection::new();
        let dead_letters = MemoryDeadLetters::new();
        let database = DatabaseRef::builder(id)
            .events(events.clone())
            .projections(projections.clone())
            .dead_letters(dead_letters.clone())
            .locks(locks)
            .build()
            .unwrap();
        Self {
            events,
            projections,
            dead_letters,
            database,
        }
    }
}

/// Catalog that is unreachable for its first `failures` lookups
pub struct FlakyCatalog {
    inner: StaticCatalog,
    failures: Mutex<usize>,
    calls: Mutex<usize>,
}

impl FlakyCatalog {
    pub fn new(inner: StaticCatalog, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: Mutex::new(failures),
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl DatabaseCatalog for FlakyCatalog {
    async fn databases(&self) -> tessera::Result<Vec<DatabaseRef>> {
        *self.calls.lock() += 1;
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(TesseraError::Connection("catalog unavailable".into()));
            }
        }
        self.inner.databases().await
    }
}

/// Short intervals so tests run in milliseconds
pub fn fast_settings(mode: DaemonMode) -> DaemonSettings {
    DaemonSettings::new()
        .with_mode(mode)
        .with_leadership_polling_ms(20)
        .with_health_check_polling_ms(20)
        .with_agent_pause_ms(10)
        .with_max_startup_jitter_ms(0)
        .with_idle_polling_ms(10)
        .with_high_water_polling_ms(10)
}

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
