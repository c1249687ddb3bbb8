//! Databases the daemon runs projections against
//!
//! A [`DatabaseRef`] bundles the collaborators for one physical database:
//! where events come from, where projections are written, where skipped
//! events go and which lock primitive guards ownership.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tessera_core::{
    DeadLetterSink, EventSource, LockProvider, ProjectionSink, Result, TesseraError,
};

#[derive(Clone)]
pub struct DatabaseRef {
    id: String,
    events: Arc<dyn EventSource>,
    projections: Arc<dyn ProjectionSink>,
    dead_letters: Arc<dyn DeadLetterSink>,
    locks: Arc<dyn LockProvider>,
}

impl DatabaseRef {
    pub fn builder(id: impl Into<String>) -> DatabaseRefBuilder {
        DatabaseRefBuilder {
            id: id.into(),
            events: None,
            projections: None,
            dead_letters: None,
            locks: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn events(&self) -> &Arc<dyn EventSource> {
        &self.events
    }

    pub fn projections(&self) -> &Arc<dyn ProjectionSink> {
        &self.projections
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterSink> {
        &self.dead_letters
    }

    pub fn locks(&self) -> &Arc<dyn LockProvider> {
        &self.locks
    }
}

impl fmt::Debug for DatabaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseRef")
            .field("id", &self.id)
            .field("locks", &self.locks.describe())
            .finish()
    }
}

pub struct DatabaseRefBuilder {
    id: String,
    events: Option<Arc<dyn EventSource>>,
    projections: Option<Arc<dyn ProjectionSink>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    locks: Option<Arc<dyn LockProvider>>,
}

impl DatabaseRefBuilder {
    pub fn events(mut self, events: Arc<dyn EventSource>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn projections(mut self, projections: Arc<dyn ProjectionSink>) -> Self {
        self.projections = Some(projections);
        self
    }

    pub fn dead_letters(mut self, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn build(self) -> Result<DatabaseRef> {
        let missing = |what: &str| {
            TesseraError::Config(format!("database '{}' has no {} configured", self.id, what))
        };
        let events = self.events.clone().ok_or_else(|| missing("event source"))?;
        let projections = self
            .projections
            .clone()
            .ok_or_else(|| missing("projection sink"))?;
        let dead_letters = self
            .dead_letters
            .clone()
            .ok_or_else(|| missing("dead letter sink"))?;
        let locks = self.locks.clone().ok_or_else(|| missing("lock provider"))?;

        Ok(DatabaseRef {
            id: self.id,
            events,
            projections,
            dead_letters,
            locks,
        })
    }
}

/// Every database known to the store. Multi-tenant stores may add tenants
/// over time, so the list is re-read on every distribution.
#[async_trait]
pub trait DatabaseCatalog: Send + Sync {
    async fn databases(&self) -> Result<Vec<DatabaseRef>>;
}

/// Fixed list of databases
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    databases: Vec<DatabaseRef>,
}

impl StaticCatalog {
    pub fn new(databases: Vec<DatabaseRef>) -> Self {
        Self { databases }
    }

    pub fn single(database: DatabaseRef) -> Self {
        Self::new(vec![database])
    }
}

#[async_trait]
impl DatabaseCatalog for StaticCatalog {
    async fn databases(&self) -> Result<Vec<DatabaseRef>> {
        Ok(self.databases.clone())
    }
}
