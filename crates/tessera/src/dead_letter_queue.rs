//! Dead Letter Queue
//!
//! SQLite-backed store for events skipped by a `SkipEvent` continuation.
//! Records are append-only from the daemon's side; operators can list and
//! clear them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use tessera_core::{DeadLetterEvent, DeadLetterSink, Result, TesseraError};

/// A stored dead letter with its row id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub id: i64,
    pub event: DeadLetterEvent,
}

pub struct SqliteDeadLetterQueue {
    conn: Mutex<Connection>,
}

fn dlq_err(e: rusqlite::Error) -> TesseraError {
    TesseraError::DeadLetter(e.to_string())
}

const SELECT_COLUMNS: &str = "SELECT id, projection_name, shard_key, event_sequence, event_type,
        error_summary, recorded_at
 FROM dead_letter_events";

fn read_record(row: &Row<'_>) -> rusqlite::Result<DeadLetterRecord> {
    let sequence: i64 = row.get(3)?;
    let recorded_at: String = row.get(6)?;
    let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(DeadLetterRecord {
        id: row.get(0)?,
        event: DeadLetterEvent {
            projection_name: row.get(1)?,
            shard_key: row.get(2)?,
            event_sequence: sequence as u64,
            event_type: row.get(4)?,
            error_summary: row.get(5)?,
            recorded_at,
        },
    })
}

impl SqliteDeadLetterQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(dlq_err)?;
        Self::new(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(dlq_err)?;
        Self::new(conn)
    }

    pub fn new(conn: Connection) -> Result<Self> {
        let dlq = Self {
            conn: Mutex::new(conn),
        };
        dlq.init()?;
        Ok(dlq)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS dead_letter_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                projection_name TEXT NOT NULL,
                shard_key TEXT NOT NULL,
                event_sequence INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                error_summary TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(dlq_err)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_dead_letter_shard
             ON dead_letter_events(projection_name, shard_key, event_sequence)",
            [],
        )
        .map_err(dlq_err)?;

        Ok(())
    }

    pub fn add(&self, event: &DeadLetterEvent) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO dead_letter_events
                (projection_name, shard_key, event_sequence, event_type, error_summary, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.projection_name,
                event.shard_key,
                event.event_sequence as i64,
                event.event_type,
                event.error_summary,
                event.recorded_at.to_rfc3339(),
            ],
        )
        .map_err(dlq_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent records first
    pub fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("{} ORDER BY id DESC LIMIT ?1", SELECT_COLUMNS))
            .map_err(dlq_err)?;
        let records = stmt
            .query_map([limit as i64], read_record)
            .map_err(dlq_err)?;
        records
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(dlq_err)
    }

    /// Records for one shard in sequence order
    pub fn for_shard(&self, projection_name: &str, shard_key: &str) -> Result<Vec<DeadLetterRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE projection_name = ?1 AND shard_key = ?2 ORDER BY event_sequence ASC, id ASC",
                SELECT_COLUMNS
            ))
            .map_err(dlq_err)?;
        let records = stmt
            .query_map(params![projection_name, shard_key], read_record)
            .map_err(dlq_err)?;
        records
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(dlq_err)
    }

    pub fn remove(&self, id: i64) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM dead_letter_events WHERE id = ?1", [id])
            .map_err(dlq_err)?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM dead_letter_events", [], |row| row.get(0))
            .map_err(dlq_err)?;
        Ok(count as usize)
    }

    pub fn clear(&self) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM dead_letter_events", [])
            .map_err(dlq_err)?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for SqliteDeadLetterQueue {
    async fn record(&self, event: DeadLetterEvent) -> anyhow::Result<()> {
        self.add(&event)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_letter(projection: &str, key: &str, sequence: u64) -> DeadLetterEvent {
        DeadLetterEvent {
            projection_name: projection.to_string(),
            shard_key: key.to_string(),
            event_sequence: sequence,
            event_type: "ImageUploaded".to_string(),
            error_summary: "bad image".to_string(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_add_and_list() {
        let dlq = SqliteDeadLetterQueue::in_memory().unwrap();
        dlq.add(&dead_letter("Images", "All", 3)).unwrap();
        dlq.add(&dead_letter("Images", "All", 7)).unwrap();

        assert_eq!(dlq.count().unwrap(), 2);
        let listed = dlq.list(10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].event.event_sequence, 7);
        assert_eq!(listed[1].event.event_sequence, 3);
        assert_eq!(listed[0].event.error_summary, "bad image");
    }

    #[test]
    fn test_for_shard_filters_and_orders() {
        let dlq = SqliteDeadLetterQueue::in_memory().unwrap();
        dlq.add(&dead_letter("Images", "All", 9)).unwrap();
        dlq.add(&dead_letter("Trips", "All", 4)).unwrap();
        dlq.add(&dead_letter("Images", "All", 2)).unwrap();

        let sequences: Vec<u64> = dlq
            .for_shard("Images", "All")
            .unwrap()
            .into_iter()
            .map(|r| r.event.event_sequence)
            .collect();
        assert_eq!(sequences, vec![2, 9]);
    }

    #[test]
    fn test_remove_and_clear() {
        let dlq = SqliteDeadLetterQueue::in_memory().unwrap();
        let id = dlq.add(&dead_letter("Images", "All", 1)).unwrap();
        dlq.add(&dead_letter("Images", "All", 2)).unwrap();

        dlq.remove(id).unwrap();
        assert_eq!(dlq.count().unwrap(), 1);

        dlq.clear().unwrap();
        assert_eq!(dlq.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq.db");
        {
            let dlq = SqliteDeadLetterQueue::open(&path).unwrap();
            dlq.record(dead_letter("Images", "All", 5)).await.unwrap();
        }

        let dlq = SqliteDeadLetterQueue::open(&path).unwrap();
        let records = dlq.for_shard("Images", "All").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.event_sequence, 5);
    }
}
