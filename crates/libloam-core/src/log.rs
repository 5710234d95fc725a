//! Event Log Store
//!
//! Append-only `mutation_log` table in its own database. The text form of
//! `EventId` sorts like the id itself, so `ORDER BY id` is log order.

use serde::Serialize;
use serde_json::{json, Value};

use crate::db::{Row, SqliteDb};
use crate::error::LoamError;
use crate::types::event::{LogEntry, MutationEvent, SyncStatus};
use crate::types::ids::EventId;

pub const LOG_TABLE: &str = "mutation_log";

/// Entry counts by sync status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub total: u64,
    pub local_only: u64,
    pub pending: u64,
    pub synced: u64,
    pub cursor: Option<EventId>,
}

#[derive(Debug)]
pub struct EventLog {
    db: SqliteDb,
}

impl EventLog {
    /// Wrap a database, creating the log table if needed
    pub fn open(mut db: SqliteDb) -> Result<Self, LoamError> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS mutation_log (
                id TEXT PRIMARY KEY NOT NULL,
                mutation TEXT NOT NULL,
                args_json TEXT NOT NULL,
                schema_hash INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                sync_status TEXT NOT NULL,
                persisted INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS mutation_log_sync_status ON mutation_log (sync_status, id);",
        )?;
        Ok(Self { db })
    }

    pub fn db(&self) -> &SqliteDb {
        &self.db
    }

    pub fn append(&mut self, entry: &LogEntry) -> Result<(), LoamError> {
        let event = &entry.event;
        self.db.execute(
            "INSERT INTO mutation_log (id, mutation, args_json, schema_hash, created_at, sync_status, persisted)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            &json!([
                event.id.to_string(),
                event.mutation,
                event.args.to_string(),
                event.schema_hash,
                entry.created_at,
                entry.sync_status.as_str(),
                entry.persisted,
            ]),
        )?;
        Ok(())
    }

    /// Transition a `Pending` entry to `Synced`.
    ///
    /// Returns false if the entry is missing, local-only, or already synced.
    pub fn mark_synced(&mut self, id: &EventId) -> Result<bool, LoamError> {
        let changed = self.db.execute(
            "UPDATE mutation_log SET sync_status = 'synced' WHERE id = ? AND sync_status = 'pending'",
            &json!([id.to_string()]),
        )?;
        Ok(changed > 0)
    }

    /// Id of the most recent synced entry
    pub fn cursor(&self) -> Result<Option<EventId>, LoamError> {
        let value = self.db.select_value(
            "SELECT id FROM mutation_log WHERE sync_status = 'synced' ORDER BY id DESC LIMIT 1",
            &Value::Null,
        )?;
        match value {
            Some(Value::String(id)) => Ok(Some(id.parse()?)),
            _ => Ok(None),
        }
    }

    /// Highest id in the log, whatever its status
    pub fn max_id(&self) -> Result<Option<EventId>, LoamError> {
        let value = self.db.select_value(
            "SELECT id FROM mutation_log ORDER BY id DESC LIMIT 1",
            &Value::Null,
        )?;
        match value {
            Some(Value::String(id)) => Ok(Some(id.parse()?)),
            _ => Ok(None),
        }
    }

    /// Oldest pending entries, in log order
    pub fn pending(&self, limit: usize) -> Result<Vec<LogEntry>, LoamError> {
        self.query(
            "SELECT * FROM mutation_log WHERE sync_status = 'pending' ORDER BY id LIMIT ?",
            json!([limit as i64]),
        )
    }

    /// Every entry, in log order
    pub fn entries(&self) -> Result<Vec<LogEntry>, LoamError> {
        self.query("SELECT * FROM mutation_log ORDER BY id", Value::Null)
    }

    /// Up to `limit` entries strictly after `after`, in log order
    pub fn entries_after(&self, after: Option<&EventId>, limit: usize) -> Result<Vec<LogEntry>, LoamError> {
        match after {
            Some(id) => self.query(
                "SELECT * FROM mutation_log WHERE id > ? ORDER BY id LIMIT ?",
                json!([id.to_string(), limit as i64]),
            ),
            None => self.query(
                "SELECT * FROM mutation_log ORDER BY id LIMIT ?",
                json!([limit as i64]),
            ),
        }
    }

    pub fn get(&self, id: &EventId) -> Result<Option<LogEntry>, LoamError> {
        Ok(self
            .query(
                "SELECT * FROM mutation_log WHERE id = ?",
                json!([id.to_string()]),
            )?
            .into_iter()
            .next())
    }

    pub fn contains(&self, id: &EventId) -> Result<bool, LoamError> {
        let value = self.db.select_value(
            "SELECT 1 FROM mutation_log WHERE id = ?",
            &json!([id.to_string()]),
        )?;
        Ok(value.is_some())
    }

    pub fn count(&self) -> Result<u64, LoamError> {
        let value = self
            .db
            .select_value("SELECT count(*) FROM mutation_log", &Value::Null)?;
        Ok(value.and_then(|v| v.as_u64()).unwrap_or(0))
    }

    pub fn stats(&self) -> Result<LogStats, LoamError> {
        let rows = self.db.select(
            "SELECT sync_status, count(*) AS n FROM mutation_log GROUP BY sync_status",
            &Value::Null,
        )?;
        let mut stats = LogStats::default();
        for row in rows {
            let n = row.get("n").and_then(Value::as_u64).unwrap_or(0);
            let status: SyncStatus = row
                .get("sync_status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .parse()?;
            match status {
                SyncStatus::LocalOnly => stats.local_only = n,
                SyncStatus::Pending => stats.pending = n,
                SyncStatus::Synced => stats.synced = n,
            }
            stats.total += n;
        }
        stats.cursor = self.cursor()?;
        Ok(stats)
    }

    pub fn begin(&mut self) -> Result<(), LoamError> {
        self.db.begin()
    }

    pub fn commit(&mut self) -> Result<(), LoamError> {
        self.db.commit()
    }

    pub fn rollback(&mut self) -> Result<(), LoamError> {
        self.db.rollback()
    }

    pub fn export_bytes(&self) -> Result<Vec<u8>, LoamError> {
        self.db.export_bytes()
    }

    pub fn import_bytes(&mut self, bytes: &[u8]) -> Result<(), LoamError> {
        self.db.import_bytes(bytes)
    }

    pub fn close(&mut self) -> Result<(), LoamError> {
        self.db.close()
    }

    pub fn is_closed(&self) -> bool {
        self.db.is_closed()
    }

    fn query(&self, sql: &str, bind: Value) -> Result<Vec<LogEntry>, LoamError> {
        self.db
            .select(sql, &bind)?
            .into_iter()
            .map(row_to_entry)
            .collect()
    }
}

fn text(row: &Row, column: &str) -> Result<String, LoamError> {
    row.get(column)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| LoamError::Internal(format!("mutation_log.{} is not text", column)))
}

fn row_to_entry(row: Row) -> Result<LogEntry, LoamError> {
    let id: EventId = text(&row, "id")?.parse()?;
    let args: Value = serde_json::from_str(&text(&row, "args_json")?)?;
    let schema_hash = row
        .get("schema_hash")
        .and_then(Value::as_i64)
        .ok_or_else(|| LoamError::Internal("mutation_log.schema_hash is not an integer".to_string()))?;
    Ok(LogEntry {
        event: MutationEvent::new(id, text(&row, "mutation")?, args, schema_hash),
        sync_status: text(&row, "sync_status")?.parse()?,
        created_at: text(&row, "created_at")?,
        persisted: row.get("persisted").and_then(Value::as_i64).unwrap_or(1) != 0,
    })
}
