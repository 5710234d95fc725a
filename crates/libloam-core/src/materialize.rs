//! Materialized Store
//!
//! Application tables plus a small meta table recording the schema hash the
//! tables were built for and how many log entries have been applied to them.
//! The store can always be rebuilt from the Event Log Store.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::db::SqliteDb;
use crate::error::LoamError;
use crate::log::EventLog;
use crate::schema::Schema;
use crate::types::event::MutationEvent;

pub const META_TABLE: &str = "__loam_meta";

/// Statistics from a recreation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub event_count: usize,
    pub batch_count: usize,
}

/// Create the meta table and every schema table that does not exist yet
pub fn ensure_tables(db: &mut SqliteDb, schema: &Schema) -> Result<(), LoamError> {
    db.execute_batch(
        "CREATE TABLE IF NOT EXISTS __loam_meta (key TEXT PRIMARY KEY NOT NULL, value);",
    )?;
    for table in schema.tables() {
        db.execute_batch(&table.create_sql())?;
    }
    db.execute(
        "INSERT OR IGNORE INTO __loam_meta (key, value) VALUES ('schema_hash', ?), ('applied_count', 0)",
        &json!([schema.hash()]),
    )?;
    Ok(())
}

fn meta_i64(db: &SqliteDb, key: &str) -> Result<Option<i64>, LoamError> {
    Ok(db
        .select_value("SELECT value FROM __loam_meta WHERE key = ?", &json!([key]))?
        .and_then(|v| v.as_i64()))
}

/// Number of log entries reflected in the application tables
pub fn applied_count(db: &SqliteDb) -> Result<u64, LoamError> {
    Ok(meta_i64(db, "applied_count")?.unwrap_or(0).max(0) as u64)
}

/// Record `delta` more applied entries; runs inside the caller's transaction
pub fn add_applied(db: &mut SqliteDb, delta: u64) -> Result<(), LoamError> {
    db.execute(
        "INSERT INTO __loam_meta (key, value) VALUES ('applied_count', ?)
         ON CONFLICT(key) DO UPDATE SET value = value + excluded.value",
        &json!([delta as i64]),
    )?;
    Ok(())
}

/// Whether the application tables disagree with the log and must be rebuilt
pub fn needs_recreate(db: &SqliteDb, log: &EventLog, schema: &Schema) -> Result<bool, LoamError> {
    if meta_i64(db, "schema_hash")? != Some(schema.hash()) {
        return Ok(true);
    }
    Ok(applied_count(db)? != log.count()?)
}

/// Execute one event's statement, returning the tables it wrote
pub fn apply_event(
    db: &mut SqliteDb,
    schema: &Schema,
    event: &MutationEvent,
) -> Result<BTreeSet<String>, LoamError> {
    let def = schema.resolve(event)?;
    let bound = def.bind(&event.args)?;
    db.execute(&bound.sql, &bound.bind)?;
    Ok(bound.writes)
}

/// Drop and rebuild every application table by replaying the log in id order,
/// `batch_size` entries per transaction
pub fn recreate(
    db: &mut SqliteDb,
    log: &EventLog,
    schema: &Schema,
    batch_size: usize,
) -> Result<RebuildStats, LoamError> {
    info!(db = %db.label(), "recreating materialized store from log");

    in_transaction(db, |db| reset_tables(db, schema))?;
    let stats = replay(db, log, schema, batch_size, true)?;

    info!(events = stats.event_count, batches = stats.batch_count, "recreation complete");
    Ok(stats)
}

/// Like `recreate`, but inside a transaction the caller already holds, so the
/// rebuild commits or rolls back together with the caller's other writes
pub fn rebuild_in_transaction(
    db: &mut SqliteDb,
    log: &EventLog,
    schema: &Schema,
    batch_size: usize,
) -> Result<RebuildStats, LoamError> {
    reset_tables(db, schema)?;
    let stats = replay(db, log, schema, batch_size, false)?;
    debug!(events = stats.event_count, "rebuilt application tables in id order");
    Ok(stats)
}

fn reset_tables(db: &mut SqliteDb, schema: &Schema) -> Result<(), LoamError> {
    for table in schema.tables() {
        db.execute_batch(&table.drop_sql())?;
    }
    db.execute_batch("DROP TABLE IF EXISTS __loam_meta;")?;
    ensure_tables(db, schema)
}

fn in_transaction<T>(
    db: &mut SqliteDb,
    f: impl FnOnce(&mut SqliteDb) -> Result<T, LoamError>,
) -> Result<T, LoamError> {
    db.begin()?;
    match f(db) {
        Ok(value) => {
            db.commit()?;
            Ok(value)
        }
        Err(e) => {
            db.rollback()?;
            Err(e)
        }
    }
}

fn replay(
    db: &mut SqliteDb,
    log: &EventLog,
    schema: &Schema,
    batch_size: usize,
    commit_pages: bool,
) -> Result<RebuildStats, LoamError> {
    let mut stats = RebuildStats::default();
    let mut after = None;
    loop {
        let page = log.entries_after(after.as_ref(), batch_size.max(1))?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(*last.id());

        let apply_page = |db: &mut SqliteDb| {
            page.iter()
                .try_for_each(|entry| apply_event(db, schema, &entry.event).map(|_| ()))?;
            add_applied(db, page.len() as u64)
        };
        if commit_pages {
            in_transaction(db, apply_page)?;
        } else {
            apply_page(db)?;
        }

        stats.event_count += page.len();
        stats.batch_count += 1;
        debug!(events = page.len(), "replayed batch");
    }
    Ok(stats)
}

/// Values of the meta table, for inspection
pub fn meta(db: &SqliteDb) -> Result<Value, LoamError> {
    let rows = db.select("SELECT key, value FROM __loam_meta ORDER BY key", &Value::Null)?;
    let mut out = serde_json::Map::new();
    for mut row in rows {
        if let (Some(Value::String(key)), Some(value)) = (row.remove("key"), row.remove("value")) {
            out.insert(key, value);
        }
    }
    Ok(Value::Object(out))
}
