//! Embedded relational store
//!
//! Thin wrapper over a rusqlite connection with the contract the engine
//! relies on: parameterised execute/select with JSON values, explicit
//! begin/commit/rollback, and byte-level export/import of the whole database.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::backup::Progress;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, DatabaseName, Statement};
use serde_json::Value;
use tracing::debug;

use crate::error::LoamError;

/// One result row, keyed by column name
pub type Row = serde_json::Map<String, Value>;

/// A single SQLite database handle
pub struct SqliteDb {
    conn: Option<Connection>,
    label: String,
}

impl std::fmt::Debug for SqliteDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDb")
            .field("label", &self.label)
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl SqliteDb {
    /// Open or create a database file
    pub fn open(path: &Path) -> Result<Self, LoamError> {
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Some(conn),
            label: path.display().to_string(),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory(label: &str) -> Result<Self, LoamError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Some(conn),
            label: format!("memory:{}", label),
        })
    }

    fn configure(conn: &Connection) -> Result<(), LoamError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn conn(&self) -> Result<&Connection, LoamError> {
        self.conn
            .as_ref()
            .ok_or_else(|| LoamError::Internal(format!("database {} is closed", self.label)))
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, LoamError> {
        let label = &self.label;
        self.conn
            .as_mut()
            .ok_or_else(|| LoamError::Internal(format!("database {} is closed", label)))
    }

    /// Execute one statement with bound parameters, returning affected rows
    pub fn execute(&mut self, sql: &str, bind: &Value) -> Result<usize, LoamError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        bind_params(&mut stmt, bind)?;
        Ok(stmt.raw_execute()?)
    }

    /// Execute several `;`-separated statements without parameters
    pub fn execute_batch(&mut self, sql: &str) -> Result<(), LoamError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    /// Run a read-only query and collect all rows. Statements that would
    /// write are rejected before they run.
    pub fn select(&self, sql: &str, bind: &Value) -> Result<Vec<Row>, LoamError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        if !stmt.readonly() {
            return Err(LoamError::InvalidArgs(format!(
                "query is not read-only: {}",
                sql
            )));
        }
        bind_params(&mut stmt, bind)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut out = Vec::new();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            let mut obj = Row::new();
            for (i, name) in columns.iter().enumerate() {
                obj.insert(name.clone(), value_ref_to_json(row.get_ref(i)?));
            }
            out.push(obj);
        }
        Ok(out)
    }

    /// First column of the first row, if any
    pub fn select_value(&self, sql: &str, bind: &Value) -> Result<Option<Value>, LoamError> {
        let rows = self.select(sql, bind)?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().map(|(_, v)| v)))
    }

    pub fn begin(&mut self) -> Result<(), LoamError> {
        self.execute_batch("BEGIN")
    }

    pub fn commit(&mut self) -> Result<(), LoamError> {
        self.execute_batch("COMMIT")
    }

    /// Roll back the open transaction; a no-op outside a transaction
    pub fn rollback(&mut self) -> Result<(), LoamError> {
        if self.in_transaction() {
            self.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.conn
            .as_ref()
            .map(|c| !c.is_autocommit())
            .unwrap_or(false)
    }

    /// Names of user tables, sorted
    pub fn table_names(&self) -> Result<Vec<String>, LoamError> {
        let rows = self.select(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &Value::Null,
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|mut r| match r.remove("name") {
                Some(Value::String(s)) => Some(s),
                _ => None,
            })
            .collect())
    }

    /// Contents of every user table except those starting with `skip_prefix`.
    ///
    /// Rows are sorted by their JSON rendering so two databases holding the
    /// same rows compare equal regardless of insertion order.
    pub fn dump(&self, skip_prefix: &str) -> Result<BTreeMap<String, Vec<Row>>, LoamError> {
        let mut out = BTreeMap::new();
        for table in self.table_names()? {
            if table.starts_with(skip_prefix) {
                continue;
            }
            let mut rows = self.select(&format!("SELECT * FROM \"{}\"", table), &Value::Null)?;
            rows.sort_by_cached_key(|r| Value::Object(r.clone()).to_string());
            out.insert(table, rows);
        }
        Ok(out)
    }

    /// Serialise the whole database to a portable SQLite image
    pub fn export_bytes(&self) -> Result<Vec<u8>, LoamError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("export.db");
        let target = path.to_string_lossy().replace('\'', "''");
        self.conn()?
            .execute_batch(&format!("VACUUM INTO '{}'", target))?;
        let bytes = std::fs::read(&path)?;
        debug!(db = %self.label, bytes = bytes.len(), "exported database");
        Ok(bytes)
    }

    /// Replace the database content with a previously exported image
    pub fn import_bytes(&mut self, bytes: &[u8]) -> Result<(), LoamError> {
        if bytes.is_empty() {
            return Err(LoamError::InvalidArgs("cannot import an empty image".to_string()));
        }
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("import.db");
        std::fs::write(&path, bytes)?;
        self.conn_mut()?
            .restore(DatabaseName::Main, &path, None::<fn(Progress)>)?;
        debug!(db = %self.label, bytes = bytes.len(), "imported database");
        Ok(())
    }

    /// Close the handle. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), LoamError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| LoamError::Storage(e))?;
            debug!(db = %self.label, "database closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }
}

/// A database handle shared between the writer and readers of one context.
///
/// The mutex is the write queue's serialization point: a read issued while a
/// batch is being applied waits for the batch to commit or roll back.
#[derive(Clone, Debug)]
pub struct SharedDb(Arc<Mutex<SqliteDb>>);

impl SharedDb {
    pub fn new(db: SqliteDb) -> Self {
        SharedDb(Arc::new(Mutex::new(db)))
    }

    pub fn lock(&self) -> MutexGuard<'_, SqliteDb> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn bind_params(stmt: &mut Statement<'_>, bind: &Value) -> Result<(), LoamError> {
    let count = stmt.parameter_count();
    match bind {
        Value::Null => {
            if count > 0 {
                return Err(LoamError::InvalidArgs(format!(
                    "statement expects {} parameters, none bound",
                    count
                )));
            }
        }
        Value::Array(values) => {
            if values.len() != count {
                return Err(LoamError::InvalidArgs(format!(
                    "statement expects {} parameters, got {}",
                    count,
                    values.len()
                )));
            }
            for (i, v) in values.iter().enumerate() {
                stmt.raw_bind_parameter(i + 1, json_to_sql(v))?;
            }
        }
        Value::Object(map) => {
            let names: Vec<Option<String>> = (1..=count)
                .map(|i| stmt.parameter_name(i).map(str::to_owned))
                .collect();
            for (i, name) in names.into_iter().enumerate() {
                let name = name.ok_or_else(|| {
                    LoamError::InvalidArgs(format!(
                        "positional parameter {} cannot bind from named values",
                        i + 1
                    ))
                })?;
                let key = name.trim_start_matches([':', '$', '@']);
                let value = map.get(key).ok_or_else(|| {
                    LoamError::InvalidArgs(format!("missing bind value for '{}'", key))
                })?;
                stmt.raw_bind_parameter(i + 1, json_to_sql(value))?;
            }
        }
        other => {
            return Err(LoamError::InvalidArgs(format!(
                "bind values must be an object or array, got {}",
                other
            )))
        }
    }
    Ok(())
}

/// Convert a JSON value to the SQLite value it binds as
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}
