//! Apply Pipeline
//!
//! Executes a batch of items against the Materialized Store and appends the
//! mutation events to the Event Log Store, in one transaction per store. The
//! log commits first; the application store records the applied count in its
//! own transaction, so a failure between the two commits is visible as a count
//! mismatch and repaired by recreation.
//!
//! The application tables always equal a replay of the log in id order. A
//! batch holding an event that sorts before an entry already in the log (or
//! before an earlier event of the same batch) is rebased: its entries are
//! logged and the tables are rebuilt from the log inside the same
//! transaction.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::SqliteDb;
use crate::error::LoamError;
use crate::log::EventLog;
use crate::materialize::{self, RebuildStats};
use crate::schema::{BoundStatement, Schema};
use crate::types::event::{LogEntry, MutationEvent, Origin, RemoteEvent, SyncStatus};

/// One unit of work for the writer
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionItem {
    /// Raw statement; runs in the batch transaction but is not logged
    Execute {
        sql: String,
        bind: Value,
        tables: BTreeSet<String>,
    },
    /// A mutation event to apply and log
    Mutate { event: MutationEvent, persisted: bool },
}

impl ExecutionItem {
    pub fn mutate(event: MutationEvent) -> Self {
        ExecutionItem::Mutate {
            event,
            persisted: true,
        }
    }

    /// A remote event, keeping the remote's `persisted` flag
    pub fn remote(remote: RemoteEvent) -> Self {
        ExecutionItem::Mutate {
            event: remote.event,
            persisted: remote.persisted,
        }
    }

    pub fn execute(sql: impl Into<String>, bind: Value, tables: BTreeSet<String>) -> Self {
        ExecutionItem::Execute {
            sql: sql.into(),
            bind,
            tables,
        }
    }

    pub fn event(&self) -> Option<&MutationEvent> {
        match self {
            ExecutionItem::Mutate { event, .. } => Some(event),
            ExecutionItem::Execute { .. } => None,
        }
    }
}

/// Result of one committed batch
#[derive(Debug, Clone, Default)]
pub struct AppliedBatch {
    /// Log entries written, in apply order
    pub entries: Vec<LogEntry>,
    /// Union of every table touched by the batch
    pub tables: BTreeSet<String>,
    /// The application tables were rebuilt in id order rather than
    /// advanced item by item
    pub rebased: bool,
}

impl AppliedBatch {
    pub fn has_pending(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.sync_status == SyncStatus::Pending)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.tables.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ApplyPipeline {
    schema: Arc<Schema>,
    batch_size: usize,
}

impl ApplyPipeline {
    pub fn new(schema: Arc<Schema>, batch_size: usize) -> Self {
        Self {
            schema,
            batch_size: batch_size.max(1),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Resolve every mutation in `items`; any failure rejects all of them
    pub fn validate(&self, items: &[ExecutionItem]) -> Result<(), LoamError> {
        for item in items {
            if let ExecutionItem::Mutate { event, .. } = item {
                self.schema.resolve(event)?;
            }
        }
        Ok(())
    }

    /// Apply one bounded batch atomically across both stores.
    ///
    /// Nothing is written if any item is invalid or any statement fails.
    pub fn apply_batch(
        &self,
        app: &mut SqliteDb,
        log: &mut EventLog,
        items: &[ExecutionItem],
        origin: Origin,
    ) -> Result<AppliedBatch, LoamError> {
        if items.len() > self.batch_size {
            return Err(LoamError::Internal(format!(
                "batch of {} exceeds the limit of {}",
                items.len(),
                self.batch_size
            )));
        }
        self.validate(items)?;
        let rebase = out_of_order(log, items)?;

        let created_at = chrono::Utc::now().to_rfc3339();

        log.begin()?;
        if let Err(e) = app.begin() {
            log.rollback()?;
            return Err(e);
        }

        let mut batch = AppliedBatch::default();
        let result = if rebase {
            self.rebase_items(app, log, items, origin, &created_at, &mut batch)
        } else {
            items
                .iter()
                .try_for_each(|item| self.apply_item(app, log, item, origin, &created_at, &mut batch))
                .and_then(|_| {
                    if batch.entries.is_empty() {
                        Ok(())
                    } else {
                        materialize::add_applied(app, batch.entries.len() as u64)
                    }
                })
        };

        if let Err(e) = result {
            rollback_both(app, log);
            return Err(e);
        }

        if let Err(e) = log.commit() {
            rollback_both(app, log);
            return Err(e);
        }
        if let Err(e) = app.commit() {
            // The log already holds the batch; the applied count now lags it.
            warn!(error = %e, "application store commit failed after log commit");
            rollback_both(app, log);
            return Err(e);
        }

        debug!(
            origin = ?origin,
            items = items.len(),
            events = batch.entries.len(),
            tables = ?batch.tables,
            rebased = batch.rebased,
            "batch committed"
        );
        Ok(batch)
    }

    /// Log every event, rebuild the application tables from the log in id
    /// order, then run the raw statements on top
    fn rebase_items(
        &self,
        app: &mut SqliteDb,
        log: &mut EventLog,
        items: &[ExecutionItem],
        origin: Origin,
        created_at: &str,
        batch: &mut AppliedBatch,
    ) -> Result<(), LoamError> {
        for item in items {
            if let ExecutionItem::Mutate { event, persisted } = item {
                let def = self.schema.resolve(event)?;
                def.bind(&event.args)?;
                let entry = LogEntry {
                    event: event.clone(),
                    sync_status: origin.initial_status(def.local_only),
                    created_at: created_at.to_string(),
                    persisted: *persisted,
                };
                log.append(&entry)?;
                batch.entries.push(entry);
            }
        }

        let stats = materialize::rebuild_in_transaction(app, log, &self.schema, self.batch_size)?;
        info!(
            events = batch.entries.len(),
            replayed = stats.event_count,
            "out-of-order batch rebased onto the log"
        );
        batch.rebased = true;
        batch.tables.extend(self.schema.tables().map(|t| t.name.clone()));

        for item in items {
            if let ExecutionItem::Execute { sql, bind, tables } = item {
                app.execute(sql, bind)?;
                batch.tables.extend(tables.iter().cloned());
            }
        }
        Ok(())
    }

    fn apply_item(
        &self,
        app: &mut SqliteDb,
        log: &mut EventLog,
        item: &ExecutionItem,
        origin: Origin,
        created_at: &str,
        batch: &mut AppliedBatch,
    ) -> Result<(), LoamError> {
        match item {
            ExecutionItem::Execute { sql, bind, tables } => {
                app.execute(sql, bind)?;
                batch.tables.extend(tables.iter().cloned());
            }
            ExecutionItem::Mutate { event, persisted } => {
                let def = self.schema.resolve(event)?;
                let BoundStatement { sql, bind, writes } = def.bind(&event.args)?;
                app.execute(&sql, &bind)?;

                let entry = LogEntry {
                    event: event.clone(),
                    sync_status: origin.initial_status(def.local_only),
                    created_at: created_at.to_string(),
                    persisted: *persisted,
                };
                log.append(&entry)?;
                batch.entries.push(entry);
                batch.tables.extend(writes);
            }
        }
        Ok(())
    }

    /// Rebuild the application store if it no longer matches the log
    pub fn repair(&self, app: &mut SqliteDb, log: &EventLog) -> Result<Option<RebuildStats>, LoamError> {
        if materialize::needs_recreate(app, log, &self.schema)? {
            return materialize::recreate(app, log, &self.schema, self.batch_size).map(Some);
        }
        Ok(None)
    }
}

/// Whether applying `items` in order would put an event after one with a
/// higher id
fn out_of_order(log: &EventLog, items: &[ExecutionItem]) -> Result<bool, LoamError> {
    let mut last = log.max_id()?;
    for event in items.iter().filter_map(ExecutionItem::event) {
        if last.is_some_and(|last| event.id < last) {
            return Ok(true);
        }
        last = Some(event.id);
    }
    Ok(false)
}

fn rollback_both(app: &mut SqliteDb, log: &mut EventLog) {
    if let Err(e) = app.rollback() {
        warn!(error = %e, "application store rollback failed");
    }
    if let Err(e) = log.rollback() {
        warn!(error = %e, "mutation log rollback failed");
    }
}
