//! The `Store` facade
//!
//! Callers write through `mutate`/`commit`/`execute` and read through live
//! queries, without caring whether this context is the leader. A follower
//! forwards writes to the leader and waits until its own projection has
//! caught up, so a caller always reads its own writes.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use libloam_core::reactive::NodeId;
use libloam_core::{
    ContextId, EventId, ExecutionItem, GraphSnapshot, LiveQueryDef, LogEntry, LogStats,
    MutationEvent, Origin, ReactivityGraph, Schema, Subscription,
};
use libloam_ipc::Ack;
use libloam_sync::SyncProgress;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::context::{Route, WorkerContext};
use crate::error::{Error, Result};
use crate::follower::FollowerStatus;
use crate::options::StoreOptions;

/// Handle to one execution context's view of a storage location
#[derive(Debug, Clone)]
pub struct Store {
    ctx: Arc<WorkerContext>,
}

impl Store {
    /// Open a context on `options.location`. The first context to open a
    /// location leads; later ones follow it.
    pub async fn open(schema: impl Into<Arc<Schema>>, options: StoreOptions) -> Result<Self> {
        let ctx = WorkerContext::open(schema.into(), options).await?;
        Ok(Self { ctx })
    }

    pub fn context_id(&self) -> ContextId {
        self.ctx.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.ctx.schema
    }

    pub fn location(&self) -> &Path {
        self.ctx.location()
    }

    pub async fn is_leader(&self) -> bool {
        self.ctx.is_leader().await
    }

    /// Build an event for a declared mutation with a fresh id
    pub fn event(&self, mutation: &str, args: Value) -> Result<MutationEvent> {
        Ok(self.ctx.schema.event(self.ctx.next_id(), mutation, args)?)
    }

    /// Apply events in order. The whole call is rejected if any event does
    /// not match the schema.
    pub async fn mutate(&self, events: Vec<MutationEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let items = events.into_iter().map(ExecutionItem::mutate).collect();
        self.submit(items).await
    }

    /// Build and apply a single mutation, returning its id
    pub async fn commit(&self, mutation: &str, args: Value) -> Result<EventId> {
        let event = self.event(mutation, args)?;
        let id = event.id;
        self.mutate(vec![event]).await?;
        Ok(id)
    }

    /// Run a raw statement in a write transaction. It invalidates `tables`
    /// but is not recorded in the mutation log.
    pub async fn execute(
        &self,
        sql: impl Into<String>,
        bind: Value,
        tables: BTreeSet<String>,
    ) -> Result<()> {
        self.submit(vec![ExecutionItem::execute(sql, bind, tables)])
            .await
    }

    async fn submit(&self, items: Vec<ExecutionItem>) -> Result<()> {
        match self.ctx.route().await? {
            Route::Writer(writer) => {
                writer.apply(items, Origin::Local).await?;
                Ok(())
            }
            Route::Forward(mut status) => {
                self.ctx.pipeline().validate(&items)?;
                let since = status.borrow().bootstraps;
                let ack = self.ctx.channel.forward(self.ctx.id, items).await?;
                debug!(leader = %ack.leader, seq = ack.seq, "forwarded batch committed");
                // a stopped follower has nothing left to catch up
                let _ = status.wait_for(|s| caught_up(s, &ack, since)).await;
                Ok(())
            }
        }
    }

    /// Subscribe to a live query
    pub fn subscribe(&self, def: &LiveQueryDef) -> LiveQuery {
        LiveQuery {
            graph: self.ctx.graph.clone(),
            subscription: self.ctx.graph.subscribe(def),
        }
    }

    /// Current value of a query without subscribing
    pub fn query(&self, def: &LiveQueryDef) -> Result<Value> {
        Ok(self.ctx.graph.query(def)?)
    }

    pub fn graph(&self) -> &ReactivityGraph {
        &self.ctx.graph
    }

    pub fn graph_snapshot(&self, include_values: bool) -> GraphSnapshot {
        self.ctx.graph.snapshot(include_values)
    }

    /// Portable image of the application store. A follower asks the leader.
    pub async fn export(&self) -> Result<Vec<u8>> {
        match self.ctx.route().await? {
            Route::Writer(writer) => writer.export_app().await,
            Route::Forward(_) => Ok(self.ctx.channel.request_snapshot().await?.app_bytes),
        }
    }

    /// Portable image of the mutation log
    pub async fn export_mutation_log(&self) -> Result<Vec<u8>> {
        self.ctx
            .writer("export_mutation_log")
            .await?
            .export_log()
            .await
    }

    pub async fn log_entries(&self) -> Result<Vec<LogEntry>> {
        self.ctx.writer("log_entries").await?.entries().await
    }

    pub async fn log_stats(&self) -> Result<LogStats> {
        self.ctx.writer("log_stats").await?.stats().await
    }

    /// Connectivity of the sync transport, if one is configured
    pub fn network_status(&self) -> Option<watch::Receiver<bool>> {
        self.ctx.network_status()
    }

    /// Sync engine state; only a leader with a transport runs one
    pub async fn sync_progress(&self) -> Option<watch::Receiver<SyncProgress>> {
        self.ctx.sync_progress().await
    }

    pub async fn follower_status(&self) -> Option<watch::Receiver<FollowerStatus>> {
        self.ctx.follower_status().await
    }

    /// Try to take over the lease after the leader released it
    pub async fn try_promote(&self) -> Result<bool> {
        self.ctx.try_promote().await
    }

    /// Persist now instead of waiting for the debounce
    pub async fn flush(&self) -> Result<()> {
        match self.ctx.route().await? {
            Route::Writer(writer) => writer.flush().await,
            Route::Forward(_) => Ok(()),
        }
    }

    /// Release both stores and the lease. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.ctx.shutdown().await
    }
}

/// Whether the projection holds the batch `ack` confirmed. `since` is the
/// follower's bootstrap count when the batch was forwarded.
fn caught_up(status: &FollowerStatus, ack: &Ack, since: u64) -> bool {
    match status.leader {
        Some(leader) if leader == ack.leader => status.seq >= ack.seq,
        // only a snapshot from a later leader includes the batch
        Some(_) => status.bootstraps > since,
        None => false,
    }
}

/// A subscribed query. Dropping it releases the subscription.
#[derive(Debug)]
pub struct LiveQuery {
    graph: ReactivityGraph,
    subscription: Subscription,
}

impl LiveQuery {
    /// Current value, recomputed if an invalidation arrived since the last read
    pub fn get(&self) -> Result<Value> {
        self.graph.read(&self.subscription).map_err(Error::from)
    }

    /// Wait for the next invalidation. False once the node is gone.
    pub async fn changed(&mut self) -> bool {
        self.subscription.changed().await
    }

    pub fn has_changed(&self) -> bool {
        self.subscription.has_changed()
    }

    pub fn node(&self) -> NodeId {
        self.subscription.node()
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.graph.release(self.subscription.node());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caught_up() {
        let leader = ContextId::generate();
        let ack = Ack { leader, seq: 3 };
        let mut status = FollowerStatus {
            leader: Some(leader),
            seq: 2,
            bootstrapped: true,
            bootstraps: 1,
            applied: 2,
        };
        assert!(!caught_up(&status, &ack, 1));
        status.seq = 3;
        assert!(caught_up(&status, &ack, 1));
    }

    #[test]
    fn test_stale_leader_does_not_count_as_caught_up() {
        let leader = ContextId::generate();
        let ack = Ack { leader, seq: 1 };
        // still following the previous leader when the ack arrives
        let mut status = FollowerStatus {
            leader: Some(ContextId::generate()),
            seq: 9,
            bootstrapped: true,
            bootstraps: 1,
            applied: 9,
        };
        assert!(!caught_up(&status, &ack, 1));

        // released, not yet re-bootstrapped
        status.leader = None;
        assert!(!caught_up(&status, &ack, 1));

        status.leader = Some(leader);
        status.seq = 1;
        status.bootstraps = 2;
        assert!(caught_up(&status, &ack, 1));

        // a snapshot from a leader after the acking one also covers it
        status.leader = Some(ContextId::generate());
        status.seq = 0;
        status.bootstraps = 3;
        assert!(caught_up(&status, &ack, 1));
    }
}
