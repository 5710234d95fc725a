//! Execution context lifecycle
//!
//! A `WorkerContext` is one participant sharing a storage location. It either
//! holds the lease and runs the writer (and the sync engine), or follows the
//! leader through the broadcaster. The context owns everything explicitly;
//! nothing is reachable through globals.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use libloam_core::{
    load_engine_config, ApplyPipeline, ContextId, EngineConfig, EventId, EventIdGenerator,
    LoamError, OriginId, ReactivityGraph, Schema, Unavailable,
};
use libloam_ipc::{channel_name, BroadcastChannel, LeaderLease, LeaseRecord};
use libloam_sync::{SyncEngine, SyncHandle, SyncOptions, SyncProgress};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::follower::{Follower, FollowerHandle, FollowerStatus};
use crate::options::StoreOptions;
use crate::writer::{Writer, WriterHandle, WriterSetup};

/// What this context currently is for its storage location
pub enum Role {
    /// Holds the lease and both stores
    Leader {
        writer: WriterHandle,
        task: JoinHandle<()>,
        sync: Option<SyncHandle>,
    },
    /// No store handles; reads come from a projection of the leader
    Follower(FollowerHandle),
    Closed,
}

impl std::fmt::Debug for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader { sync, .. } => write!(f, "Leader {{ sync: {} }}", sync.is_some()),
            Role::Follower(_) => write!(f, "Follower"),
            Role::Closed => write!(f, "Closed"),
        }
    }
}

/// Where a write goes from this context
pub enum Route {
    Writer(WriterHandle),
    Forward(watch::Receiver<FollowerStatus>),
}

pub struct WorkerContext {
    pub id: ContextId,
    pub schema: Arc<Schema>,
    pub config: EngineConfig,
    pub location: PathBuf,
    pub graph: ReactivityGraph,
    pub channel: BroadcastChannel,
    options: StoreOptions,
    pipeline: ApplyPipeline,
    ids: Mutex<EventIdGenerator>,
    role: tokio::sync::Mutex<Role>,
    sync_wake: Arc<Notify>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("backend", &self.options.backend)
            .finish()
    }
}

impl WorkerContext {
    /// Join a storage location: take the lease if it is free, otherwise
    /// follow whoever holds it.
    ///
    /// Followers reach their leader through `options.hub`, which only spans
    /// one process. A lease held by another process has no endpoint here, so
    /// such a context keeps waiting for a leader until it can promote.
    pub async fn open(schema: Arc<Schema>, options: StoreOptions) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&options.location).map_err(LoamError::from)?;
        let location = options
            .location
            .canonicalize()
            .map_err(LoamError::from)?;
        let config = match &options.config {
            Some(config) => config.clone(),
            None => load_engine_config(&location)?,
        };
        config.validate()?;

        let id = ContextId::generate();
        let graph = ReactivityGraph::new(Arc::new(Unavailable), config.graph_retention());
        let channel = options.hub.channel(
            &channel_name(&location.display().to_string(), schema.hash()),
            config.broadcast_capacity,
        );
        let pipeline = ApplyPipeline::new(schema.clone(), config.batch_size);
        let ctx = Arc::new(Self {
            id,
            schema,
            config,
            location,
            graph,
            channel,
            options,
            pipeline,
            ids: Mutex::new(EventIdGenerator::new(OriginId::generate())),
            role: tokio::sync::Mutex::new(Role::Closed),
            sync_wake: Arc::new(Notify::new()),
        });

        let mut lease = LeaderLease::new(&ctx.location, id);
        let role = if lease.try_acquire()? {
            ctx.start_leader(lease, ctx.options.recreate)?
        } else {
            if let Some(holder) = foreign_holder(&ctx.location) {
                warn!(
                    context = %id,
                    holder = %holder.context,
                    pid = holder.pid,
                    "lease held by another process, which this process cannot follow"
                );
            }
            info!(context = %id, location = %ctx.location.display(), "lease held elsewhere, following");
            ctx.start_follower()?
        };
        *ctx.role.lock().await = role;
        Ok(ctx)
    }

    fn start_leader(&self, lease: LeaderLease, recreate: bool) -> Result<Role> {
        let (writer, task) = Writer::start(WriterSetup {
            context: self.id,
            schema: self.schema.clone(),
            config: self.config.clone(),
            location: self.location.clone(),
            backend: self.options.backend,
            recreate,
            lease,
            graph: self.graph.clone(),
            channel: self.channel.clone(),
            sync_wake: self.sync_wake.clone(),
        })?;
        let sync = self.options.sync.clone().map(|backend| {
            SyncEngine::spawn_with_waker(
                backend,
                Arc::new(writer.clone()),
                SyncOptions::from_config(&self.config),
                self.sync_wake.clone(),
            )
        });
        info!(context = %self.id, location = %self.location.display(), sync = sync.is_some(), "context is leader");
        Ok(Role::Leader { writer, task, sync })
    }

    fn start_follower(&self) -> Result<Role> {
        let follower = Follower::start(
            self.id,
            self.schema.clone(),
            self.graph.clone(),
            self.channel.clone(),
        )?;
        Ok(Role::Follower(follower))
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn pipeline(&self) -> &ApplyPipeline {
        &self.pipeline
    }

    pub fn next_id(&self) -> EventId {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_id()
    }

    pub async fn is_leader(&self) -> bool {
        matches!(*self.role.lock().await, Role::Leader { .. })
    }

    pub async fn route(&self) -> Result<Route> {
        match &*self.role.lock().await {
            Role::Leader { writer, .. } => Ok(Route::Writer(writer.clone())),
            Role::Follower(follower) => Ok(Route::Forward(follower.status())),
            Role::Closed => Err(Error::Closed),
        }
    }

    /// The writer, for operations only the leader can serve
    pub async fn writer(&self, operation: &'static str) -> Result<WriterHandle> {
        match self.route().await? {
            Route::Writer(writer) => Ok(writer),
            Route::Forward(_) => Err(Error::NotLeader(operation)),
        }
    }

    pub async fn sync_progress(&self) -> Option<watch::Receiver<SyncProgress>> {
        match &*self.role.lock().await {
            Role::Leader {
                sync: Some(sync), ..
            } => Some(sync.progress()),
            _ => None,
        }
    }

    pub async fn follower_status(&self) -> Option<watch::Receiver<FollowerStatus>> {
        match &*self.role.lock().await {
            Role::Follower(follower) => Some(follower.status()),
            _ => None,
        }
    }

    pub fn network_status(&self) -> Option<watch::Receiver<bool>> {
        self.options.sync.as_ref().map(|backend| backend.connectivity())
    }

    /// Take the lease if its holder let it go. The new leader recreates the
    /// application store from the log and repoints the graph at it.
    pub async fn try_promote(&self) -> Result<bool> {
        let mut role = self.role.lock().await;
        match &*role {
            Role::Leader { .. } => return Ok(true),
            Role::Closed => return Err(Error::Closed),
            Role::Follower(_) => {}
        }

        let mut lease = LeaderLease::new(&self.location, self.id);
        if !lease.try_acquire()? {
            return Ok(false);
        }
        // the follower leaves the channel before the writer joins it
        if let Role::Follower(follower) = std::mem::replace(&mut *role, Role::Closed) {
            follower.stop().await;
        }
        match self.start_leader(lease, true) {
            Ok(leader) => {
                info!(context = %self.id, "promoted to leader");
                *role = leader;
                Ok(true)
            }
            Err(e) => {
                error!(context = %self.id, error = %e, "promotion failed, following again");
                *role = self.start_follower()?;
                Err(e)
            }
        }
    }

    /// Stop sync, flush and close both stores, release the lease. Calling it
    /// again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let mut role = self.role.lock().await;
        let result = match std::mem::replace(&mut *role, Role::Closed) {
            Role::Leader { writer, task, sync } => {
                // sync reads through the writer, so it stops first
                if let Some(sync) = sync {
                    if let Err(e) = sync.shutdown().await {
                        warn!(context = %self.id, error = %e, "sync engine stopped with error");
                    }
                }
                let closed = writer.shutdown().await;
                if let Err(e) = task.await {
                    error!(context = %self.id, error = %e, "writer task panicked");
                }
                closed
            }
            Role::Follower(follower) => {
                follower.stop().await;
                Ok(())
            }
            Role::Closed => return Ok(()),
        };
        self.graph.set_executor(Arc::new(Unavailable));
        info!(context = %self.id, "context shut down");
        result
    }
}

/// The recorded lease holder, if it lives in another process
fn foreign_holder(location: &Path) -> Option<LeaseRecord> {
    LeaderLease::holder(location)
        .ok()
        .flatten()
        .filter(|record| record.pid != std::process::id())
}
