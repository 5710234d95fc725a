//! Follower projection
//!
//! A context without the lease keeps no database files open. It holds an
//! in-memory copy of the application tables, seeded from a leader snapshot
//! and advanced by the leader's committed batches, and points its reactivity
//! graph at that copy.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use libloam_core::{materialize, ContextId, LoamError, ReactivityGraph, Schema, SharedDb, SqliteDb};
use libloam_ipc::{BroadcastChannel, BroadcastMessage, CommittedItem, IpcError, Snapshot};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Error;

/// Delay before asking again after a failed snapshot request
const SNAPSHOT_RETRY: Duration = Duration::from_millis(50);

/// What a follower has seen of the leader
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowerStatus {
    /// Leader the projection follows, if one is known
    pub leader: Option<ContextId>,
    /// Last leader commit sequence in the projection
    pub seq: u64,
    pub bootstrapped: bool,
    /// Snapshots installed since start
    pub bootstraps: u64,
    /// Committed batches projected since start
    pub applied: u64,
}

enum Step {
    Continue,
    Stop,
}

/// Handle to a running follower task
#[derive(Debug)]
pub struct FollowerHandle {
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<FollowerStatus>,
    task: JoinHandle<()>,
}

impl FollowerHandle {
    pub fn status(&self) -> watch::Receiver<FollowerStatus> {
        self.status.clone()
    }

    /// Stop the task and leave the channel
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!(error = %e, "follower task panicked");
            }
        }
    }
}

pub struct Follower {
    context: ContextId,
    schema: Arc<Schema>,
    graph: ReactivityGraph,
    channel: BroadcastChannel,
    projection: SharedDb,
    inbox: mpsc::Receiver<BroadcastMessage>,
    /// Messages received while a snapshot was in flight
    pending: VecDeque<BroadcastMessage>,
    needs_bootstrap: bool,
    status: watch::Sender<FollowerStatus>,
}

impl Follower {
    /// Subscribe to the channel and start following whichever context leads
    pub fn start(
        context: ContextId,
        schema: Arc<Schema>,
        graph: ReactivityGraph,
        channel: BroadcastChannel,
    ) -> Result<FollowerHandle, Error> {
        let mut db = SqliteDb::open_in_memory("projection")?;
        materialize::ensure_tables(&mut db, &schema)?;
        let projection = SharedDb::new(db);
        graph.set_executor(Arc::new(projection.clone()));

        // subscribe before the first snapshot so no commit falls in between
        let inbox = channel.subscribe(context);
        let (status_tx, status_rx) = watch::channel(FollowerStatus::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let follower = Follower {
            context,
            schema,
            graph,
            channel,
            projection,
            inbox,
            pending: VecDeque::new(),
            needs_bootstrap: true,
            status: status_tx,
        };
        let task = tokio::spawn(follower.run(shutdown_rx));
        Ok(FollowerHandle {
            shutdown: shutdown_tx,
            status: status_rx,
            task,
        })
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(context = %self.context, channel = self.channel.name(), "follower started");
        loop {
            if self.needs_bootstrap {
                if let Step::Stop = self.bootstrap(&mut shutdown).await {
                    break;
                }
                continue;
            }
            if let Some(msg) = self.pending.pop_front() {
                self.on_message(msg);
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.on_message(msg),
                    None => break,
                },
            }
        }
        self.channel.unsubscribe(self.context);
        info!(context = %self.context, "follower stopped");
    }

    /// Ask the leader for a snapshot while still draining the inbox, so a
    /// leader blocked on a full queue can always make progress
    async fn bootstrap(&mut self, shutdown: &mut watch::Receiver<bool>) -> Step {
        let result = {
            let request = self.channel.request_snapshot();
            tokio::pin!(request);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return Step::Stop,
                    result = &mut request => break result,
                    msg = self.inbox.recv() => match msg {
                        Some(msg) => self.pending.push_back(msg),
                        None => return Step::Stop,
                    },
                }
            }
        };

        match result {
            Ok(snapshot) => {
                if let Err(e) = self.install(&snapshot) {
                    error!(error = %e, "installing leader snapshot failed");
                    return self.pause(shutdown, SNAPSHOT_RETRY).await;
                }
                Step::Continue
            }
            Err(IpcError::NoLeader) => {
                self.status.send_modify(|s| s.leader = None);
                debug!(context = %self.context, "no leader yet, waiting");
                tokio::select! {
                    _ = shutdown.changed() => Step::Stop,
                    msg = self.inbox.recv() => match msg {
                        Some(msg) => {
                            self.pending.push_back(msg);
                            Step::Continue
                        }
                        None => Step::Stop,
                    },
                    // a leader may register without having published yet
                    _ = tokio::time::sleep(SNAPSHOT_RETRY) => Step::Continue,
                }
            }
            Err(e) => {
                warn!(error = %e, "snapshot request failed, retrying");
                self.pause(shutdown, SNAPSHOT_RETRY).await
            }
        }
    }

    async fn pause(&mut self, shutdown: &mut watch::Receiver<bool>, delay: Duration) -> Step {
        tokio::select! {
            _ = shutdown.changed() => Step::Stop,
            _ = tokio::time::sleep(delay) => Step::Continue,
        }
    }

    fn install(&mut self, snapshot: &Snapshot) -> Result<(), LoamError> {
        self.projection.lock().import_bytes(&snapshot.app_bytes)?;
        // the snapshot already covers every announcement made before it
        self.pending.retain(|msg| {
            !matches!(msg, BroadcastMessage::LeaderElected { leader } if *leader == snapshot.leader)
        });
        self.needs_bootstrap = false;
        self.status.send_modify(|s| {
            s.leader = Some(snapshot.leader);
            s.seq = snapshot.seq;
            s.bootstrapped = true;
            s.bootstraps += 1;
        });
        let invalidated = self.graph.invalidate_all();
        info!(
            leader = %snapshot.leader,
            seq = snapshot.seq,
            bytes = snapshot.app_bytes.len(),
            invalidated,
            "projection bootstrapped"
        );
        Ok(())
    }

    fn on_message(&mut self, msg: BroadcastMessage) {
        let status = self.status.borrow().clone();
        match msg {
            BroadcastMessage::Committed {
                sender,
                seq,
                items,
                tables,
            } => {
                if status.leader != Some(sender) {
                    debug!(from = %sender, "commit from an unknown leader, re-bootstrapping");
                    self.needs_bootstrap = true;
                    return;
                }
                if seq <= status.seq {
                    debug!(seq, current = status.seq, "commit already in projection");
                    return;
                }
                if seq != status.seq + 1 {
                    warn!(seq, current = status.seq, "commit sequence gap, re-bootstrapping");
                    self.needs_bootstrap = true;
                    return;
                }
                match self.project(&items) {
                    Ok(written) => {
                        let changed: BTreeSet<String> = tables.union(&written).cloned().collect();
                        let invalidated = self.graph.notify_tables_changed(&changed);
                        debug!(seq, items = items.len(), invalidated, "commit projected");
                        self.status.send_modify(|s| {
                            s.seq = seq;
                            s.applied += 1;
                        });
                    }
                    Err(e) => {
                        error!(seq, error = %e, "projecting commit failed, re-bootstrapping");
                        self.needs_bootstrap = true;
                    }
                }
            }
            BroadcastMessage::LeaderElected { leader } => {
                info!(leader = %leader, "leader elected");
                self.needs_bootstrap = true;
            }
            BroadcastMessage::LeaderReleased { leader } => {
                if status.leader == Some(leader) {
                    info!(leader = %leader, "leader released the lease");
                    self.status.send_modify(|s| s.leader = None);
                }
            }
        }
    }

    /// Replay one committed batch into the projection, all or nothing
    fn project(&self, items: &[CommittedItem]) -> Result<BTreeSet<String>, LoamError> {
        let mut db = self.projection.lock();
        db.begin()?;
        let mut tables = BTreeSet::new();
        for item in items {
            let written = match item {
                CommittedItem::Event { event, .. } => {
                    materialize::apply_event(&mut db, &self.schema, event)
                }
                CommittedItem::Execute {
                    sql,
                    bind,
                    tables: declared,
                } => db.execute(sql, bind).map(|_| declared.clone()),
            };
            match written {
                Ok(written) => tables.extend(written),
                Err(e) => {
                    db.rollback()?;
                    return Err(e);
                }
            }
        }
        db.commit()?;
        Ok(tables)
    }
}
