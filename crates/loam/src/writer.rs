//! Writer task
//!
//! The leader context's single owner of both stores. Every write, log read,
//! export and leader request is a message to this task, so apply
//! transactions are strictly serialized.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use libloam_core::{
    materialize, AppliedBatch, ApplyPipeline, ContextId, EngineConfig, EventId, ExecutionItem,
    LoamError, LogEntry, LogStats, Origin, ReactivityGraph, RemoteEvent, Schema,
};
use libloam_ipc::{
    Ack, BroadcastChannel, BroadcastMessage, CommittedItem, LeaderLease, LeaderRequest, Rejection,
    Snapshot,
};
use libloam_sync::LogSink;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::options::StorageBackend;
use crate::persist::Debouncer;
use crate::storage::Stores;

type Reply<T> = oneshot::Sender<Result<T, LoamError>>;

/// Message sent to the writer
pub enum WriterMessage {
    Apply {
        items: Vec<ExecutionItem>,
        origin: Origin,
        reply: Reply<Vec<LogEntry>>,
    },
    Confirm {
        id: EventId,
        reply: Reply<bool>,
    },
    Cursor {
        reply: Reply<Option<EventId>>,
    },
    Pending {
        limit: usize,
        reply: Reply<Vec<LogEntry>>,
    },
    Contains {
        id: EventId,
        reply: Reply<bool>,
    },
    Entries {
        reply: Reply<Vec<LogEntry>>,
    },
    Stats {
        reply: Reply<LogStats>,
    },
    ExportApp {
        reply: Reply<Vec<u8>>,
    },
    ExportLog {
        reply: Reply<Vec<u8>>,
    },
    Flush {
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

/// What a new leader needs to open its stores
pub struct WriterSetup {
    pub context: ContextId,
    pub schema: Arc<Schema>,
    pub config: EngineConfig,
    pub location: PathBuf,
    pub backend: StorageBackend,
    pub recreate: bool,
    pub lease: LeaderLease,
    pub graph: ReactivityGraph,
    pub channel: BroadcastChannel,
    pub sync_wake: Arc<Notify>,
}

pub struct Writer {
    context: ContextId,
    pipeline: ApplyPipeline,
    stores: Stores,
    lease: LeaderLease,
    graph: ReactivityGraph,
    channel: BroadcastChannel,
    rx: mpsc::Receiver<WriterMessage>,
    requests: mpsc::Receiver<LeaderRequest>,
    inbox: mpsc::Receiver<BroadcastMessage>,
    /// Commit sequence shared with followers
    seq: u64,
    debounce: Debouncer,
    sync_wake: Arc<Notify>,
}

impl Writer {
    /// Open both stores, recreating the application store if needed, and
    /// start the writer task
    pub fn start(setup: WriterSetup) -> Result<(WriterHandle, JoinHandle<()>), Error> {
        let WriterSetup {
            context,
            schema,
            config,
            location,
            backend,
            recreate,
            lease,
            graph,
            channel,
            sync_wake,
        } = setup;
        lease.ensure_held()?;

        let mut stores = Stores::open(&location, backend, &schema)?;
        let pipeline = ApplyPipeline::new(schema.clone(), config.batch_size);
        let rebuilt = {
            let mut app = stores.app.lock();
            if recreate {
                Some(materialize::recreate(
                    &mut app,
                    &stores.log,
                    &schema,
                    config.batch_size,
                ))
                .transpose()
            } else {
                pipeline.repair(&mut app, &stores.log)
            }
        };
        let rebuilt = match rebuilt {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                let _ = stores.close();
                return Err(e.into());
            }
        };
        if let Some(stats) = &rebuilt {
            info!(
                events = stats.event_count,
                batches = stats.batch_count,
                "application store recreated"
            );
        }

        let requests = match channel.register_leader(context) {
            Ok(requests) => requests,
            Err(e) => {
                let _ = stores.close();
                return Err(e.into());
            }
        };
        let inbox = channel.subscribe(context);
        graph.set_executor(Arc::new(stores.app.clone()));

        let mut debounce = Debouncer::new(config.persist_debounce());
        if rebuilt.is_some() && stores.needs_flush() {
            debounce.touch();
        }

        let (tx, rx) = mpsc::channel(config.writer_queue.max(1));
        let writer = Writer {
            context,
            pipeline,
            stores,
            lease,
            graph,
            channel,
            rx,
            requests,
            inbox,
            seq: 0,
            debounce,
            sync_wake,
        };
        let task = tokio::spawn(writer.run());
        Ok((WriterHandle { tx }, task))
    }

    async fn run(mut self) {
        info!(context = %self.context, "writer started");
        self.channel
            .publish(BroadcastMessage::LeaderElected {
                leader: self.context,
            })
            .await;

        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(WriterMessage::Shutdown { reply }) => {
                        info!(context = %self.context, "writer shutdown requested");
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                Some(request) = self.requests.recv() => self.handle_request(request).await,
                Some(msg) = self.inbox.recv() => self.on_broadcast(msg),
                _ = self.debounce.wait(), if self.debounce.is_armed() => {
                    if let Err(e) = self.flush().await {
                        error!(error = %e, "debounced flush failed");
                    }
                }
            }
        }

        let result = self.close().await;
        if let Err(e) = &result {
            error!(context = %self.context, error = %e, "writer closed with error");
        }
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(result);
        }
        info!(context = %self.context, "writer stopped");
    }

    async fn handle(&mut self, msg: WriterMessage) {
        match msg {
            WriterMessage::Apply {
                items,
                origin,
                reply,
            } => {
                let result = self.apply(items, origin).await;
                let _ = reply.send(result);
            }
            WriterMessage::Confirm { id, reply } => {
                let result = self.stores.log.mark_synced(&id);
                if matches!(result, Ok(true)) && self.stores.needs_flush() {
                    self.debounce.touch();
                }
                let _ = reply.send(result);
            }
            WriterMessage::Cursor { reply } => {
                let _ = reply.send(self.stores.log.cursor());
            }
            WriterMessage::Pending { limit, reply } => {
                let _ = reply.send(self.stores.log.pending(limit));
            }
            WriterMessage::Contains { id, reply } => {
                let _ = reply.send(self.stores.log.contains(&id));
            }
            WriterMessage::Entries { reply } => {
                let _ = reply.send(self.stores.log.entries());
            }
            WriterMessage::Stats { reply } => {
                let _ = reply.send(self.stores.log.stats());
            }
            WriterMessage::ExportApp { reply } => {
                let _ = reply.send(self.stores.app.lock().export_bytes());
            }
            WriterMessage::ExportLog { reply } => {
                let _ = reply.send(self.stores.log.export_bytes());
            }
            WriterMessage::Flush { reply } => {
                let _ = reply.send(self.flush().await);
            }
            WriterMessage::Shutdown { .. } => {}
        }
    }

    /// Validate everything, then commit in bounded batches
    async fn apply(
        &mut self,
        items: Vec<ExecutionItem>,
        origin: Origin,
    ) -> Result<Vec<LogEntry>, LoamError> {
        self.lease
            .ensure_held()
            .map_err(|e| LoamError::ConcurrencyViolation(e.to_string()))?;
        self.pipeline.validate(&items)?;

        let mut entries = Vec::new();
        for chunk in items.chunks(self.pipeline.batch_size()) {
            let result = {
                let mut app = self.stores.app.lock();
                self.pipeline
                    .apply_batch(&mut app, &mut self.stores.log, chunk, origin)
            };
            match result {
                Ok(batch) => {
                    self.after_commit(chunk, &batch, origin).await;
                    entries.extend(batch.entries);
                }
                Err(e) => {
                    warn!(error = %e, origin = ?origin, "batch rejected");
                    self.repair().await;
                    return Err(e);
                }
            }
        }
        Ok(entries)
    }

    async fn after_commit(&mut self, chunk: &[ExecutionItem], batch: &AppliedBatch, origin: Origin) {
        let invalidated = self.graph.notify_tables_changed(&batch.tables);
        debug!(
            events = batch.entries.len(),
            tables = ?batch.tables,
            invalidated,
            "batch applied"
        );
        if self.stores.needs_flush() {
            self.debounce.touch();
        }
        if batch.has_pending() {
            self.sync_wake.notify_one();
        }
        if origin == Origin::Broadcast {
            return;
        }

        self.seq += 1;
        if batch.rebased {
            // the projection cannot replay an out-of-order batch; followers
            // re-bootstrap from a snapshot taken at the new sequence
            self.channel
                .publish(BroadcastMessage::LeaderElected {
                    leader: self.context,
                })
                .await;
            return;
        }
        let mut committed = batch.entries.iter();
        let items = chunk
            .iter()
            .filter_map(|item| match item {
                ExecutionItem::Mutate { .. } => committed.next().map(CommittedItem::from_entry),
                ExecutionItem::Execute { .. } => CommittedItem::from_execute(item),
            })
            .collect();
        self.channel
            .publish(BroadcastMessage::committed(
                self.context,
                self.seq,
                items,
                batch.tables.clone(),
            ))
            .await;
    }

    /// After a failed batch, rebuild the application store if the two
    /// stores no longer agree
    async fn repair(&mut self) {
        let repaired = {
            let mut app = self.stores.app.lock();
            self.pipeline.repair(&mut app, &self.stores.log)
        };
        match repaired {
            Ok(Some(stats)) => {
                warn!(events = stats.event_count, "application store rebuilt after failed commit");
                self.graph.invalidate_all();
                // followers re-bootstrap from a fresh snapshot
                self.channel
                    .publish(BroadcastMessage::LeaderElected {
                        leader: self.context,
                    })
                    .await;
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "repair after failed batch failed"),
        }
    }

    async fn handle_request(&mut self, request: LeaderRequest) {
        match request {
            LeaderRequest::Snapshot { reply } => {
                let result = self
                    .stores
                    .app
                    .lock()
                    .export_bytes()
                    .map(|app_bytes| Snapshot {
                        leader: self.context,
                        seq: self.seq,
                        app_bytes,
                    })
                    .map_err(|e| rejection(&e));
                let _ = reply.send(result);
            }
            LeaderRequest::Forward {
                sender,
                items,
                reply,
            } => {
                debug!(from = %sender, items = items.len(), "forwarded batch");
                let result = self
                    .apply(items, Origin::Local)
                    .await
                    .map(|_| Ack {
                        leader: self.context,
                        seq: self.seq,
                    })
                    .map_err(|e| rejection(&e));
                let _ = reply.send(result);
            }
        }
    }

    fn on_broadcast(&self, msg: BroadcastMessage) {
        let sender = msg.sender();
        if sender == self.context {
            return;
        }
        match msg {
            BroadcastMessage::Committed { seq, .. } => {
                error!(
                    leader = %self.context,
                    other = %sender,
                    seq,
                    "concurrency violation: another context committed to this location"
                );
            }
            BroadcastMessage::LeaderElected { .. } => {
                error!(
                    leader = %self.context,
                    other = %sender,
                    "concurrency violation: another context claims the lease"
                );
            }
            BroadcastMessage::LeaderReleased { .. } => {}
        }
    }

    async fn flush(&mut self) -> Result<(), LoamError> {
        self.debounce.take();
        self.stores.flush().await
    }

    /// Flush, close both stores, then give up the lease
    async fn close(&mut self) -> Result<(), Error> {
        let flushed = if self.stores.needs_flush() {
            self.flush().await
        } else {
            Ok(())
        };
        let closed = self.stores.close();
        self.channel.unregister_leader(self.context);
        self.channel.unsubscribe(self.context);
        let released = self.lease.release();
        self.channel
            .publish(BroadcastMessage::LeaderReleased {
                leader: self.context,
            })
            .await;

        flushed?;
        closed?;
        released?;
        Ok(())
    }
}

fn rejection(e: &LoamError) -> Rejection {
    Rejection {
        code: e.error_code().to_string(),
        message: e.to_string(),
        fatal: e.is_fatal(),
    }
}

/// Clonable handle to the writer task
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterMessage>,
}

impl WriterHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> WriterMessage) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| Error::Closed)?;
        Ok(rx.await.map_err(|_| Error::Closed)??)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn apply(&self, items: Vec<ExecutionItem>, origin: Origin) -> Result<Vec<LogEntry>, Error> {
        self.call(|reply| WriterMessage::Apply {
            items,
            origin,
            reply,
        })
        .await
    }

    pub async fn entries(&self) -> Result<Vec<LogEntry>, Error> {
        self.call(|reply| WriterMessage::Entries { reply }).await
    }

    pub async fn stats(&self) -> Result<LogStats, Error> {
        self.call(|reply| WriterMessage::Stats { reply }).await
    }

    pub async fn export_app(&self) -> Result<Vec<u8>, Error> {
        self.call(|reply| WriterMessage::ExportApp { reply }).await
    }

    pub async fn export_log(&self) -> Result<Vec<u8>, Error> {
        self.call(|reply| WriterMessage::ExportLog { reply }).await
    }

    pub async fn flush(&self) -> Result<(), Error> {
        self.call(|reply| WriterMessage::Flush { reply }).await
    }

    /// Stop the writer, flushing and closing both stores and releasing the
    /// lease. A writer that is already gone counts as shut down.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(WriterMessage::Shutdown { reply }).await.is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

fn sink_error(e: Error) -> LoamError {
    match e {
        Error::Core(e) => e,
        other => LoamError::Internal(other.to_string()),
    }
}

#[async_trait]
impl LogSink for WriterHandle {
    async fn cursor(&self) -> Result<Option<EventId>, LoamError> {
        self.call(|reply| WriterMessage::Cursor { reply })
            .await
            .map_err(sink_error)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<LogEntry>, LoamError> {
        self.call(|reply| WriterMessage::Pending { limit, reply })
            .await
            .map_err(sink_error)
    }

    async fn contains(&self, id: EventId) -> Result<bool, LoamError> {
        self.call(|reply| WriterMessage::Contains { id, reply })
            .await
            .map_err(sink_error)
    }

    async fn apply_remote(&self, events: Vec<RemoteEvent>) -> Result<(), LoamError> {
        let items = events.into_iter().map(ExecutionItem::remote).collect();
        self.apply(items, Origin::Remote)
            .await
            .map(|_| ())
            .map_err(sink_error)
    }

    async fn confirm(&self, id: EventId) -> Result<bool, LoamError> {
        self.call(|reply| WriterMessage::Confirm { id, reply })
            .await
            .map_err(sink_error)
    }
}
