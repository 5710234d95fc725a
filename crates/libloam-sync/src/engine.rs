//! Sync Engine
//!
//! One background task per leader context. It waits for connectivity, pulls
//! everything past the cursor, pushes every pending entry, and then follows
//! the remote's live stream while pushing new local commits as they land.
//! Transport failures pause the session and are retried; nothing queued is
//! discarded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libloam_core::{EngineConfig, EventId, LoamError, LogEntry, RemoteEvent};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::SyncBackend;
use crate::cursor::SyncCursor;
use crate::error::SyncError;

/// The local side of sync: the leader's mutation log
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    /// Highest synced id in the log
    async fn cursor(&self) -> Result<Option<EventId>, LoamError>;

    /// Oldest `limit` pending entries, in id order
    async fn pending(&self, limit: usize) -> Result<Vec<LogEntry>, LoamError>;

    async fn contains(&self, id: EventId) -> Result<bool, LoamError>;

    /// Apply remote events as already confirmed
    async fn apply_remote(&self, events: Vec<RemoteEvent>) -> Result<(), LoamError>;

    /// Mark a pushed entry as confirmed
    async fn confirm(&self, id: EventId) -> Result<bool, LoamError>;
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub page_size: usize,
    pub push_retry: Duration,
}

impl SyncOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            page_size: config.pull_page_size.max(1),
            push_retry: config.push_retry(),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Observable engine state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub connected: bool,
    pub initial_pull_done: bool,
    pub cursor: Option<EventId>,
    pub pulled: u64,
    pub pushed: u64,
    pub failed: u64,
}

/// Result of one catch-up pull
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PullResult {
    /// Remote events applied to the log
    pub events_pulled: usize,
    /// Pulled events that were our own, now confirmed
    pub confirmed: usize,
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Handle to a running sync task
#[derive(Debug)]
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    progress: watch::Receiver<SyncProgress>,
    wake: Arc<Notify>,
    task: JoinHandle<Result<(), SyncError>>,
}

impl SyncHandle {
    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.clone()
    }

    /// Tell the engine new pending entries were committed
    pub fn notify_pending(&self) {
        self.wake.notify_one();
    }

    /// Stop the engine, cancelling any in-flight pull or push
    pub async fn shutdown(self) -> Result<(), SyncError> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(SyncError::Local(LoamError::Internal(format!(
                "sync task panicked: {}",
                e
            )))),
        }
    }
}

pub struct SyncEngine {
    backend: Arc<dyn SyncBackend>,
    sink: Arc<dyn LogSink>,
    options: SyncOptions,
    cursor: SyncCursor,
    progress: watch::Sender<SyncProgress>,
    wake: Arc<Notify>,
}

impl SyncEngine {
    /// Start the engine on the current tokio runtime
    pub fn spawn(
        backend: Arc<dyn SyncBackend>,
        sink: Arc<dyn LogSink>,
        options: SyncOptions,
    ) -> SyncHandle {
        Self::spawn_with_waker(backend, sink, options, Arc::new(Notify::new()))
    }

    /// Like `spawn`, with the pending-entry wake-up shared with the caller
    pub fn spawn_with_waker(
        backend: Arc<dyn SyncBackend>,
        sink: Arc<dyn LogSink>,
        options: SyncOptions,
        wake: Arc<Notify>,
    ) -> SyncHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(SyncProgress::default());
        let engine = SyncEngine {
            backend,
            sink,
            options,
            cursor: SyncCursor::default(),
            progress: progress_tx,
            wake: wake.clone(),
        };
        let task = tokio::spawn(engine.run(shutdown_rx));
        SyncHandle {
            shutdown: shutdown_tx,
            progress: progress_rx,
            wake,
            task,
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
        let mut connectivity = self.backend.connectivity();
        self.cursor = SyncCursor::new(self.sink.cursor().await?);
        self.publish_cursor();

        loop {
            while !*connectivity.borrow_and_update() {
                self.progress.send_modify(|p| p.connected = false);
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            info!("sync transport dropped, stopping");
                            return Ok(());
                        }
                    }
                }
            }
            self.progress.send_modify(|p| p.connected = true);
            info!(cursor = ?self.cursor.get(), "sync connected");

            match self.session(&mut connectivity, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Disconnected) => {
                    info!(cursor = ?self.cursor.get(), "sync disconnected");
                    self.progress.send_modify(|p| p.connected = false);
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "sync transport failure, will retry");
                    self.progress.send_modify(|p| p.failed += 1);
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = tokio::time::sleep(self.options.push_retry) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "sync stopped on local failure");
                    return Err(e);
                }
            }
        }
    }

    async fn session(
        &mut self,
        connectivity: &mut watch::Receiver<bool>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, SyncError> {
        // subscribe first so nothing accepted during catch-up is missed
        let mut live = self.backend.live();

        let pulled = self.catch_up().await?;
        self.progress.send_modify(|p| p.initial_pull_done = true);
        debug!(
            pulled = pulled.events_pulled,
            confirmed = pulled.confirmed,
            "catch-up pull done"
        );
        self.push_pending().await?;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),
                changed = connectivity.changed() => {
                    if changed.is_err() || !*connectivity.borrow_and_update() {
                        return Ok(SessionEnd::Disconnected);
                    }
                }
                received = live.recv() => match received {
                    Ok(event) => self.receive_live(event).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "live stream lagged, pulling from cursor");
                        self.catch_up().await?;
                    }
                    Err(RecvError::Closed) => {
                        return Err(SyncError::Transport("live stream closed".into()));
                    }
                },
                _ = self.wake.notified() => {
                    self.push_pending().await?;
                }
            }
        }
    }

    /// Pull every remote event past the cursor, page by page
    async fn catch_up(&mut self) -> Result<PullResult, SyncError> {
        let mut result = PullResult::default();
        loop {
            let page = self
                .backend
                .pull(self.cursor.get(), self.options.page_size)
                .await?;
            let page_len = page.len();
            let Some(last) = page.last().map(|e| *e.id()) else {
                break;
            };

            let mut fresh = Vec::with_capacity(page_len);
            for event in page {
                let id = *event.id();
                if self.cursor.covers(&id) {
                    continue;
                }
                if self.sink.contains(id).await? {
                    self.sink.confirm(id).await?;
                    result.confirmed += 1;
                } else {
                    fresh.push(event);
                }
            }
            let applied = fresh.len();
            if !fresh.is_empty() {
                self.sink.apply_remote(fresh).await?;
            }
            result.events_pulled += applied;
            self.cursor.advance(last);
            self.progress.send_modify(|p| p.pulled += applied as u64);
            self.publish_cursor();

            if page_len < self.options.page_size {
                break;
            }
        }
        Ok(result)
    }

    /// Push pending entries oldest first until none are left
    async fn push_pending(&mut self) -> Result<usize, SyncError> {
        let mut pushed = 0;
        loop {
            let batch = self.sink.pending(self.options.page_size).await?;
            if batch.is_empty() {
                break;
            }
            let full = batch.len() == self.options.page_size;
            for entry in batch {
                let id = entry.event.id;
                self.backend.push(entry.event).await?;
                self.sink.confirm(id).await?;
                self.cursor.advance(id);
                pushed += 1;
                self.progress.send_modify(|p| p.pushed += 1);
                self.publish_cursor();
            }
            if !full {
                break;
            }
        }
        if pushed > 0 {
            debug!(pushed, cursor = ?self.cursor.get(), "pushed pending events");
        }
        Ok(pushed)
    }

    async fn receive_live(&mut self, event: RemoteEvent) -> Result<(), SyncError> {
        let id = *event.id();
        if self.cursor.covers(&id) {
            debug!(id = %id, "live event behind cursor, dropped");
            return Ok(());
        }
        if self.sink.contains(id).await? {
            self.sink.confirm(id).await?;
        } else {
            self.sink.apply_remote(vec![event]).await?;
            self.progress.send_modify(|p| p.pulled += 1);
        }
        self.cursor.advance(id);
        self.publish_cursor();
        Ok(())
    }

    fn publish_cursor(&self) {
        let cursor = self.cursor.get();
        self.progress.send_modify(|p| p.cursor = cursor);
    }
}
