//! In-process remote authority

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use libloam_core::{EventId, MutationEvent, RemoteEvent};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::backend::SyncBackend;
use crate::error::SyncError;

const LIVE_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct State {
    events: BTreeMap<EventId, RemoteEvent>,
    accepted_pushes: u64,
    failing_pushes: usize,
}

/// Remote authority kept in memory. Clones share the same remote.
///
/// Events are ordered by id. Accepted pushes are fanned out to every live
/// subscriber, the pusher included. Going offline makes every call fail with
/// `Disconnected` until it is switched back on.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    live: broadcast::Sender<RemoteEvent>,
    connected: Arc<watch::Sender<bool>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        let (connected, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            live,
            connected: Arc::new(connected),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
        debug!(connected, "memory remote connectivity changed");
    }

    /// Make the next `n` pushes fail with a transport error
    pub fn fail_next_pushes(&self, n: usize) {
        self.state().failing_pushes = n;
    }

    /// Accept an event authored elsewhere. Live subscribers see it only
    /// while connected.
    pub fn insert_remote(&self, event: impl Into<RemoteEvent>) -> bool {
        let event = event.into();
        let inserted = self.accept(event.clone());
        if inserted && self.is_connected() {
            let _ = self.live.send(event);
        }
        inserted
    }

    fn accept(&self, event: RemoteEvent) -> bool {
        let mut state = self.state();
        if state.events.contains_key(event.id()) {
            return false;
        }
        state.events.insert(*event.id(), event);
        true
    }

    pub fn events(&self) -> Vec<MutationEvent> {
        self.state()
            .events
            .values()
            .map(|remote| remote.event.clone())
            .collect()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.state().events.contains_key(id)
    }

    pub fn accepted_pushes(&self) -> u64 {
        self.state().accepted_pushes
    }

    fn check_connected(&self) -> Result<(), SyncError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::Disconnected)
        }
    }
}

#[async_trait]
impl SyncBackend for MemoryBackend {
    async fn pull(
        &self,
        since: Option<EventId>,
        limit: usize,
    ) -> Result<Vec<RemoteEvent>, SyncError> {
        self.check_connected()?;
        let state = self.state();
        let lower = match since {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(state
            .events
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn push(&self, event: MutationEvent) -> Result<(), SyncError> {
        self.check_connected()?;
        {
            let mut state = self.state();
            if state.failing_pushes > 0 {
                state.failing_pushes -= 1;
                return Err(SyncError::Transport("push rejected by transport".into()));
            }
            state.accepted_pushes += 1;
        }
        let event = RemoteEvent::new(event);
        if self.accept(event.clone()) {
            let _ = self.live.send(event);
        }
        Ok(())
    }

    fn live(&self) -> broadcast::Receiver<RemoteEvent> {
        self.live.subscribe()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}
