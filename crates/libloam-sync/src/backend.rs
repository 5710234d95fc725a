//! Remote sync transport contract

use async_trait::async_trait;
use libloam_core::{EventId, MutationEvent, RemoteEvent};
use tokio::sync::{broadcast, watch};

use crate::error::SyncError;

/// A remote authority reachable over some bidirectional channel
#[async_trait]
pub trait SyncBackend: Send + Sync + 'static {
    /// Up to `limit` remote events with id greater than `since`, in id order.
    /// Callers page through by passing the last id they received.
    async fn pull(
        &self,
        since: Option<EventId>,
        limit: usize,
    ) -> Result<Vec<RemoteEvent>, SyncError>;

    /// Offer one event; resolves once the remote has accepted it
    async fn push(&self, event: MutationEvent) -> Result<(), SyncError>;

    /// Stream of events the remote accepts from now on
    fn live(&self) -> broadcast::Receiver<RemoteEvent>;

    /// Observable connectivity
    fn connectivity(&self) -> watch::Receiver<bool>;
}
