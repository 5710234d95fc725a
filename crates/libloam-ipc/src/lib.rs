//! Leader coordination and cross-context messaging for loam
//!
//! This crate provides:
//! - The leader lease: an exclusive OS file lock per storage location plus a
//!   JSON holder record (LeaderLease)
//! - The cross-context broadcaster: bounded fan-out of committed batches and
//!   leader-only requests (BroadcastHub, BroadcastChannel)
//! - Message types exchanged between contexts (BroadcastMessage, LeaderRequest)

pub mod broadcast;
pub mod error;
pub mod lease;
pub mod messages;

pub use broadcast::{BroadcastChannel, BroadcastHub};
pub use error::IpcError;
pub use lease::{LeaderLease, LeaseRecord, LeaseState};
pub use messages::{Ack, BroadcastMessage, CommittedItem, LeaderRequest, Rejection, Snapshot};

/// Protocol identifier, used as the broadcast channel name prefix
pub const PROTOCOL_NAME: &str = "loam";

/// Channel name shared by every context opened on the same location and schema
pub fn channel_name(location: &str, schema_hash: i64) -> String {
    format!("{}-{:016x}-{}", PROTOCOL_NAME, schema_hash, location)
}
