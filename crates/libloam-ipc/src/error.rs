//! IPC error types

use libloam_core::ContextId;
use thiserror::Error;

/// Errors from leader coordination and cross-context messaging
#[derive(Error, Debug)]
pub enum IpcError {
    /// Another context holds the storage location's lease
    #[error("Lease held by context {context} (pid {pid})")]
    LeaseHeld { context: String, pid: u32 },

    /// A write path was entered without holding the lease
    #[error("Concurrency violation: {0}")]
    ConcurrencyViolation(String),

    /// A second context tried to register as leader
    #[error("Leader conflict: {0} is already registered as leader")]
    LeaderConflict(ContextId),

    /// No leader is registered on the channel
    #[error("No leader available")]
    NoLeader,

    /// The leader refused a forwarded request
    #[error("Leader rejected request [{code}]: {message}")]
    Rejected {
        code: String,
        message: String,
        fatal: bool,
    },

    /// The other side of a channel went away
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IpcError {
    pub fn error_code(&self) -> &str {
        match self {
            IpcError::LeaseHeld { .. } => "lease_held",
            IpcError::ConcurrencyViolation(_) => "concurrency_violation",
            IpcError::LeaderConflict(_) => "concurrency_violation",
            IpcError::NoLeader => "no_leader",
            IpcError::Rejected { code, .. } => code,
            IpcError::ChannelClosed => "channel_closed",
            IpcError::Io(_) => "io_error",
            IpcError::Json(_) => "internal_error",
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            IpcError::ConcurrencyViolation(_) | IpcError::LeaderConflict(_) => true,
            IpcError::Rejected { fatal, .. } => *fatal,
            _ => false,
        }
    }
}
