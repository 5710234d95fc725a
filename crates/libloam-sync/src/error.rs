use libloam_core::LoamError;
use thiserror::Error;

/// Errors that can occur while syncing with the remote authority
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote is not reachable")]
    Disconnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("local log error: {0}")]
    Local(#[from] LoamError),
}

impl SyncError {
    /// Transport failures leave local state untouched and are retried on
    /// reconnect; local failures stop the engine
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Disconnected | SyncError::Transport(_))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Disconnected => "sync_disconnected",
            SyncError::Transport(_) => "sync_transport_failure",
            SyncError::Local(e) => e.error_code(),
        }
    }
}
