//! Runtime error types

use libloam_core::LoamError;
use libloam_ipc::IpcError;
use libloam_sync::SyncError;
use thiserror::Error;

/// Errors surfaced by a `Store`
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] LoamError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The operation needs the storage location's lease
    #[error("{0} requires the leader context")]
    NotLeader(&'static str),

    /// The store was shut down, or its writer task is gone
    #[error("store is closed")]
    Closed,
}

impl Error {
    pub fn error_code(&self) -> &str {
        match self {
            Error::Core(e) => e.error_code(),
            Error::Ipc(e) => e.error_code(),
            Error::Sync(e) => e.error_code(),
            Error::NotLeader(_) => "not_leader",
            Error::Closed => "closed",
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Core(e) => e.is_fatal(),
            Error::Ipc(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self.error_code() {
            "invalid_args" | "invalid_config" => 2,
            "not_found" => 3,
            "lease_held" | "not_leader" => 4,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
