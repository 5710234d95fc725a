//! Cursor-based sync between a loam mutation log and a remote authority
//!
//! - `SyncBackend`: the remote transport contract (paged pull, push, live
//!   stream, connectivity)
//! - `MemoryBackend`: an in-process remote authority
//! - `SyncEngine`: the background task reconciling a `LogSink` with a backend

pub mod backend;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod memory;

pub use backend::SyncBackend;
pub use cursor::SyncCursor;
pub use engine::{LogSink, PullResult, SyncEngine, SyncHandle, SyncOptions, SyncProgress};
pub use error::SyncError;
pub use memory::MemoryBackend;
