//! loam runtime
//!
//! Opens a storage location as one execution context:
//! - The first context to take the lease leads. Its writer task owns both
//!   stores, applies every batch, broadcasts commits and runs sync.
//! - Every other context follows. It keeps an in-memory projection fed by the
//!   leader's commits and forwards its writes to the leader.
//!
//! `Store` is the entry point for both.

pub mod context;
pub mod error;
pub mod follower;
pub mod inspect;
pub mod options;
pub mod persist;
pub mod storage;
pub mod store;
pub mod writer;

pub use context::WorkerContext;
pub use error::{Error, Result};
pub use follower::FollowerStatus;
pub use options::{StorageBackend, StoreOptions};
pub use store::{LiveQuery, Store};

pub use libloam_core as core;
pub use libloam_ipc as ipc;
pub use libloam_sync as sync;
