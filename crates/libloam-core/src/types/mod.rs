pub mod event;
pub mod ids;

pub use event::{LogEntry, MutationEvent, Origin, RemoteEvent, SyncStatus};
pub use ids::{ContextId, EventId, EventIdGenerator, OriginId};
