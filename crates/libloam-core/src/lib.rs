pub mod apply;
pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod log;
pub mod materialize;
pub mod reactive;
pub mod schema;
pub mod types;

pub use apply::{AppliedBatch, ApplyPipeline, ExecutionItem};
pub use blob::BlobStore;
pub use config::{load_engine_config, save_engine_config, EngineConfig};
pub use db::{Row, SharedDb, SqliteDb};
pub use error::LoamError;
pub use log::{EventLog, LogStats};
pub use materialize::RebuildStats;
pub use reactive::{
    GraphSnapshot, LiveQueryDef, QueryExecutor, QuerySpec, ReactivityGraph, RecomputeFailure,
    Subscription, Unavailable,
};
pub use schema::{
    raw_sql_args, ColumnDef, ColumnType, MutationDef, Schema, SchemaBuilder, TableDef,
    RAW_SQL_MUTATION,
};
pub use types::ids::current_time_ms;
pub use types::{
    ContextId, EventId, EventIdGenerator, LogEntry, MutationEvent, Origin, OriginId, RemoteEvent,
    SyncStatus,
};
