//! The two stores of a storage location: application data and mutation log

use std::path::{Path, PathBuf};

use libloam_core::{materialize, BlobStore, EventLog, LoamError, Schema, SharedDb, SqliteDb};
use tracing::{debug, info, warn};

use crate::options::StorageBackend;

pub const LOG_FILE: &str = "mutationlog.db";
pub const LOG_KEY: &str = "mutationlog";
pub const BLOB_DIR: &str = "blobs";

/// App database name; a schema change opens a fresh database
pub fn app_name(schema_hash: i64) -> String {
    format!("app-{:016x}", schema_hash)
}

pub fn app_path(location: &Path, schema_hash: i64) -> PathBuf {
    location.join(format!("{}.db", app_name(schema_hash)))
}

pub fn log_path(location: &Path) -> PathBuf {
    location.join(LOG_FILE)
}

enum Persistence {
    Native,
    Blob { blobs: BlobStore, app_key: String },
    None,
}

/// Open handles on both stores. Only the leader holds one.
pub struct Stores {
    pub app: SharedDb,
    pub log: EventLog,
    persistence: Persistence,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let persistence = match self.persistence {
            Persistence::Native => "native",
            Persistence::Blob { .. } => "blob",
            Persistence::None => "none",
        };
        f.debug_struct("Stores")
            .field("app", &self.app.lock().label().to_string())
            .field("persistence", &persistence)
            .finish()
    }
}

impl Stores {
    /// Open both stores and make sure the application tables exist
    pub fn open(
        location: &Path,
        backend: StorageBackend,
        schema: &Schema,
    ) -> Result<Self, LoamError> {
        std::fs::create_dir_all(location)?;
        let (mut app, log, persistence) = match backend {
            StorageBackend::File => {
                let app = SqliteDb::open(&app_path(location, schema.hash()))?;
                let log = SqliteDb::open(&log_path(location))?;
                (app, log, Persistence::Native)
            }
            StorageBackend::Blob => {
                let blobs = BlobStore::open(&location.join(BLOB_DIR))?;
                let app_key = app_name(schema.hash());
                let app = restore(&blobs, &app_key)?;
                let log = restore(&blobs, LOG_KEY)?;
                (app, log, Persistence::Blob { blobs, app_key })
            }
            StorageBackend::Memory => (
                SqliteDb::open_in_memory("app")?,
                SqliteDb::open_in_memory(LOG_KEY)?,
                Persistence::None,
            ),
        };
        materialize::ensure_tables(&mut app, schema)?;
        let log = EventLog::open(log)?;
        info!(location = %location.display(), backend = ?backend, "stores opened");
        Ok(Self {
            app: SharedDb::new(app),
            log,
            persistence,
        })
    }

    /// Whether commits need an explicit flush to become durable
    pub fn needs_flush(&self) -> bool {
        matches!(self.persistence, Persistence::Blob { .. })
    }

    /// Write both stores to the blob store and wait for it to be durable
    pub async fn flush(&mut self) -> Result<(), LoamError> {
        if let Persistence::Blob { blobs, app_key } = &self.persistence {
            let app_bytes = self.app.lock().export_bytes()?;
            let log_bytes = self.log.export_bytes()?;
            blobs.put(app_key, &app_bytes)?;
            blobs.put(LOG_KEY, &log_bytes)?;
            blobs.flush().await?;
            debug!(app = app_bytes.len(), log = log_bytes.len(), "stores flushed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.app.lock().is_closed() && self.log.is_closed()
    }

    /// Close both handles and the blob store. Both handles are attempted even
    /// if one fails, and closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), LoamError> {
        let app = self.app.lock().close();
        let log = self.log.close();
        // the blob store holds a file lock until dropped
        self.persistence = Persistence::None;
        if let Err(e) = &app {
            warn!(error = %e, "closing application store failed");
        }
        if let Err(e) = &log {
            warn!(error = %e, "closing mutation log failed");
        }
        app.and(log)
    }
}

fn restore(blobs: &BlobStore, key: &str) -> Result<SqliteDb, LoamError> {
    let mut db = SqliteDb::open_in_memory(key)?;
    if let Some(bytes) = blobs.get(key)? {
        db.import_bytes(&bytes)?;
        debug!(key, bytes = bytes.len(), "restored from blob store");
    }
    Ok(db)
}
