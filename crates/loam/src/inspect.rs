//! Read-only inspection of a storage location, for tooling.
//!
//! Nothing here takes the lease. The `File` backend is read straight from
//! disk; the `Blob` backend can only be opened while no leader holds it.

use std::path::{Path, PathBuf};

use libloam_core::{
    load_engine_config, BlobStore, EngineConfig, EventLog, LogEntry, LogStats, LoamError,
    SqliteDb, SyncStatus,
};
use libloam_ipc::{LeaderLease, LeaseRecord};
use serde::Serialize;

use crate::error::Result;
use crate::options::StorageBackend;
use crate::storage::{log_path, BLOB_DIR, LOG_KEY};

/// Which store to export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTarget {
    App,
    Log,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationReport {
    pub location: PathBuf,
    pub backend: StorageBackend,
    /// Lease holder as recorded at acquisition
    pub holder: Option<LeaseRecord>,
    /// Whether the lease lock is currently held by anyone
    pub locked: bool,
    pub config: EngineConfig,
    /// Application databases present, one per schema hash
    pub app_stores: Vec<String>,
    pub log: Option<LogStats>,
}

/// Summarise a storage location
pub fn status(location: &Path, backend: StorageBackend) -> Result<LocationReport> {
    let log = match open_log(location, backend)? {
        Some(mut log) => {
            let stats = log.stats();
            log.close()?;
            Some(stats?)
        }
        None => None,
    };
    Ok(LocationReport {
        location: location.to_path_buf(),
        backend,
        holder: LeaderLease::holder(location)?,
        locked: LeaderLease::is_locked(location)?,
        config: load_engine_config(location)?,
        app_stores: app_stores(location, backend)?,
        log,
    })
}

/// Log entries in id order, optionally only those with `status`
pub fn read_log(
    location: &Path,
    backend: StorageBackend,
    status: Option<SyncStatus>,
) -> Result<Vec<LogEntry>> {
    let Some(mut log) = open_log(location, backend)? else {
        return Ok(Vec::new());
    };
    let entries = log.entries();
    log.close()?;
    Ok(entries?
        .into_iter()
        .filter(|e| status.map_or(true, |s| e.sync_status == s))
        .collect())
}

/// Portable image of one store. With several application databases present
/// the last one by name is exported.
pub fn export(location: &Path, backend: StorageBackend, target: ExportTarget) -> Result<Vec<u8>> {
    match target {
        ExportTarget::Log => {
            let mut log = open_log(location, backend)?
                .ok_or_else(|| LoamError::NotFound(format!("no mutation log in {}", location.display())))?;
            let bytes = log.export_bytes();
            log.close()?;
            Ok(bytes?)
        }
        ExportTarget::App => {
            let name = app_stores(location, backend)?
                .pop()
                .ok_or_else(|| LoamError::NotFound(format!("no application store in {}", location.display())))?;
            match backend {
                StorageBackend::File => {
                    let mut db = SqliteDb::open(&location.join(&name))?;
                    let bytes = db.export_bytes();
                    db.close()?;
                    Ok(bytes?)
                }
                _ => {
                    let blobs = BlobStore::open(&location.join(BLOB_DIR))?;
                    let key = name.trim_end_matches(".db");
                    Ok(blobs
                        .get(key)?
                        .ok_or_else(|| LoamError::NotFound(format!("blob {}", key)))?)
                }
            }
        }
    }
}

fn ensure_inspectable(backend: StorageBackend) -> Result<()> {
    if backend == StorageBackend::Memory {
        return Err(LoamError::InvalidArgs("the memory backend persists nothing".to_string()).into());
    }
    Ok(())
}

fn open_log(location: &Path, backend: StorageBackend) -> Result<Option<EventLog>> {
    ensure_inspectable(backend)?;
    if !location.is_dir() {
        return Err(LoamError::NotFound(format!("storage location {}", location.display())).into());
    }
    match backend {
        StorageBackend::File => {
            let path = log_path(location);
            if !path.exists() {
                return Ok(None);
            }
            Ok(Some(EventLog::open(SqliteDb::open(&path)?)?))
        }
        _ => {
            let dir = location.join(BLOB_DIR);
            if !dir.exists() {
                return Ok(None);
            }
            let blobs = BlobStore::open(&dir)?;
            let Some(bytes) = blobs.get(LOG_KEY)? else {
                return Ok(None);
            };
            let mut db = SqliteDb::open_in_memory(LOG_KEY)?;
            db.import_bytes(&bytes)?;
            Ok(Some(EventLog::open(db)?))
        }
    }
}

fn app_stores(location: &Path, backend: StorageBackend) -> Result<Vec<String>> {
    ensure_inspectable(backend)?;
    let mut names = Vec::new();
    match backend {
        StorageBackend::File => {
            if !location.is_dir() {
                return Ok(names);
            }
            for entry in std::fs::read_dir(location).map_err(LoamError::from)? {
                let name = entry.map_err(LoamError::from)?.file_name().to_string_lossy().into_owned();
                if name.starts_with("app-") && name.ends_with(".db") {
                    names.push(name);
                }
            }
        }
        _ => {
            let dir = location.join(BLOB_DIR);
            if !dir.exists() {
                return Ok(names);
            }
            let blobs = BlobStore::open(&dir)?;
            names.extend(
                blobs
                    .keys()?
                    .into_iter()
                    .filter(|k| k.starts_with("app-"))
                    .map(|k| format!("{}.db", k)),
            );
        }
    }
    names.sort();
    Ok(names)
}
