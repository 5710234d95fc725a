//! Leader lease
//!
//! Exclusive write access to a storage location. The arbiter is an OS file
//! lock on `<location>/leader.lock`, released by the kernel when the owning
//! process dies or the handle is dropped. A JSON record next to it names the
//! current holder for inspection.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libloam_core::{current_time_ms, ContextId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::IpcError;

pub const LOCK_FILE: &str = "leader.lock";
pub const RECORD_FILE: &str = "leader.json";

/// Holder of a storage location's lease, stored at `<location>/leader.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub context: ContextId,
    pub pid: u32,
    /// When the lease was acquired (Unix timestamp in ms)
    pub acquired_ts: u64,
}

impl LeaseRecord {
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            pid: std::process::id(),
            acquired_ts: current_time_ms(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(RECORD_FILE)
    }

    pub fn read(dir: &Path) -> Result<Option<Self>, IpcError> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn write(&self, dir: &Path) -> Result<(), IpcError> {
        fs::write(Self::path(dir), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Remove the record if it still names `context`
    pub fn remove_if_owned(dir: &Path, context: ContextId) -> Result<(), IpcError> {
        if let Some(record) = Self::read(dir)? {
            if record.context == context {
                fs::remove_file(Self::path(dir))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaseState {
    Unclaimed,
    HasLock,
    Released,
}

/// One context's claim on a storage location
#[derive(Debug)]
pub struct LeaderLease {
    dir: PathBuf,
    context: ContextId,
    /// flock released on drop
    file: Option<File>,
    state: LeaseState,
}

impl LeaderLease {
    pub fn new(dir: &Path, context: ContextId) -> Self {
        Self {
            dir: dir.to_path_buf(),
            context,
            file: None,
            state: LeaseState::Unclaimed,
        }
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn is_held(&self) -> bool {
        self.state == LeaseState::HasLock
    }

    /// Try once to take the lease. Returns false if another context holds it.
    pub fn try_acquire(&mut self) -> Result<bool, IpcError> {
        match self.state {
            LeaseState::HasLock => return Ok(true),
            LeaseState::Released => {
                return Err(IpcError::ConcurrencyViolation(
                    "a released lease cannot be re-acquired".to_string(),
                ))
            }
            LeaseState::Unclaimed => {}
        }

        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.dir.join(LOCK_FILE))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!(context = %self.context, dir = %self.dir.display(), "lease busy");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        LeaseRecord::new(self.context).write(&self.dir)?;
        self.file = Some(file);
        self.state = LeaseState::HasLock;
        info!(context = %self.context, dir = %self.dir.display(), "lease acquired");
        Ok(true)
    }

    /// Fail unless this context currently holds the lease
    pub fn ensure_held(&self) -> Result<(), IpcError> {
        if self.is_held() {
            Ok(())
        } else {
            Err(IpcError::ConcurrencyViolation(format!(
                "context {} attempted a write without the lease ({:?})",
                self.context, self.state
            )))
        }
    }

    /// Give up the lease. Releasing twice is a no-op.
    pub fn release(&mut self) -> Result<(), IpcError> {
        if self.state != LeaseState::HasLock {
            self.state = LeaseState::Released;
            return Ok(());
        }
        self.state = LeaseState::Released;
        let record = LeaseRecord::remove_if_owned(&self.dir, self.context);
        if let Some(file) = self.file.take() {
            FileExt::unlock(&file)?;
        }
        record?;
        info!(context = %self.context, dir = %self.dir.display(), "lease released");
        Ok(())
    }

    /// Current holder recorded for a storage location, if any
    pub fn holder(dir: &Path) -> Result<Option<LeaseRecord>, IpcError> {
        LeaseRecord::read(dir)
    }

    /// Whether some context currently holds the OS lock on `dir`
    pub fn is_locked(dir: &Path) -> Result<bool, IpcError> {
        let path = dir.join(LOCK_FILE);
        if !path.exists() {
            return Ok(false);
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                FileExt::unlock(&file)?;
                Ok(false)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LeaderLease {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(context = %self.context, error = %e, "failed to release lease on drop");
        }
    }
}
