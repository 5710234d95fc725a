use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloam_core::EngineConfig;
use libloam_ipc::BroadcastHub;
use libloam_sync::SyncBackend;
use serde::{Deserialize, Serialize};

/// How the two stores of a location are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite files under the location, durable on commit
    #[default]
    File,
    /// In-memory SQLite exported to a blob store after a quiet period
    Blob,
    /// Nothing is persisted
    Memory,
}

/// Everything needed to open a `Store`
#[derive(Clone)]
pub struct StoreOptions {
    /// Storage location directory. Holds the lease and, depending on the
    /// backend, the databases.
    pub location: PathBuf,
    pub backend: StorageBackend,
    /// Explicit engine tuning; when absent `<location>/loam.toml` is read
    pub config: Option<EngineConfig>,
    /// Rebuild the application store from the log on open
    pub recreate: bool,
    /// Broadcast registry shared by sibling contexts
    pub hub: BroadcastHub,
    /// Remote authority to sync with
    pub sync: Option<Arc<dyn SyncBackend>>,
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("location", &self.location)
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("recreate", &self.recreate)
            .field("sync", &self.sync.is_some())
            .finish()
    }
}

impl StoreOptions {
    pub fn new(location: &Path) -> Self {
        Self {
            location: location.to_path_buf(),
            backend: StorageBackend::default(),
            config: None,
            recreate: false,
            hub: BroadcastHub::new(),
            sync: None,
        }
    }

    pub fn backend(mut self, backend: StorageBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn recreate(mut self, recreate: bool) -> Self {
        self.recreate = recreate;
        self
    }

    pub fn hub(mut self, hub: BroadcastHub) -> Self {
        self.hub = hub;
        self
    }

    pub fn sync(mut self, backend: Arc<dyn SyncBackend>) -> Self {
        self.sync = Some(backend);
        self
    }
}
