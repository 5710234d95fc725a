use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LoamError;

/// File name of the engine configuration inside a storage location
pub const CONFIG_FILE: &str = "loam.toml";

/// Engine tuning, stored in `<location>/loam.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Max events per apply transaction
    pub batch_size: usize,
    /// Quiet period before a blob-store flush
    pub persist_debounce_ms: u64,
    /// How long an unsubscribed reactive node is kept for reuse
    pub graph_retention_ms: u64,
    /// Bounded queue size per broadcast subscriber
    pub broadcast_capacity: usize,
    /// Bounded writer request queue
    pub writer_queue: usize,
    /// Events per remote pull page and per push scan
    pub pull_page_size: usize,
    /// Back-off after a transport failure while still connected
    pub push_retry_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            persist_debounce_ms: 1000,
            graph_retention_ms: 1000,
            broadcast_capacity: 256,
            writer_queue: 64,
            pull_page_size: 100,
            push_retry_ms: 500,
        }
    }
}

impl EngineConfig {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn graph_retention(&self) -> Duration {
        Duration::from_millis(self.graph_retention_ms)
    }

    pub fn push_retry(&self) -> Duration {
        Duration::from_millis(self.push_retry_ms)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), LoamError> {
        if self.batch_size == 0 {
            return Err(LoamError::InvalidArgs("batch_size must be at least 1".to_string()));
        }
        if self.broadcast_capacity == 0 || self.writer_queue == 0 {
            return Err(LoamError::InvalidArgs("queue sizes must be at least 1".to_string()));
        }
        if self.pull_page_size == 0 {
            return Err(LoamError::InvalidArgs("pull_page_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Load the engine config of a storage location; defaults if the file is absent
pub fn load_engine_config(dir: &Path) -> Result<EngineConfig, LoamError> {
    let path = config_path(dir);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let content = std::fs::read_to_string(&path)?;
    let config: EngineConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

pub fn save_engine_config(dir: &Path, config: &EngineConfig) -> Result<(), LoamError> {
    std::fs::create_dir_all(dir)?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(config_path(dir), content)?;
    Ok(())
}
