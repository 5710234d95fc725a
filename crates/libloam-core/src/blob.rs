use std::path::Path;

use tracing::debug;

use crate::error::LoamError;

/// Byte-oriented persistent key/value store backed by sled.
///
/// Used for storage backends that cannot persist SQLite natively: the
/// in-memory databases are exported and written here under a fixed key.
pub struct BlobStore {
    db: sled::Db,
    blobs: sled::Tree,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("keys", &self.blobs.len())
            .finish()
    }
}

impl BlobStore {
    pub fn open(path: &Path) -> Result<Self, LoamError> {
        let db = sled::open(path)?;
        let blobs = db.open_tree("blobs")?;
        Ok(Self { db, blobs })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LoamError> {
        Ok(self.blobs.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<(), LoamError> {
        self.blobs.insert(key.as_bytes(), bytes)?;
        debug!(key, bytes = bytes.len(), "blob written");
        Ok(())
    }

    /// Every stored key, in byte order
    pub fn keys(&self) -> Result<Vec<String>, LoamError> {
        self.blobs
            .iter()
            .keys()
            .map(|key| -> Result<String, LoamError> {
                Ok(String::from_utf8_lossy(&key?).into_owned())
            })
            .collect()
    }

    pub fn remove(&self, key: &str) -> Result<(), LoamError> {
        self.blobs.remove(key.as_bytes())?;
        Ok(())
    }

    /// Wait until every write is durable
    pub async fn flush(&self) -> Result<(), LoamError> {
        self.db.flush_async().await?;
        Ok(())
    }
}
