use thiserror::Error;

use crate::reactive::RecomputeFailure;

/// Main error type for loam core operations
#[derive(Debug, Error)]
pub enum LoamError {
    /// Unknown mutation name, schema hash mismatch, or ill-shaped arguments.
    /// Fatal: the whole batch is rejected and never retried.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob store error: {0}")]
    Blob(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("ID parse error: {0}")]
    IdParse(#[from] crate::types::ids::IdParseError),

    /// A write was attempted without holding the storage location's lease
    #[error("concurrency violation: {0}")]
    ConcurrencyViolation(String),

    #[error("{0}")]
    Recomputation(RecomputeFailure),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LoamError {
    /// Stable error code for JSON output
    pub fn error_code(&self) -> &'static str {
        match self {
            LoamError::SchemaViolation(_) => "schema_violation",
            LoamError::Storage(_) => "storage_failure",
            LoamError::Io(_) => "io_error",
            LoamError::Blob(_) => "storage_failure",
            LoamError::Json(_) => "internal_error",
            LoamError::TomlParse(_) => "invalid_config",
            LoamError::TomlSerialize(_) => "internal_error",
            LoamError::IdParse(_) => "invalid_args",
            LoamError::ConcurrencyViolation(_) => "concurrency_violation",
            LoamError::Recomputation(_) => "recomputation_failure",
            LoamError::InvalidArgs(_) => "invalid_args",
            LoamError::NotFound(_) => "not_found",
            LoamError::Internal(_) => "internal_error",
        }
    }

    /// Whether the error must never be retried (the engine treats it as a
    /// programming or deployment error rather than a transient condition)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LoamError::SchemaViolation(_) | LoamError::ConcurrencyViolation(_)
        )
    }

    pub fn unknown_mutation(name: &str) -> Self {
        LoamError::SchemaViolation(format!("unknown mutation '{}'", name))
    }

    pub fn hash_mismatch(name: &str, expected: i64, actual: i64) -> Self {
        LoamError::SchemaViolation(format!(
            "schema hash mismatch for mutation '{}': expected {}, event carries {}",
            name, expected, actual
        ))
    }
}
