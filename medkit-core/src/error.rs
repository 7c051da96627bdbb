//! Error types for medkit cache operations

use thiserror::Error;

/// Cache layer errors.
///
/// Only `InvalidQuery`, `CapacityExceeded` and `Serialization` are meant to
/// reach callers of the cache facade; the remaining variants are absorbed by
/// degrading to a miss or a no-op.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },

    #[error("Invalid cache key {value:?}: {reason}")]
    InvalidKey { value: String, reason: String },

    #[error("Corrupt record: {reason}")]
    CorruptRecord { reason: String },

    #[error("Capacity exceeded: record needs {requested} bytes, {remaining} bytes remaining")]
    CapacityExceeded { requested: u64, remaining: u64 },

    #[error("Storage unavailable at {path}: {reason}")]
    StorageUnavailable { path: String, reason: String },

    #[error("Transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("Transfer failed: {reason}")]
    Transfer { reason: String },

    #[error("Payload serialization failed: {reason}")]
    Serialization { reason: String },
}

impl CacheError {
    /// True for errors the facade hands back to `store` callers.
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            CacheError::InvalidQuery { .. }
                | CacheError::CapacityExceeded { .. }
                | CacheError::Serialization { .. }
        )
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io {
            reason: e.to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all medkit cache errors.
#[derive(Debug, Clone, Error)]
pub enum MedkitError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for medkit operations.
pub type MedkitResult<T> = Result<T, MedkitError>;

// =============================================================================
// TESTS
// =============================================================================
