//! Storage configuration types

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::BYTES_PER_MB;

/// Resolved configuration for one open store.
///
/// Immutable for the lifetime of the store; a different configuration needs
/// the store to be closed and reopened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the LMDB environment files.
    pub path: PathBuf,
    /// Ceiling on accounted record bytes.
    pub capacity_bytes: u64,
    /// Payloads at or above this size are compressed.
    pub compression_threshold_bytes: u64,
    /// Emit store-level tracing events.
    pub enable_logging: bool,
}

impl StoreConfig {
    /// Create a config with the default threshold and logging enabled.
    pub fn new(path: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        Self {
            path: path.into(),
            capacity_bytes,
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            enable_logging: true,
        }
    }

    /// Set the compression threshold.
    pub fn with_compression_threshold(mut self, bytes: u64) -> Self {
        self.compression_threshold_bytes = bytes;
        self
    }

    /// Enable or disable store-level logging.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "capacity_bytes".to_string(),
                value: self.capacity_bytes.to_string(),
                reason: "capacity_bytes must be greater than 0".to_string(),
            });
        }

        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "path".to_string(),
                value: String::new(),
                reason: "path must be non-empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Default capacity for a module store, in megabytes.
pub const DEFAULT_CAPACITY_MB: u64 = 500;

/// Default compression threshold, in bytes.
pub const DEFAULT_COMPRESSION_THRESHOLD: u64 = 100;

/// Default directory for module stores.
pub const DEFAULT_STORAGE_DIR: &str = "storage";

/// Cache settings as consumed from the application configuration.
///
/// `db_store = false` turns the cache into a pass-through: every lookup
/// misses and every store is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub db_path: PathBuf,
    pub db_capacity_mb: u64,
    pub compression_threshold_bytes: u64,
    pub db_store: bool,
    pub db_overwrite: bool,
    pub enable_logging: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: Path::new(DEFAULT_STORAGE_DIR).join("medkit.lmdb"),
            db_capacity_mb: DEFAULT_CAPACITY_MB,
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            db_store: true,
            db_overwrite: false,
            enable_logging: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    storage: StorageSettings,
}

impl StorageSettings {
    /// Settings for a named module, stored under `storage/<module>.lmdb`.
    pub fn for_module(module_name: &str) -> Self {
        Self {
            db_path: Path::new(DEFAULT_STORAGE_DIR).join(format!("{}.lmdb", module_name)),
            ..Self::default()
        }
    }

    /// Settings with caching switched off.
    pub fn disabled() -> Self {
        Self {
            db_store: false,
            ..Self::default()
        }
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `MEDKIT_DB_PATH`: store directory (default: storage/medkit.lmdb)
    /// - `MEDKIT_DB_CAPACITY_MB`: capacity in megabytes (default: 500)
    /// - `MEDKIT_COMPRESSION_THRESHOLD`: compression threshold in bytes (default: 100)
    /// - `MEDKIT_DB_STORE`: master switch (default: true)
    /// - `MEDKIT_DB_OVERWRITE`: overwrite existing entries (default: false)
    /// - `MEDKIT_CACHE_LOGGING`: store-level logging (default: true)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from any source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            db_path: lookup("MEDKIT_DB_PATH")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            db_capacity_mb: lookup("MEDKIT_DB_CAPACITY_MB")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.db_capacity_mb),
            compression_threshold_bytes: lookup("MEDKIT_COMPRESSION_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compression_threshold_bytes),
            db_store: lookup("MEDKIT_DB_STORE")
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.db_store),
            db_overwrite: lookup("MEDKIT_DB_OVERWRITE")
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.db_overwrite),
            enable_logging: lookup("MEDKIT_CACHE_LOGGING")
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.enable_logging),
        }
    }

    /// Parse settings from the `[storage]` table of a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: SettingsFile = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        file.storage.validate()?;
        Ok(file.storage)
    }

    /// Capacity converted to bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.db_capacity_mb.saturating_mul(BYTES_PER_MB)
    }

    /// Validate the settings.
    ///
    /// Validates:
    /// - db_capacity_mb > 0
    /// - db_path is non-empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_capacity_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "db_capacity_mb".to_string(),
                value: self.db_capacity_mb.to_string(),
                reason: "db_capacity_mb must be greater than 0".to_string(),
            });
        }

        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "db_path".to_string(),
                value: String::new(),
                reason: "db_path must be a non-empty path".to_string(),
            });
        }

        Ok(())
    }

    /// Resolve into the config for the store this facade opens.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.db_path.clone(),
            capacity_bytes: self.capacity_bytes(),
            compression_threshold_bytes: self.compression_threshold_bytes,
            enable_logging: self.enable_logging,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
