//! medkit Core - Cache Types
//!
//! Pure data structures shared by the cache crates. No I/O lives here:
//! key derivation, the error taxonomy, and the storage settings surface.

pub mod config;
pub mod error;
pub mod identity;

pub use config::{StorageSettings, StoreConfig};
pub use error::{CacheError, ConfigError, MedkitError, MedkitResult};
pub use identity::{canonical_bytes, derive_cache_key, CacheKey, KEY_DOMAIN};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Bytes per megabyte as used by the capacity settings.
pub const BYTES_PER_MB: u64 = 1024 * 1024;
