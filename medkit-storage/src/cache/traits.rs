//! Record store trait and statistics types.
//!
//! This module defines the contract every storage engine behind the cache
//! facade must satisfy.

use medkit_core::{CacheError, CacheKey};

use super::record::CacheRecord;

/// What a successful `put` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// No record existed; the new one was written.
    Inserted,
    /// A record existed and `overwrite` was requested; it was replaced.
    Replaced,
    /// A record existed and `overwrite` was not requested; nothing changed.
    Kept,
}

impl PutOutcome {
    /// True when the store content changed.
    pub fn wrote(&self) -> bool {
        !matches!(self, PutOutcome::Kept)
    }
}

/// Storage engine contract for cache records.
///
/// Implementations must be safe to share across threads. Reads may run
/// concurrently with each other and with at most one write; every write is
/// atomic with respect to readers.
///
/// # Capacity
///
/// Stores are bounded. A `put` that would push the accounted size past the
/// configured capacity fails with [`CacheError::CapacityExceeded`] and leaves
/// the store unchanged. Stores never evict on their own.
pub trait RecordStore: Send + Sync {
    /// Point lookup.
    fn get(&self, key: &CacheKey) -> Result<Option<CacheRecord>, CacheError>;

    /// Insert a record, or replace an existing one when `overwrite` is set.
    fn put(&self, record: &CacheRecord, overwrite: bool) -> Result<PutOutcome, CacheError>;

    /// Remove a record. Returns whether one was removed.
    fn delete(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Accounted bytes currently stored.
    fn size(&self) -> u64;

    /// Configured capacity ceiling.
    fn capacity(&self) -> u64;

    /// Bytes still available under the ceiling.
    fn capacity_remaining(&self) -> u64 {
        self.capacity().saturating_sub(self.size())
    }

    /// Number of live records.
    fn len(&self) -> Result<u64, CacheError>;

    fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// All keys in ascending byte order.
    fn keys(&self) -> Result<Vec<CacheKey>, CacheError>;

    /// Remove every record. Returns the number removed.
    fn clear(&self) -> Result<u64, CacheError>;
}

/// Storage-level statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of live records.
    pub entries: u64,
    /// Accounted bytes.
    pub size_bytes: u64,
    /// Configured ceiling.
    pub capacity_bytes: u64,
    /// Size of the memory map backing the store (0 for in-memory stores).
    pub map_size_bytes: u64,
}

/// Facade-level statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, including skipped lookups.
    pub misses: u64,
    /// Number of writes that changed the store.
    pub stores: u64,
    /// Number of storage errors absorbed by the facade.
    pub errors: u64,
    /// Number of entries currently in the store.
    pub entry_count: u64,
    /// Accounted bytes currently in the store.
    pub size_bytes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
