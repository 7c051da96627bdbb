//! In-memory record store for tests and ephemeral caches.
//!
//! Same contract as the LMDB store, capacity accounting included, but nothing
//! survives the process.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use medkit_core::{CacheError, CacheKey};

use super::record::CacheRecord;
use super::traits::{PutOutcome, RecordStore, StoreStats};

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<CacheKey, CacheRecord>,
    used: u64,
}

/// In-memory [`RecordStore`] backed by a `BTreeMap` behind an `RwLock`.
///
/// Clones share the same map.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    capacity_bytes: u64,
}

impl MemoryStore {
    /// Create an empty store with the given ceiling.
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            capacity_bytes,
        }
    }

    /// Storage statistics.
    pub fn stats(&self) -> Result<StoreStats, CacheError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(StoreStats {
            entries: inner.records.len() as u64,
            size_bytes: inner.used,
            capacity_bytes: self.capacity_bytes,
            map_size_bytes: 0,
        })
    }
}

fn poisoned() -> CacheError {
    CacheError::Transaction {
        reason: "lock poisoned: records".to_string(),
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheRecord>, CacheError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.records.get(key).cloned())
    }

    fn put(&self, record: &CacheRecord, overwrite: bool) -> Result<PutOutcome, CacheError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;

        let existing = inner.records.get(&record.key).map(CacheRecord::accounted_size);
        if existing.is_some() && !overwrite {
            return Ok(PutOutcome::Kept);
        }

        let requested = record.accounted_size();
        let base = inner.used.saturating_sub(existing.unwrap_or(0));
        let remaining = self.capacity_bytes.saturating_sub(base);
        if requested > remaining {
            return Err(CacheError::CapacityExceeded {
                requested,
                remaining,
            });
        }

        inner.records.insert(record.key, record.clone());
        inner.used = base + requested;

        Ok(if existing.is_some() {
            PutOutcome::Replaced
        } else {
            PutOutcome::Inserted
        })
    }

    fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        match inner.records.remove(key) {
            Some(removed) => {
                inner.used = inner.used.saturating_sub(removed.accounted_size());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn size(&self) -> u64 {
        self.inner.read().map(|inner| inner.used).unwrap_or(0)
    }

    fn capacity(&self) -> u64 {
        self.capacity_bytes
    }

    fn len(&self) -> Result<u64, CacheError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.records.len() as u64)
    }

    fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.records.keys().copied().collect())
    }

    fn clear(&self) -> Result<u64, CacheError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let count = inner.records.len() as u64;
        inner.records.clear();
        inner.used = 0;
        Ok(count)
    }
}
