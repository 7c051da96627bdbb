//! LMDB-backed record store with a capacity ceiling.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped,
//! copy-on-write key-value store for cached generation results.
//!
//! # Layout
//!
//! The environment holds two named databases:
//! - `records`: 32-byte cache key -> framed [`CacheRecord`]
//! - `meta`: bookkeeping, currently the accounted byte total
//!
//! The accounted total is updated in the same write transaction as the record
//! it describes, so a crash can never leave the two out of step.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions with MVCC:
//! - Read transactions for `get`, `len`, `keys` never block or get blocked
//! - Write transactions for `put`, `delete`, `clear` are serialized by LMDB,
//!   across threads and across processes (via `lock.mdb`)
//!
//! # Handles
//!
//! heed keeps one environment per path per process. Opening a path that is
//! already open hands back the same environment, so every handle on a path
//! shares its memory map. A second open whose capacity implies a different map
//! size is rejected with `StorageUnavailable` rather than silently inheriting
//! the first one's.
//!
//! # Capacity
//!
//! The ceiling applies to accounted bytes (key + framed value). LMDB needs
//! more than that on disk (page headers, overflow pages, half-full B-tree
//! pages, the free list), so the map is sized at [`MAP_OVERHEAD_FACTOR`] times
//! the ceiling. Filling the accounted ceiling never runs out of map.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env, EnvClosingEvent, EnvOpenOptions, MdbError, RoTxn, RwTxn};
use medkit_core::identity::KEY_LEN;
use medkit_core::{CacheError, CacheKey, StoreConfig};
use tracing::{debug, info, warn};

use super::record::CacheRecord;
use super::traits::{PutOutcome, RecordStore, StoreStats};

/// LMDB map sizes are rounded up to this granule (a multiple of every
/// supported OS page size).
pub const MAP_GRANULE: u64 = 1024 * 1024;

/// Map size as a multiple of the accounted capacity.
pub const MAP_OVERHEAD_FACTOR: u64 = 3;

const RECORDS_DB: &str = "records";
const META_DB: &str = "meta";
const USED_BYTES_KEY: &[u8] = b"used_bytes";

/// LMDB-backed record store.
///
/// # Example
///
/// ```ignore
/// use medkit_core::{derive_cache_key, StoreConfig};
/// use medkit_storage::cache::{CacheRecord, LmdbStore, RecordStore};
///
/// let store = LmdbStore::open(StoreConfig::new("/tmp/cache", 5 * 1024 * 1024))?;
/// let key = derive_cache_key("diabetes-query")?;
/// store.put(&CacheRecord::encode(key, b"{...}", 100), false)?;
/// let record = store.get(&key)?;
/// ```
#[derive(Clone, Debug)]
pub struct LmdbStore {
    env: Env,
    records: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
    config: StoreConfig,
    /// Last accounted total observed by this handle.
    last_used: Arc<AtomicU64>,
}

impl LmdbStore {
    /// Open or create the store described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::StorageUnavailable`] if:
    /// - The configuration is invalid
    /// - The directory cannot be created
    /// - The LMDB environment or its databases cannot be opened
    pub fn open(config: StoreConfig) -> Result<Self, CacheError> {
        let path = config.path.display().to_string();
        let unavailable = |reason: String| CacheError::StorageUnavailable {
            path: path.clone(),
            reason,
        };

        config.validate().map_err(|e| unavailable(e.to_string()))?;

        // Ensure directory exists
        std::fs::create_dir_all(&config.path).map_err(|e| unavailable(e.to_string()))?;

        let map_size = map_size_for(config.capacity_bytes).map_err(unavailable)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .open(&config.path)
        }
        .map_err(|e| unavailable(e.to_string()))?;

        // An environment already open in this process keeps its first map size.
        let actual_map_size = env.info().map_size;
        if actual_map_size != map_size {
            return Err(unavailable(format!(
                "environment is open with a {} byte map, capacity {} needs {}",
                actual_map_size, config.capacity_bytes, map_size
            )));
        }

        let mut wtxn = env.write_txn().map_err(|e| unavailable(e.to_string()))?;

        let records: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(RECORDS_DB))
            .map_err(|e| unavailable(e.to_string()))?;
        let meta: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(META_DB))
            .map_err(|e| unavailable(e.to_string()))?;

        let store = Self {
            env: env.clone(),
            records,
            meta,
            config,
            last_used: Arc::new(AtomicU64::new(0)),
        };

        // Stores written without bookkeeping get it rebuilt once.
        let used = match store.read_used(&wtxn)? {
            Some(used) => used,
            None => {
                let used = store.recompute_used(&wtxn)?;
                store.write_used(&mut wtxn, used)?;
                used
            }
        };

        wtxn.commit().map_err(|e| unavailable(e.to_string()))?;
        store.last_used.store(used, Ordering::Relaxed);

        if store.config.enable_logging {
            info!(
                path = %store.config.path.display(),
                capacity_bytes = store.config.capacity_bytes,
                map_size_bytes = map_size,
                used_bytes = used,
                "LMDB cache store opened"
            );
        }

        Ok(store)
    }

    /// The configuration this store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Directory holding the environment files.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Storage statistics.
    pub fn stats(&self) -> Result<StoreStats, CacheError> {
        let entries = self.len()?;
        Ok(StoreStats {
            entries,
            size_bytes: self.size(),
            capacity_bytes: self.config.capacity_bytes,
            map_size_bytes: self.env.info().map_size as u64,
        })
    }

    /// Release this handle's reference to the environment.
    ///
    /// The environment is shared by every clone and every other handle opened
    /// on the same path in this process; it is unmapped only once all of them
    /// are gone. Waiting on the returned event blocks until then, so use
    /// `wait_timeout` when other handles may be alive. Until the event fires,
    /// opening the path again fails with `StorageUnavailable`.
    pub fn close(self) -> EnvClosingEvent {
        if self.config.enable_logging {
            debug!(path = %self.config.path.display(), "Closing LMDB cache store");
        }
        self.env.prepare_for_closing()
    }

    fn read_used(&self, txn: &RoTxn<'_>) -> Result<Option<u64>, CacheError> {
        let Some(bytes) = self.meta.get(txn, USED_BYTES_KEY).map_err(txn_error)? else {
            return Ok(None);
        };
        let arr: [u8; 8] = bytes.try_into().map_err(|_| CacheError::CorruptRecord {
            reason: "malformed used_bytes counter".to_string(),
        })?;
        Ok(Some(u64::from_le_bytes(arr)))
    }

    fn write_used(&self, wtxn: &mut RwTxn<'_>, used: u64) -> Result<(), CacheError> {
        self.meta
            .put(wtxn, USED_BYTES_KEY, &used.to_le_bytes())
            .map_err(txn_error)
    }

    fn recompute_used(&self, txn: &RoTxn<'_>) -> Result<u64, CacheError> {
        let mut used = 0u64;
        for result in self.records.iter(txn).map_err(txn_error)? {
            let (key, value) = result.map_err(txn_error)?;
            used += (key.len() + value.len()) as u64;
        }
        Ok(used)
    }

    /// Existing accounted size for `key` inside a write transaction.
    fn existing_size(&self, wtxn: &RwTxn<'_>, key: &CacheKey) -> Result<Option<u64>, CacheError> {
        Ok(self
            .records
            .get(wtxn, key.as_bytes())
            .map_err(txn_error)?
            .map(|value| (KEY_LEN + value.len()) as u64))
    }
}

impl RecordStore for LmdbStore {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheRecord>, CacheError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;

        match self.records.get(&rtxn, key.as_bytes()).map_err(txn_error)? {
            Some(bytes) => CacheRecord::from_bytes(*key, bytes).map(Some),
            None => Ok(None),
        }
    }

    fn put(&self, record: &CacheRecord, overwrite: bool) -> Result<PutOutcome, CacheError> {
        let value = record.to_bytes();
        let requested = record.accounted_size();

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;

        let existing = self.existing_size(&wtxn, &record.key)?;
        if existing.is_some() && !overwrite {
            // Dropping the transaction aborts it.
            if self.config.enable_logging {
                debug!(key = %record.key.short(), "Record exists, keeping it");
            }
            return Ok(PutOutcome::Kept);
        }

        let used = self.read_used(&wtxn)?.unwrap_or(0);
        let base = used.saturating_sub(existing.unwrap_or(0));
        let remaining = self.config.capacity_bytes.saturating_sub(base);
        if requested > remaining {
            return Err(CacheError::CapacityExceeded {
                requested,
                remaining,
            });
        }

        let full = |e: heed::Error| write_error(e, requested);
        self.records
            .put(&mut wtxn, record.key.as_bytes(), &value)
            .map_err(full)?;
        self.write_used(&mut wtxn, base + requested)?;
        wtxn.commit().map_err(full)?;

        self.last_used.store(base + requested, Ordering::Relaxed);

        let outcome = if existing.is_some() {
            PutOutcome::Replaced
        } else {
            PutOutcome::Inserted
        };

        if self.config.enable_logging {
            debug!(
                key = %record.key.short(),
                stored_bytes = record.stored_size,
                original_bytes = record.original_size,
                compressed = record.is_compressed,
                ?outcome,
                "Stored cache record"
            );
        }

        Ok(outcome)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;

        let Some(size) = self.existing_size(&wtxn, key)? else {
            return Ok(false);
        };

        self.records
            .delete(&mut wtxn, key.as_bytes())
            .map_err(txn_error)?;
        let used = self.read_used(&wtxn)?.unwrap_or(0).saturating_sub(size);
        self.write_used(&mut wtxn, used)?;
        wtxn.commit().map_err(txn_error)?;

        self.last_used.store(used, Ordering::Relaxed);

        if self.config.enable_logging {
            debug!(key = %key.short(), "Deleted cache record");
        }

        Ok(true)
    }

    fn size(&self) -> u64 {
        let read = self
            .env
            .read_txn()
            .map_err(txn_error)
            .and_then(|rtxn| self.read_used(&rtxn));

        match read {
            Ok(used) => {
                let used = used.unwrap_or(0);
                self.last_used.store(used, Ordering::Relaxed);
                used
            }
            Err(e) => {
                if self.config.enable_logging {
                    warn!(error = %e, "Failed to read accounted size, using last known value");
                }
                self.last_used.load(Ordering::Relaxed)
            }
        }
    }

    fn capacity(&self) -> u64 {
        self.config.capacity_bytes
    }

    fn len(&self) -> Result<u64, CacheError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        self.records.len(&rtxn).map_err(txn_error)
    }

    fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut keys = Vec::new();
        for result in self.records.iter(&rtxn).map_err(txn_error)? {
            let (key, _) = result.map_err(txn_error)?;
            keys.push(CacheKey::from_slice(key)?);
        }
        Ok(keys)
    }

    fn clear(&self) -> Result<u64, CacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let count = self.records.len(&wtxn).map_err(txn_error)?;
        self.records.clear(&mut wtxn).map_err(txn_error)?;
        self.write_used(&mut wtxn, 0)?;
        wtxn.commit().map_err(txn_error)?;

        self.last_used.store(0, Ordering::Relaxed);

        if self.config.enable_logging {
            info!(removed = count, "Cleared cache store");
        }

        Ok(count)
    }
}

/// Memory map size for a capacity: [`MAP_OVERHEAD_FACTOR`] times the ceiling,
/// rounded up to the map granule, plus one granule for LMDB's meta pages.
pub fn map_size_for(capacity_bytes: u64) -> Result<usize, String> {
    let too_large = || format!("capacity {} bytes is too large", capacity_bytes);
    let granules = capacity_bytes
        .checked_mul(MAP_OVERHEAD_FACTOR)
        .ok_or_else(too_large)?
        .div_ceil(MAP_GRANULE)
        .max(1)
        + 1;
    let bytes = granules.checked_mul(MAP_GRANULE).ok_or_else(too_large)?;
    usize::try_from(bytes).map_err(|_| format!("map size {} exceeds address space", bytes))
}

fn txn_error(e: heed::Error) -> CacheError {
    CacheError::Transaction {
        reason: e.to_string(),
    }
}

/// A full map means nothing more fits, whatever the accounted total says.
fn write_error(e: heed::Error, requested: u64) -> CacheError {
    match e {
        heed::Error::Mdb(MdbError::MapFull) => {
            warn!(requested, "LMDB map is full");
            CacheError::CapacityExceeded {
                requested,
                remaining: 0,
            }
        }
        other => txn_error(other),
    }
}
