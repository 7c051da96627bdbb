//! Query-level cache facade.
//!
//! [`QueryCache`] is what generation code talks to: it turns a query into a
//! key, compresses payloads on the way in, and never lets a storage problem
//! fail a request. Only caller mistakes (`InvalidQuery`, `Serialization`) and
//! a full store (`CapacityExceeded`) come back from [`QueryCache::store`].
//!
//! # Example
//!
//! ```ignore
//! use medkit_core::StorageSettings;
//! use medkit_storage::cache::{CacheOutcome, QueryCache};
//!
//! let cache = QueryCache::open(&StorageSettings::for_module("disease_info"));
//!
//! let payload = cache.get_or_generate("diabetes-query", false, || {
//!     generate_disease_report("diabetes")
//! })?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use heed::EnvClosingEvent;
use medkit_core::{derive_cache_key, CacheError, CacheKey, StorageSettings};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::codec::{Codec, Encoded};
use super::lmdb_backend::LmdbStore;
use super::record::CacheRecord;
use super::traits::{CacheStats, RecordStore};

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// A stored payload, byte-identical to what was stored.
    Hit(Vec<u8>),
    Miss,
}

impl CacheOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheOutcome::Hit(_))
    }

    /// The payload on a hit.
    pub fn into_payload(self) -> Option<Vec<u8>> {
        match self {
            CacheOutcome::Hit(bytes) => Some(bytes),
            CacheOutcome::Miss => None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Cache facade over a [`RecordStore`].
///
/// Without a store the cache is a pass-through: every lookup misses and every
/// store succeeds without writing anything.
pub struct QueryCache<S: RecordStore = LmdbStore> {
    store: Option<S>,
    codec: Codec,
    overwrite_default: bool,
    enable_logging: bool,
    counters: Counters,
}

impl QueryCache<LmdbStore> {
    /// Open the cache described by `settings`.
    ///
    /// Never fails. With `db_store = false`, invalid settings, or a store that
    /// cannot be opened, the returned cache is a pass-through; the reason is
    /// logged here once.
    pub fn open(settings: &StorageSettings) -> Self {
        if !settings.db_store {
            if settings.enable_logging {
                info!("Result caching disabled, running as pass-through");
            }
            return Self::pass_through(settings);
        }

        let opened = settings
            .validate()
            .map_err(|e| CacheError::StorageUnavailable {
                path: settings.db_path.display().to_string(),
                reason: e.to_string(),
            })
            .and_then(|_| LmdbStore::open(settings.store_config()));

        match opened {
            Ok(store) => Self::with_store(
                store,
                settings.compression_threshold_bytes,
                settings.db_overwrite,
            )
            .with_logging(settings.enable_logging),
            Err(e) => {
                warn!(
                    path = %settings.db_path.display(),
                    error = %e,
                    "Cache store unavailable, running as pass-through"
                );
                Self::pass_through(settings)
            }
        }
    }

    /// Close the underlying store.
    ///
    /// Returns the environment closing event, or `None` for a pass-through.
    /// Caches opened on the same path share one environment, which is only
    /// released when the last of them is closed or dropped.
    pub fn close(self) -> Option<EnvClosingEvent> {
        self.store.map(LmdbStore::close)
    }
}

impl<S: RecordStore> QueryCache<S> {
    /// Wrap an already opened store.
    pub fn with_store(store: S, compression_threshold: u64, overwrite_default: bool) -> Self {
        Self {
            store: Some(store),
            codec: Codec::new(compression_threshold),
            overwrite_default,
            enable_logging: true,
            counters: Counters::default(),
        }
    }

    /// A cache that never stores anything.
    pub fn pass_through(settings: &StorageSettings) -> Self {
        Self {
            store: None,
            codec: Codec::new(settings.compression_threshold_bytes),
            overwrite_default: settings.db_overwrite,
            enable_logging: settings.enable_logging,
            counters: Counters::default(),
        }
    }

    /// Enable or disable hit/miss/store debug events.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    pub fn is_pass_through(&self) -> bool {
        self.store.is_none()
    }

    /// The underlying store, if any.
    pub fn record_store(&self) -> Option<&S> {
        self.store.as_ref()
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Overwrite flag used by [`store_default`](Self::store_default).
    pub fn overwrite_default(&self) -> bool {
        self.overwrite_default
    }

    /// Look up the stored payload for `query`.
    ///
    /// `skip_cache` forces a miss without touching storage. Invalid queries,
    /// corrupt records and storage failures are all reported as a miss.
    pub fn lookup<Q: Serialize + ?Sized>(&self, query: &Q, skip_cache: bool) -> CacheOutcome {
        if skip_cache {
            Counters::bump(&self.counters.misses);
            if self.enable_logging {
                debug!("Cache lookup skipped by caller");
            }
            return CacheOutcome::Miss;
        }

        let Some(store) = &self.store else {
            Counters::bump(&self.counters.misses);
            return CacheOutcome::Miss;
        };

        let key = match derive_cache_key(query) {
            Ok(key) => key,
            Err(e) => {
                Counters::bump(&self.counters.misses);
                warn!(error = %e, "Query cannot be keyed, treating as cache miss");
                return CacheOutcome::Miss;
            }
        };

        self.lookup_key(store, &key)
    }

    fn lookup_key(&self, store: &S, key: &CacheKey) -> CacheOutcome {
        let decoded = store.get(key).and_then(|found| {
            found
                .map(|record| {
                    self.codec
                        .decode(&record.payload, record.is_compressed, record.original_size)
                })
                .transpose()
        });

        match decoded {
            Ok(Some(payload)) => {
                Counters::bump(&self.counters.hits);
                if self.enable_logging {
                    debug!(key = %key.short(), bytes = payload.len(), "Cache hit");
                }
                CacheOutcome::Hit(payload)
            }
            Ok(None) => {
                Counters::bump(&self.counters.misses);
                if self.enable_logging {
                    debug!(key = %key.short(), "Cache miss");
                }
                CacheOutcome::Miss
            }
            Err(CacheError::CorruptRecord { reason }) => {
                Counters::bump(&self.counters.misses);
                Counters::bump(&self.counters.errors);
                warn!(key = %key.short(), reason = %reason, "Corrupt cache record, deleting");
                if let Err(e) = store.delete(key) {
                    warn!(key = %key.short(), error = %e, "Failed to delete corrupt record");
                }
                CacheOutcome::Miss
            }
            Err(e) => {
                Counters::bump(&self.counters.misses);
                Counters::bump(&self.counters.errors);
                warn!(key = %key.short(), error = %e, "Cache read failed, treating as miss");
                CacheOutcome::Miss
            }
        }
    }

    /// Store `payload` under `query`.
    ///
    /// With `overwrite = false` an existing record is kept. Storage failures
    /// other than a full store are logged and swallowed.
    ///
    /// # Errors
    ///
    /// - [`CacheError::InvalidQuery`] if the query cannot be keyed
    /// - [`CacheError::CapacityExceeded`] if the record does not fit
    pub fn store<Q: Serialize + ?Sized>(
        &self,
        query: &Q,
        payload: &[u8],
        overwrite: bool,
    ) -> Result<(), CacheError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let key = derive_cache_key(query)?;
        let Encoded {
            bytes,
            is_compressed,
        } = self.codec.encode(payload);
        let record =
            CacheRecord::from_encoded(key, bytes, is_compressed, payload.len() as u64, Utc::now());

        match store.put(&record, overwrite) {
            Ok(outcome) => {
                if outcome.wrote() {
                    Counters::bump(&self.counters.stores);
                }
                if self.enable_logging {
                    debug!(
                        key = %key.short(),
                        bytes = payload.len(),
                        stored_bytes = record.stored_size,
                        compressed = is_compressed,
                        ?outcome,
                        "Cache store"
                    );
                }
                Ok(())
            }
            Err(e @ CacheError::CapacityExceeded { .. }) => {
                Counters::bump(&self.counters.errors);
                warn!(key = %key.short(), error = %e, "Cache store rejected");
                Err(e)
            }
            Err(e) => {
                Counters::bump(&self.counters.errors);
                warn!(key = %key.short(), error = %e, "Cache store failed, continuing without caching");
                Ok(())
            }
        }
    }

    /// [`store`](Self::store) with the configured overwrite default.
    pub fn store_default<Q: Serialize + ?Sized>(
        &self,
        query: &Q,
        payload: &[u8],
    ) -> Result<(), CacheError> {
        self.store(query, payload, self.overwrite_default)
    }

    /// Read-through helper.
    ///
    /// Returns the cached payload on a hit. On a miss, runs `generate`, stores
    /// its output with the overwrite default and returns it. Caching failures
    /// are logged and never fail the request; generator errors are returned
    /// as-is.
    pub fn get_or_generate<Q, F, E>(
        &self,
        query: &Q,
        skip_cache: bool,
        generate: F,
    ) -> Result<Vec<u8>, E>
    where
        Q: Serialize + ?Sized,
        F: FnOnce() -> Result<Vec<u8>, E>,
    {
        if let CacheOutcome::Hit(payload) = self.lookup(query, skip_cache) {
            return Ok(payload);
        }

        let fresh = generate()?;
        if let Err(e) = self.store_default(query, &fresh) {
            warn!(error = %e, "Generated result not cached");
        }
        Ok(fresh)
    }

    /// Typed lookup for JSON payloads. A payload that does not parse as `T`
    /// is treated as a miss.
    pub fn lookup_json<Q, T>(&self, query: &Q, skip_cache: bool) -> Option<T>
    where
        Q: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let payload = self.lookup(query, skip_cache).into_payload()?;
        match serde_json::from_slice(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Cached payload is not the expected JSON shape");
                None
            }
        }
    }

    /// Typed store for JSON payloads.
    pub fn store_json<Q, T>(&self, query: &Q, value: &T, overwrite: bool) -> Result<(), CacheError>
    where
        Q: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        self.store(query, &payload, overwrite)
    }

    /// Remove the record for `query`. Returns whether one was removed.
    pub fn invalidate<Q: Serialize + ?Sized>(&self, query: &Q) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        let removed = derive_cache_key(query).and_then(|key| store.delete(&key));
        match removed {
            Ok(removed) => removed,
            Err(e) => {
                Counters::bump(&self.counters.errors);
                warn!(error = %e, "Cache invalidation failed");
                false
            }
        }
    }

    /// Counters plus current store occupancy.
    pub fn stats(&self) -> CacheStats {
        let (entry_count, size_bytes) = match &self.store {
            Some(store) => (store.len().unwrap_or(0), store.size()),
            None => (0, 0),
        };

        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            entry_count,
            size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryStore;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn memory_cache(capacity_bytes: u64) -> QueryCache<MemoryStore> {
        QueryCache::with_store(MemoryStore::new(capacity_bytes), 100, false).with_logging(false)
    }

    #[test]
    fn test_store_then_lookup_hits() {
        let cache = memory_cache(1024 * 1024);
        cache
            .store("hypertension", b"{\"drug\":\"amlodipine\"}", false)
            .expect("store should succeed");

        assert_eq!(
            cache.lookup("hypertension", false),
            CacheOutcome::Hit(b"{\"drug\":\"amlodipine\"}".to_vec())
        );
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_skip_cache_misses_without_reading() {
        let cache = memory_cache(1024 * 1024);
        cache.store("copd", b"x", false).expect("store should succeed");

        assert_eq!(cache.lookup("copd", true), CacheOutcome::Miss);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_idempotent_store_keeps_first() {
        let cache = memory_cache(1024 * 1024);
        cache.store("q", b"v1", false).expect("store should succeed");
        cache.store("q", b"v2", false).expect("store should succeed");

        assert_eq!(cache.lookup("q", false), CacheOutcome::Hit(b"v1".to_vec()));
        assert_eq!(cache.stats().stores, 1);
    }

    #[test]
    fn test_overwrite_replaces() {
        let cache = memory_cache(1024 * 1024);
        cache.store("q", b"v1", false).expect("store should succeed");
        cache.store("q", b"v2", true).expect("store should succeed");

        assert_eq!(cache.lookup("q", false), CacheOutcome::Hit(b"v2".to_vec()));
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let cache = memory_cache(1024 * 1024);
        let mut a = BTreeMap::new();
        a.insert("disease", "asthma");
        a.insert("section", "treatment");
        cache.store(&a, b"inhaled corticosteroids", false).expect("store should succeed");

        let b = json!({"section": "treatment", "disease": "asthma"});
        assert!(cache.lookup(&b, false).is_hit());
    }

    #[test]
    fn test_invalid_query_is_miss_on_lookup_and_error_on_store() {
        let cache = memory_cache(1024 * 1024);
        let mut query = std::collections::HashMap::new();
        query.insert((1, 2), "tuple keys cannot be keyed");

        assert_eq!(cache.lookup(&query, false), CacheOutcome::Miss);
        let err = cache.store(&query, b"x", false).expect_err("store should fail");
        assert!(matches!(err, CacheError::InvalidQuery { .. }));
    }

    #[test]
    fn test_capacity_exceeded_is_returned() {
        let cache = memory_cache(128);
        let payload: Vec<u8> = (0..=255u8).collect();
        let err = cache.store("big", &payload, false).expect_err("store should fail");
        assert!(matches!(err, CacheError::CapacityExceeded { .. }));

        cache.store("small", b"ok", false).expect("store should succeed");
        assert!(cache.lookup("small", false).is_hit());
    }

    #[test]
    fn test_corrupt_record_is_deleted_on_lookup() {
        let store = MemoryStore::new(1024 * 1024);
        let cache = QueryCache::with_store(store.clone(), 100, false).with_logging(false);
        let key = derive_cache_key("tampered").expect("derive should succeed");

        let mut record = CacheRecord::encode(key, b"payload", 100);
        record.original_size = 1000;
        store.put(&record, false).expect("put should succeed");

        assert_eq!(cache.lookup("tampered", false), CacheOutcome::Miss);
        assert!(store.get(&key).expect("get should succeed").is_none());
        assert_eq!(cache.stats().errors, 1);
    }

    #[test]
    fn test_pass_through_never_stores() {
        let cache: QueryCache<MemoryStore> = QueryCache::pass_through(&StorageSettings::disabled());
        assert!(cache.is_pass_through());

        cache.store("q", b"v", false).expect("store should succeed");
        assert_eq!(cache.lookup("q", false), CacheOutcome::Miss);
        assert!(!cache.invalidate("q"));
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[test]
    fn test_get_or_generate() {
        let cache = memory_cache(1024 * 1024);
        let mut calls = 0;

        let first: Result<Vec<u8>, String> = cache.get_or_generate("anemia", false, || {
            calls += 1;
            Ok(b"iron supplementation".to_vec())
        });
        assert_eq!(first.expect("generate should succeed"), b"iron supplementation");

        let second: Result<Vec<u8>, String> = cache.get_or_generate("anemia", false, || {
            calls += 1;
            Ok(b"never used".to_vec())
        });
        assert_eq!(second.expect("lookup should succeed"), b"iron supplementation");
        assert_eq!(calls, 1);

        let failed: Result<Vec<u8>, String> =
            cache.get_or_generate("migraine", false, || Err("model offline".to_string()));
        assert_eq!(failed.expect_err("generate should fail"), "model offline");
        assert!(!cache.lookup("migraine", false).is_hit());
    }

    #[test]
    fn test_json_helpers() {
        let cache = memory_cache(1024 * 1024);
        let report = json!({"disease": "diabetes", "icd10": "E11"});
        cache
            .store_json("diabetes", &report, false)
            .expect("store should succeed");

        let cached: Option<serde_json::Value> = cache.lookup_json("diabetes", false);
        assert_eq!(cached, Some(report));

        cache.store("not-json", b"\xff\xfe", false).expect("store should succeed");
        let broken: Option<serde_json::Value> = cache.lookup_json("not-json", false);
        assert!(broken.is_none());
    }

    #[test]
    fn test_invalidate() {
        let cache = memory_cache(1024 * 1024);
        cache.store("stale", b"old answer", false).expect("store should succeed");

        assert!(cache.invalidate("stale"));
        assert!(!cache.invalidate("stale"));
        assert_eq!(cache.lookup("stale", false), CacheOutcome::Miss);
    }

    #[test]
    fn test_store_default_uses_configured_overwrite() {
        let cache = QueryCache::with_store(MemoryStore::new(4096), 100, true).with_logging(false);
        cache.store_default("q", b"v1").expect("store should succeed");
        cache.store_default("q", b"v2").expect("store should succeed");
        assert_eq!(cache.lookup("q", false), CacheOutcome::Hit(b"v2".to_vec()));
    }
}
