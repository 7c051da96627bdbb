//! medkit Test Utilities
//!
//! Shared test infrastructure for the medkit cache workspace:
//! - Proptest generators for queries and payloads
//! - Fixtures for isolated on-disk stores
//! - Assertions for cache outcomes and errors

// Re-export core types for convenience
pub use medkit_core::{
    derive_cache_key, CacheError, CacheKey, StorageSettings, StoreConfig, BYTES_PER_MB,
};
pub use medkit_storage::cache::{
    CacheOutcome, CacheRecord, Codec, LmdbStore, MemoryStore, PutOutcome, QueryCache, RecordStore,
};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache inputs.

    use proptest::prelude::*;
    use serde_json::{json, Value};

    /// Generate a disease-section style query object.
    pub fn arb_query() -> impl Strategy<Value = Value> {
        (
            "[a-z][a-z -]{2,24}",
            prop_oneof![
                Just("identity"),
                Just("symptoms"),
                Just("treatment"),
                Just("prognosis"),
                Just("epidemiology"),
            ],
            prop::option::of(0u32..5),
        )
            .prop_map(|(disease, section, depth)| match depth {
                Some(depth) => json!({"disease": disease, "section": section, "depth": depth}),
                None => json!({"disease": disease, "section": section}),
            })
    }

    /// Generate an arbitrary payload up to 4 KiB.
    pub fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..4096)
    }

    /// Generate a text payload that compresses well.
    pub fn arb_text_payload() -> impl Strategy<Value = Vec<u8>> {
        ("[a-z ]{8,32}", 16usize..128).prop_map(|(unit, reps)| unit.repeat(reps).into_bytes())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built stores and payloads for common scenarios.

    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// A JSON document of exactly `len` bytes describing a disease report.
    pub fn json_blob(len: usize) -> Vec<u8> {
        let mut sections = Vec::new();
        let mut i = 0;
        loop {
            sections.push(serde_json::json!({
                "section": format!("section-{}", i),
                "text": "Chronic condition characterised by elevated blood glucose levels.",
            }));
            let doc = serde_json::json!({"disease": "diabetes", "sections": sections, "pad": ""});
            let size = serde_json::to_vec(&doc).map(|v| v.len()).unwrap_or(usize::MAX);
            if size >= len {
                sections.pop();
                break;
            }
            i += 1;
        }

        let base = serde_json::json!({"disease": "diabetes", "sections": sections, "pad": ""});
        let base_len = serde_json::to_vec(&base).map(|v| v.len()).unwrap_or(0);
        let pad = "x".repeat(len.saturating_sub(base_len));
        let doc = serde_json::json!({"disease": "diabetes", "sections": sections, "pad": pad});
        serde_json::to_vec(&doc).unwrap_or_default()
    }

    /// A store directory that is removed when the fixture is dropped.
    pub struct TempStore {
        // Held for its Drop
        _dir: TempDir,
        path: PathBuf,
    }

    impl TempStore {
        pub fn new() -> Self {
            let dir = TempDir::new().expect("TempDir creation should succeed");
            let path = dir.path().join("cache.lmdb");
            Self { _dir: dir, path }
        }

        /// Directory the store lives in.
        pub fn path(&self) -> &std::path::Path {
            &self.path
        }

        /// Settings pointing at this directory.
        pub fn settings(&self, capacity_mb: u64) -> StorageSettings {
            StorageSettings {
                db_path: self.path.clone(),
                db_capacity_mb: capacity_mb,
                enable_logging: false,
                ..StorageSettings::default()
            }
        }

        /// Open an LMDB store with a byte-granular capacity.
        pub fn open_store(&self, capacity_bytes: u64) -> LmdbStore {
            LmdbStore::open(StoreConfig::new(&self.path, capacity_bytes).with_logging(false))
                .expect("store creation should succeed")
        }

        /// Open a facade over this directory.
        pub fn open_cache(&self, capacity_mb: u64) -> QueryCache {
            let cache = QueryCache::open(&self.settings(capacity_mb));
            assert!(!cache.is_pass_through(), "fixture cache should open a store");
            cache
        }
    }

    impl Default for TempStore {
        fn default() -> Self {
            Self::new()
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for cache outcomes.

    use super::*;

    /// Assert a lookup hit with exactly `expected` bytes.
    #[track_caller]
    pub fn assert_hit(outcome: &CacheOutcome, expected: &[u8]) {
        match outcome {
            CacheOutcome::Hit(bytes) => assert_eq!(bytes.as_slice(), expected, "hit with wrong payload"),
            CacheOutcome::Miss => panic!("Expected Hit, got Miss"),
        }
    }

    /// Assert a lookup miss.
    #[track_caller]
    pub fn assert_miss(outcome: &CacheOutcome) {
        assert!(
            matches!(outcome, CacheOutcome::Miss),
            "Expected Miss, got: {:?}",
            outcome
        );
    }

    /// Assert a capacity error.
    #[track_caller]
    pub fn assert_capacity_exceeded<T: std::fmt::Debug>(result: &Result<T, CacheError>) {
        match result {
            Err(CacheError::CapacityExceeded { .. }) => {}
            other => panic!("Expected CapacityExceeded, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::json_blob;

    #[test]
    fn test_json_blob_exact_length_and_valid() {
        for len in [64, 512, 2048, 10_000] {
            let blob = json_blob(len);
            assert_eq!(blob.len(), len);
            let parsed: serde_json::Value =
                serde_json::from_slice(&blob).expect("blob should be valid JSON");
            assert_eq!(parsed["disease"], "diabetes");
        }
    }
}
