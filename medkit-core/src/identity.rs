//! Cache key derivation.
//!
//! A [`CacheKey`] is the SHA-256 digest of a query's canonical serialization.
//! The query is lowered to a JSON value tree and re-emitted with object fields
//! sorted by name at every depth, so the key does not depend on the field order
//! of the caller's representation.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Domain separator hashed ahead of every canonical payload.
pub const KEY_DOMAIN: &[u8] = b"medkit.cache.v1\0";

/// Length of a cache key in bytes.
pub const KEY_LEN: usize = 32;

/// Fixed-size opaque identifier for a cached result.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; KEY_LEN]);

impl CacheKey {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a stored byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CacheError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CacheError::InvalidKey {
            value: hex::encode(bytes),
            reason: format!("expected {} bytes, got {}", KEY_LEN, bytes.len()),
        })?;
        Ok(Self(arr))
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(value: &str) -> Result<Self, CacheError> {
        let bytes = hex::decode(value.trim()).map_err(|e| CacheError::InvalidKey {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_slice(&bytes).map_err(|_| CacheError::InvalidKey {
            value: value.to_string(),
            reason: format!("expected {} hex characters", KEY_LEN * 2),
        })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CacheKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Derive the cache key for any serializable query.
///
/// Fails with [`CacheError::InvalidQuery`] when the query cannot be lowered
/// to a JSON value; nothing is hashed in that case.
pub fn derive_cache_key<Q: Serialize + ?Sized>(query: &Q) -> Result<CacheKey, CacheError> {
    let canonical = canonical_bytes(query)?;
    let mut hasher = Sha256::new();
    hasher.update(KEY_DOMAIN);
    hasher.update(&canonical);
    let result = hasher.finalize();
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&result);
    Ok(CacheKey(key))
}

/// Canonical UTF-8 serialization of a query: compact JSON with object fields
/// sorted by name, recursively.
pub fn canonical_bytes<Q: Serialize + ?Sized>(query: &Q) -> Result<Vec<u8>, CacheError> {
    let value = serde_json::to_value(query).map_err(|e| CacheError::InvalidQuery {
        reason: e.to_string(),
    })?;
    let mut out = Vec::with_capacity(64);
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), CacheError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(s, out)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // Explicit sort: serde_json's map order depends on crate features.
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push(b'{');
            for (i, (name, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(name, out)?;
                out.push(b':');
                write_canonical(item, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_string(s: &str, out: &mut Vec<u8>) -> Result<(), CacheError> {
    serde_json::to_writer(&mut *out, s).map_err(|e| CacheError::InvalidQuery {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap, HashSet};

    #[derive(Serialize)]
    struct DiseaseQuery<'a> {
        disease: &'a str,
        section: &'a str,
        age: Option<u32>,
    }

    #[derive(Serialize)]
    struct DiseaseQueryReordered<'a> {
        age: Option<u32>,
        section: &'a str,
        disease: &'a str,
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("value has no serial form"))
        }
    }

    #[test]
    fn test_field_order_does_not_change_key() {
        let a = DiseaseQuery {
            disease: "hypertension",
            section: "identity",
            age: Some(54),
        };
        let b = DiseaseQueryReordered {
            age: Some(54),
            section: "identity",
            disease: "hypertension",
        };
        assert_eq!(
            derive_cache_key(&a).expect("derive should succeed"),
            derive_cache_key(&b).expect("derive should succeed")
        );
    }

    #[test]
    fn test_nested_maps_are_sorted() {
        let mut inner_a = HashMap::new();
        inner_a.insert("zeta", 1);
        inner_a.insert("alpha", 2);
        let mut inner_b = BTreeMap::new();
        inner_b.insert("alpha", 2);
        inner_b.insert("zeta", 1);

        let bytes_a = canonical_bytes(&json!({ "outer": inner_a, "list": [3, 1] }))
            .expect("canonical should succeed");
        let bytes_b = canonical_bytes(&json!({ "list": [3, 1], "outer": inner_b }))
            .expect("canonical should succeed");
        assert_eq!(bytes_a, bytes_b);
        assert_eq!(
            String::from_utf8(bytes_a).expect("canonical bytes are utf-8"),
            r#"{"list":[3,1],"outer":{"alpha":2,"zeta":1}}"#
        );
    }

    #[test]
    fn test_array_order_is_significant() {
        let a = derive_cache_key(&json!(["a", "b"])).expect("derive should succeed");
        let b = derive_cache_key(&json!(["b", "a"])).expect("derive should succeed");
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_queries_have_stable_keys() {
        let unit = derive_cache_key(&()).expect("derive should succeed");
        let empty_str = derive_cache_key("").expect("derive should succeed");
        let empty_obj = derive_cache_key(&json!({})).expect("derive should succeed");

        assert_eq!(unit, derive_cache_key(&()).expect("derive should succeed"));
        assert_ne!(unit, empty_str);
        assert_ne!(empty_str, empty_obj);
    }

    #[test]
    fn test_known_digest_is_stable_across_runs() {
        // Keys are persisted, so the hash input must never drift.
        let key = derive_cache_key("diabetes-query").expect("derive should succeed");
        assert_eq!(
            key.to_hex(),
            "5dd48612fd9a04edf858d2fb9f02bf86f5b263309ab8ed954f0b70dc43e05fcc"
        );
    }

    #[test]
    fn test_non_ascii_text_hashes_as_utf8() {
        let bytes = canonical_bytes("Ménière's disease").expect("canonical should succeed");
        assert_eq!(bytes, "\"Ménière's disease\"".as_bytes());
        let a = derive_cache_key("Ménière's disease").expect("derive should succeed");
        let b = derive_cache_key("Meniere's disease").expect("derive should succeed");
        assert_ne!(a, b);
    }

    #[test]
    fn test_unserializable_query_is_invalid() {
        let err = derive_cache_key(&Unserializable).expect_err("derive should fail");
        assert!(matches!(err, CacheError::InvalidQuery { .. }));
    }

    #[test]
    fn test_non_string_map_keys_are_invalid() {
        let mut query = HashMap::new();
        query.insert((1u8, 2u8), "pair");
        let err = derive_cache_key(&query).expect_err("derive should fail");
        assert!(matches!(err, CacheError::InvalidQuery { .. }));
    }

    #[test]
    fn test_hex_roundtrip_and_rejections() {
        let key = derive_cache_key("aspirin").expect("derive should succeed");
        let parsed = CacheKey::from_hex(&key.to_hex()).expect("parse should succeed");
        assert_eq!(key, parsed);
        assert_eq!(key.short().len(), 8);

        assert!(matches!(
            CacheKey::from_hex("abcd"),
            Err(CacheError::InvalidKey { .. })
        ));
        assert!(matches!(
            CacheKey::from_hex(&"zz".repeat(32)),
            Err(CacheError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_key_serializes_as_hex_string() {
        let key = derive_cache_key("metformin").expect("derive should succeed");
        let json = serde_json::to_string(&key).expect("serialize should succeed");
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let back: CacheKey = serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(back, key);
    }

    #[test]
    fn test_no_collisions_over_ten_thousand_queries() {
        let mut seen = HashSet::new();
        for i in 0..10_000u32 {
            let query = json!({
                "topic": format!("condition-{}", i),
                "section": i % 13,
                "verbose": i % 2 == 0,
            });
            assert!(seen.insert(derive_cache_key(&query).expect("derive should succeed")));
        }
        assert_eq!(seen.len(), 10_000);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, HashMap};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Insertion order of a map never leaks into the key.
        #[test]
        fn prop_map_insertion_order_irrelevant(
            entries in prop::collection::vec(("[a-z]{1,8}", any::<i64>()), 0..12)
        ) {
            let hashed: HashMap<String, i64> = entries.iter().cloned().collect();
            let ordered: BTreeMap<String, i64> = hashed.clone().into_iter().collect();

            prop_assert_eq!(
                derive_cache_key(&hashed).expect("derive should succeed"),
                derive_cache_key(&ordered).expect("derive should succeed")
            );
        }

        #[test]
        fn prop_distinct_strings_distinct_keys(a in ".*", b in ".*") {
            prop_assume!(a != b);
            prop_assert_ne!(
                derive_cache_key(&a).expect("derive should succeed"),
                derive_cache_key(&b).expect("derive should succeed")
            );
        }

        #[test]
        fn prop_derivation_is_deterministic(query in ".*", n in any::<u32>()) {
            let value = serde_json::json!({ "q": query, "n": n });
            prop_assert_eq!(
                derive_cache_key(&value).expect("derive should succeed"),
                derive_cache_key(&value).expect("derive should succeed")
            );
        }
    }
}
