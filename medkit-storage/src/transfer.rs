//! JSON import and export of cache contents.
//!
//! The transfer file is a JSON array of entries:
//!
//! ```json
//! [
//!   {
//!     "key": "9f86d081884c7d65...",
//!     "created_at": "2026-03-01T12:00:00Z",
//!     "encoding": "utf8",
//!     "value": "{\"disease\":\"diabetes\"}"
//!   }
//! ]
//! ```
//!
//! Values are exported decoded. Payloads that are not valid UTF-8 are written
//! with `"encoding": "base64"`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use medkit_core::{CacheError, CacheKey, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{Codec, CacheRecord, RecordStore};

/// How `value` is encoded in a transfer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueEncoding {
    Utf8,
    Base64,
}

/// One record in a transfer file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    pub key: CacheKey,
    pub created_at: Timestamp,
    pub encoding: ValueEncoding,
    pub value: String,
}

impl TransferEntry {
    /// Build an entry from a decoded payload.
    pub fn new(key: CacheKey, created_at: Timestamp, payload: Vec<u8>) -> Self {
        match String::from_utf8(payload) {
            Ok(text) => Self {
                key,
                created_at,
                encoding: ValueEncoding::Utf8,
                value: text,
            },
            Err(e) => Self {
                key,
                created_at,
                encoding: ValueEncoding::Base64,
                value: STANDARD.encode(e.into_bytes()),
            },
        }
    }

    /// The payload bytes this entry carries.
    pub fn payload(&self) -> Result<Vec<u8>, CacheError> {
        match self.encoding {
            ValueEncoding::Utf8 => Ok(self.value.as_bytes().to_vec()),
            ValueEncoding::Base64 => STANDARD.decode(&self.value).map_err(|e| CacheError::Transfer {
                reason: format!("invalid base64 value for {}: {}", self.key.short(), e),
            }),
        }
    }
}

/// Outcome of an export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub exported: u64,
    /// Records that could not be read or decoded.
    pub skipped: u64,
}

/// Outcome of an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Entries written to the store.
    pub imported: u64,
    /// Entries whose key already existed and were left alone.
    pub kept: u64,
    /// Malformed entries and entries the store refused.
    pub skipped: u64,
}

/// Decode every record in `store` into transfer entries, in key order.
pub fn collect_entries<S: RecordStore>(store: &S) -> Result<(Vec<TransferEntry>, u64), CacheError> {
    let mut entries = Vec::new();
    let mut skipped = 0;

    for key in store.keys()? {
        let decoded = store
            .get(&key)
            .and_then(|found| found.map(|r| r.decode_payload().map(|p| (r.created_at, p))).transpose());
        match decoded {
            Ok(Some((created_at, payload))) => {
                entries.push(TransferEntry::new(key, created_at, payload))
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key.short(), error = %e, "Skipping unreadable record during export");
                skipped += 1;
            }
        }
    }

    Ok((entries, skipped))
}

/// Write every record of `store` to `writer` as a JSON array.
pub fn export_json<S: RecordStore, W: Write>(store: &S, writer: W) -> Result<ExportReport, CacheError> {
    let (entries, skipped) = collect_entries(store)?;
    serde_json::to_writer_pretty(writer, &entries).map_err(|e| CacheError::Transfer {
        reason: e.to_string(),
    })?;

    let report = ExportReport {
        exported: entries.len() as u64,
        skipped,
    };
    info!(exported = report.exported, skipped = report.skipped, "Exported cache records");
    Ok(report)
}

/// Read a JSON array from `reader` and store every valid entry.
///
/// Entries are re-encoded with `codec`, so the destination threshold applies.
/// Malformed entries and entries the store refuses are skipped and counted;
/// only an unreadable document fails the whole import.
pub fn import_json<S: RecordStore, R: Read>(
    store: &S,
    reader: R,
    codec: Codec,
    overwrite: bool,
) -> Result<ImportReport, CacheError> {
    let document: serde_json::Value =
        serde_json::from_reader(reader).map_err(|e| CacheError::Transfer {
            reason: format!("failed to parse transfer file: {}", e),
        })?;

    let serde_json::Value::Array(items) = document else {
        return Err(CacheError::Transfer {
            reason: "transfer file must contain a JSON array".to_string(),
        });
    };

    let mut report = ImportReport::default();
    for (index, item) in items.into_iter().enumerate() {
        let result = serde_json::from_value::<TransferEntry>(item)
            .map_err(|e| CacheError::Transfer {
                reason: e.to_string(),
            })
            .and_then(|entry| {
                let payload = entry.payload()?;
                let encoded = codec.encode(&payload);
                let record = CacheRecord::from_encoded(
                    entry.key,
                    encoded.bytes,
                    encoded.is_compressed,
                    payload.len() as u64,
                    entry.created_at,
                );
                store.put(&record, overwrite)
            });

        match result {
            Ok(outcome) if outcome.wrote() => report.imported += 1,
            Ok(_) => report.kept += 1,
            Err(e) => {
                warn!(index, error = %e, "Skipping transfer entry");
                report.skipped += 1;
            }
        }
    }

    info!(
        imported = report.imported,
        kept = report.kept,
        skipped = report.skipped,
        "Imported cache records"
    );
    Ok(report)
}

/// [`export_json`] to a file.
pub fn export_to_path<S: RecordStore>(store: &S, path: &Path) -> Result<ExportReport, CacheError> {
    let mut writer = BufWriter::new(File::create(path)?);
    let report = export_json(store, &mut writer)?;
    writer.flush()?;
    Ok(report)
}

/// [`import_json`] from a file.
pub fn import_from_path<S: RecordStore>(
    store: &S,
    path: &Path,
    codec: Codec,
    overwrite: bool,
) -> Result<ImportReport, CacheError> {
    let reader = BufReader::new(File::open(path)?);
    import_json(store, reader, codec, overwrite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use medkit_core::derive_cache_key;

    fn store_with(entries: &[(&str, &[u8])]) -> MemoryStore {
        let store = MemoryStore::new(1024 * 1024);
        for (query, payload) in entries {
            let key = derive_cache_key(query).expect("derive should succeed");
            store
                .put(&CacheRecord::encode(key, payload, 100), false)
                .expect("put should succeed");
        }
        store
    }

    #[test]
    fn test_export_then_import_restores_records() {
        let long_text = "glycemic control ".repeat(50);
        let source = store_with(&[
            ("diabetes", long_text.as_bytes()),
            ("binary", &[0xff, 0x00, 0xfe]),
        ]);

        let mut buf = Vec::new();
        let exported = export_json(&source, &mut buf).expect("export should succeed");
        assert_eq!(exported, ExportReport { exported: 2, skipped: 0 });

        let target = MemoryStore::new(1024 * 1024);
        let imported =
            import_json(&target, buf.as_slice(), Codec::new(100), false).expect("import should succeed");
        assert_eq!(imported.imported, 2);
        assert_eq!(imported.skipped, 0);

        for query in ["diabetes", "binary"] {
            let key = derive_cache_key(query).expect("derive should succeed");
            let a = source.get(&key).expect("get should succeed").expect("exists");
            let b = target.get(&key).expect("get should succeed").expect("exists");
            assert_eq!(
                a.decode_payload().expect("decode should succeed"),
                b.decode_payload().expect("decode should succeed")
            );
            assert_eq!(a.created_at.timestamp_millis(), b.created_at.timestamp_millis());
        }
    }

    #[test]
    fn test_non_utf8_uses_base64() {
        let key = derive_cache_key("bytes").expect("derive should succeed");
        let entry = TransferEntry::new(key, chrono::Utc::now(), vec![0xc3, 0x28]);
        assert_eq!(entry.encoding, ValueEncoding::Base64);
        assert_eq!(entry.payload().expect("payload should decode"), vec![0xc3, 0x28]);

        let json = serde_json::to_value(&entry).expect("serialize should succeed");
        assert_eq!(json["encoding"], "base64");
        assert_eq!(json["key"], key.to_hex());
    }

    #[test]
    fn test_import_skips_invalid_entries() {
        let key = derive_cache_key("valid").expect("derive should succeed");
        let doc = serde_json::json!([
            {"key": key.to_hex(), "created_at": "2026-01-02T03:04:05Z", "encoding": "utf8", "value": "ok"},
            {"key": "not-hex", "created_at": "2026-01-02T03:04:05Z", "encoding": "utf8", "value": "x"},
            {"key": key.to_hex(), "encoding": "utf8"},
            {"key": key.to_hex(), "created_at": "2026-01-02T03:04:05Z", "encoding": "base64", "value": "!!"},
            42
        ]);

        let store = MemoryStore::new(1024 * 1024);
        let report = import_json(&store, doc.to_string().as_bytes(), Codec::new(100), false)
            .expect("import should succeed");
        assert_eq!(report.imported, 1);
        assert_eq!(report.skipped, 4);

        let record = store.get(&key).expect("get should succeed").expect("exists");
        assert_eq!(record.decode_payload().expect("decode should succeed"), b"ok");
    }

    #[test]
    fn test_import_respects_overwrite() {
        let store = store_with(&[("q", b"original")]);
        let key = derive_cache_key("q").expect("derive should succeed");
        let doc = serde_json::json!([
            {"key": key.to_hex(), "created_at": "2026-01-02T03:04:05Z", "encoding": "utf8", "value": "imported"}
        ])
        .to_string();

        let report =
            import_json(&store, doc.as_bytes(), Codec::new(100), false).expect("import should succeed");
        assert_eq!(report.kept, 1);

        let report =
            import_json(&store, doc.as_bytes(), Codec::new(100), true).expect("import should succeed");
        assert_eq!(report.imported, 1);
        let record = store.get(&key).expect("get should succeed").expect("exists");
        assert_eq!(record.decode_payload().expect("decode should succeed"), b"imported");
    }

    #[test]
    fn test_import_rejects_non_array_document() {
        let store = MemoryStore::new(1024);
        let err = import_json(&store, &b"{\"key\":\"x\"}"[..], Codec::new(100), false)
            .expect_err("import should fail");
        assert!(matches!(err, CacheError::Transfer { .. }));

        let err = import_json(&store, &b"[oops"[..], Codec::new(100), false).expect_err("import should fail");
        assert!(matches!(err, CacheError::Transfer { .. }));
    }

    #[test]
    fn test_path_helpers() {
        let temp_dir = tempfile::TempDir::new().expect("TempDir creation should succeed");
        let path = temp_dir.path().join("backup.json");
        let source = store_with(&[("a", b"1"), ("b", b"2")]);

        export_to_path(&source, &path).expect("export should succeed");
        let target = MemoryStore::new(1024 * 1024);
        let report =
            import_from_path(&target, &path, Codec::new(100), false).expect("import should succeed");
        assert_eq!(report.imported, 2);

        let err = import_from_path(&target, &temp_dir.path().join("missing.json"), Codec::new(100), false)
            .expect_err("import should fail");
        assert!(matches!(err, CacheError::Io { .. }));
    }
}
