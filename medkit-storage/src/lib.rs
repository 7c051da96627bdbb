//! medkit storage - LMDB-backed cache for generated results
//!
//! Generation pipelines call [`QueryCache::lookup`] before invoking a model and
//! [`QueryCache::store`] after. Keys are derived from the query itself, so the
//! same logical query always lands on the same record.

pub mod cache;
pub mod telemetry;
pub mod transfer;

// Re-export the types most callers need
pub use cache::{
    CacheOutcome, CacheRecord, CacheStats, Codec, LmdbStore, MemoryStore, PutOutcome, QueryCache,
    RecordStore, StoreStats,
};
pub use transfer::{ExportReport, ImportReport, TransferEntry, ValueEncoding};
