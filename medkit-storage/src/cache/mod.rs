//! Result cache: codec, record framing, storage engines and the query facade.
//!
//! Data flows in one direction on a store:
//!
//! ```text
//! query --derive_cache_key--> CacheKey
//! payload --Codec--> CacheRecord --RecordStore::put--> LMDB
//! ```
//!
//! and back on a lookup. [`QueryCache`] ties the pieces together and owns the
//! degrade-to-miss policy; the stores themselves report every failure.

pub mod codec;
pub mod facade;
pub mod lmdb_backend;
pub mod memory;
pub mod record;
pub mod traits;

pub use codec::{Codec, Encoded};
pub use facade::{CacheOutcome, QueryCache};
pub use lmdb_backend::{map_size_for, LmdbStore, MAP_GRANULE};
pub use memory::MemoryStore;
pub use record::{CacheRecord, HEADER_LEN, RECORD_VERSION};
pub use traits::{CacheStats, PutOutcome, RecordStore, StoreStats};
