//! Cache records and their on-disk framing.
//!
//! Format: [version: 1][flags: 1][original_size: 8 LE][created_at ms: 8 LE][stored bytes]

use chrono::{DateTime, Utc};
use medkit_core::{CacheError, CacheKey, Timestamp};

use super::codec::{self, Encoded};

/// Current record format version.
pub const RECORD_VERSION: u8 = 1;

/// Size of the fixed record header.
pub const HEADER_LEN: usize = 18;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const KNOWN_FLAGS: u8 = FLAG_COMPRESSED;

/// The unit of storage. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub key: CacheKey,
    /// Stored bytes, compressed when `is_compressed` is set.
    pub payload: Vec<u8>,
    pub is_compressed: bool,
    pub original_size: u64,
    pub stored_size: u64,
    pub created_at: Timestamp,
}

impl CacheRecord {
    /// Encode a caller payload into a new record.
    pub fn encode(key: CacheKey, payload: &[u8], threshold: u64) -> Self {
        let Encoded {
            bytes,
            is_compressed,
        } = codec::encode(payload, threshold);
        Self::from_encoded(key, bytes, is_compressed, payload.len() as u64, Utc::now())
    }

    /// Build a record from already-encoded bytes.
    pub fn from_encoded(
        key: CacheKey,
        payload: Vec<u8>,
        is_compressed: bool,
        original_size: u64,
        created_at: Timestamp,
    ) -> Self {
        let stored_size = payload.len() as u64;
        Self {
            key,
            payload,
            is_compressed,
            original_size,
            stored_size,
            created_at,
        }
    }

    /// Recover the caller's payload, checking it against the recorded size.
    pub fn decode_payload(&self) -> Result<Vec<u8>, CacheError> {
        codec::decode(&self.payload, self.is_compressed, self.original_size)
    }

    /// Bytes this record occupies against the capacity ceiling.
    pub fn accounted_size(&self) -> u64 {
        (self.key.as_bytes().len() + HEADER_LEN) as u64 + self.stored_size
    }

    /// Serialize header and stored bytes into one LMDB value.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(RECORD_VERSION);
        out.push(if self.is_compressed { FLAG_COMPRESSED } else { 0 });
        out.extend_from_slice(&self.original_size.to_le_bytes());
        out.extend_from_slice(&self.created_at.timestamp_millis().to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a stored value. Never returns a partially parsed record.
    pub fn from_bytes(key: CacheKey, bytes: &[u8]) -> Result<Self, CacheError> {
        if bytes.len() < HEADER_LEN {
            return Err(CacheError::CorruptRecord {
                reason: format!("record is {} bytes, header needs {}", bytes.len(), HEADER_LEN),
            });
        }

        if bytes[0] != RECORD_VERSION {
            return Err(CacheError::CorruptRecord {
                reason: format!("unknown record version {}", bytes[0]),
            });
        }

        let flags = bytes[1];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(CacheError::CorruptRecord {
                reason: format!("unknown record flags {:#04x}", flags),
            });
        }

        let original_size = u64::from_le_bytes(read_array(&bytes[2..10])?);
        let created_millis = i64::from_le_bytes(read_array(&bytes[10..18])?);
        let created_at = DateTime::from_timestamp_millis(created_millis).ok_or_else(|| {
            CacheError::CorruptRecord {
                reason: format!("invalid timestamp {}", created_millis),
            }
        })?;

        Ok(Self::from_encoded(
            key,
            bytes[HEADER_LEN..].to_vec(),
            flags & FLAG_COMPRESSED != 0,
            original_size,
            created_at,
        ))
    }
}

fn read_array(bytes: &[u8]) -> Result<[u8; 8], CacheError> {
    bytes.try_into().map_err(|_| CacheError::CorruptRecord {
        reason: "truncated header field".to_string(),
    })
}
