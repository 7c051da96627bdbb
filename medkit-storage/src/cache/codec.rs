//! Payload codec with threshold-triggered gzip compression.
//!
//! The compressed/raw decision is returned to the caller and persisted in the
//! record header; decoding never sniffs the payload.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use medkit_core::CacheError;

/// Encoded payload plus the flag needed to decode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub is_compressed: bool,
}

/// Compress `payload` when it is at least `threshold` bytes long and the
/// compressed form is strictly smaller; otherwise keep it raw.
pub fn encode(payload: &[u8], threshold: u64) -> Encoded {
    if (payload.len() as u64) < threshold {
        return raw(payload);
    }

    match gzip(payload) {
        Ok(compressed) if compressed.len() < payload.len() => Encoded {
            bytes: compressed,
            is_compressed: true,
        },
        _ => raw(payload),
    }
}

/// Exact inverse of [`encode`].
///
/// `expected_len` is the original payload size recorded next to the bytes.
/// Inflation stops one byte past it, and any length mismatch is reported as
/// corruption.
pub fn decode(bytes: &[u8], is_compressed: bool, expected_len: u64) -> Result<Vec<u8>, CacheError> {
    let out = if is_compressed {
        let capacity = usize::try_from(expected_len)
            .unwrap_or(usize::MAX)
            .min(bytes.len().saturating_mul(8));
        let mut out = Vec::with_capacity(capacity);
        GzDecoder::new(bytes)
            .take(expected_len.saturating_add(1))
            .read_to_end(&mut out)
            .map_err(|e| CacheError::CorruptRecord {
                reason: format!("decompression failed: {}", e),
            })?;
        out
    } else {
        bytes.to_vec()
    };

    if out.len() as u64 != expected_len {
        return Err(CacheError::CorruptRecord {
            reason: if out.len() as u64 > expected_len {
                format!("payload exceeds declared size of {} bytes", expected_len)
            } else {
                format!("decoded {} bytes, header says {}", out.len(), expected_len)
            },
        });
    }
    Ok(out)
}

fn raw(payload: &[u8]) -> Encoded {
    Encoded {
        bytes: payload.to_vec(),
        is_compressed: false,
    }
}

fn gzip(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

/// Codec bound to a configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    threshold: u64,
}

impl Codec {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn encode(&self, payload: &[u8]) -> Encoded {
        encode(payload, self.threshold)
    }

    pub fn decode(
        &self,
        bytes: &[u8],
        is_compressed: bool,
        expected_len: u64,
    ) -> Result<Vec<u8>, CacheError> {
        decode(bytes, is_compressed, expected_len)
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_decode_inverts_encode(
            payload in prop::collection::vec(any::<u8>(), 0..4096),
            threshold in 0u64..2048,
        ) {
            let encoded = encode(&payload, threshold);
            let decoded = decode(&encoded.bytes, encoded.is_compressed, payload.len() as u64)
                .expect("decode should succeed");
            prop_assert_eq!(decoded, payload);
        }

        #[test]
        fn prop_never_grows_beyond_raw(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
            let encoded = encode(&payload, 0);
            prop_assert!(encoded.bytes.len() <= payload.len());
        }

        #[test]
        fn prop_repetitive_text_compresses(unit in "[a-z]{4,12}", reps in 64usize..256) {
            let payload = unit.repeat(reps).into_bytes();
            let encoded = encode(&payload, 100);
            prop_assert!(encoded.is_compressed);
        }
    }
}
