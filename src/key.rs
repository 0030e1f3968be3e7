//! Key and value bounds, codecs, and key hashing.
//!
//! Keys and values are opaque to the engine beyond these bounds. Everything
//! that crosses the replication log or lands on disk is bincode-encoded, and
//! key locks are addressed by a 64-bit hash of the encoded key.

use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::ResultExt;

use crate::error::DeserializeSnafu;
use crate::error::Result;
use crate::error::SerializeSnafu;

/// Bounds required of store keys.
pub trait StoreKey: Ord + Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> StoreKey for T where T: Ord + Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Bounds required of store values.
pub trait StoreValue: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> StoreValue for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Encode with bincode.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).context(SerializeSnafu)
}

/// Decode with bincode.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).context(DeserializeSnafu)
}

/// Hash of an encoded key: first 8 bytes of its blake3 digest.
pub fn hash_key_bytes(key_bytes: &[u8]) -> u64 {
    let digest = blake3::hash(key_bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// Encode a key and hash it in one step.
pub fn key_hash<K: Serialize>(key: &K) -> Result<(Vec<u8>, u64)> {
    let bytes = encode(key)?;
    let hash = hash_key_bytes(&bytes);
    Ok((bytes, hash))
}

/// Running average of encoded key sizes, used for memory estimates.
#[derive(Debug, Default)]
pub struct KeySizeEstimator {
    total_bytes: AtomicU64,
    samples: AtomicU64,
}

impl KeySizeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&self, key_len: usize) {
        self.total_bytes.fetch_add(key_len as u64, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Average key size in bytes, 0 when nothing has been sampled.
    pub fn estimate(&self) -> u64 {
        self.snapshot().estimate()
    }

    /// Frozen copy of the current state, taken when a checkpoint is prepared.
    pub fn snapshot(&self) -> KeySizeSnapshot {
        KeySizeSnapshot {
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`KeySizeEstimator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeySizeSnapshot {
    pub total_bytes: u64,
    pub samples: u64,
}

impl KeySizeSnapshot {
    /// Average key size in bytes, 0 when nothing was sampled.
    pub fn estimate(&self) -> u64 {
        if self.samples == 0 {
            return 0;
        }
        self.total_bytes / self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hash_is_stable_for_equal_keys() {
        let (bytes_a, hash_a) = key_hash(&"alpha".to_string()).unwrap();
        let (bytes_b, hash_b) = key_hash(&"alpha".to_string()).unwrap();
        assert_eq!(bytes_a, bytes_b);
        assert_eq!(hash_a, hash_b);

        let (_, hash_c) = key_hash(&"beta".to_string()).unwrap();
        assert_ne!(hash_a, hash_c);
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let bytes = encode(&(1u64, 2u64)).unwrap();
        let result: Result<(u64, u64)> = decode(&bytes[..4]);
        assert!(result.is_err());
    }

    #[test]
    fn test_key_size_estimator_averages() {
        let estimator = KeySizeEstimator::new();
        assert_eq!(estimator.estimate(), 0);
        estimator.add_sample(10);
        estimator.add_sample(20);
        assert_eq!(estimator.estimate(), 15);

        let frozen = estimator.snapshot();
        estimator.add_sample(90);
        assert_eq!(frozen.estimate(), 15);
        assert_eq!(estimator.estimate(), 40);
    }
}
