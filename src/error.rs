//! Error types for store operations.
//!
//! Expected business outcomes (key missing, version mismatch) are not errors:
//! conditional operations report them as `false`. Everything here is either
//! surfaced to the caller for re-routing or retry, or is fatal to the single
//! operation that raised it.
//!
//! Contract violations (negative live-key count, a replayed record that
//! contradicts state) never reach this enum: they go through [`invariant!`],
//! which logs and aborts.

use std::io;
use std::path::PathBuf;

use snafu::Snafu;

mod replication;

pub use replication::ReplicationError;

/// Errors from store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The store is closing or closed.
    #[snafu(display("store {store} is closed"))]
    ObjectClosed {
        /// Store name.
        store: String,
    },

    /// A lock wait or replication exceeded the caller's timeout.
    #[snafu(display("operation timed out after {duration_ms} ms"))]
    Timeout {
        /// The timeout the caller supplied.
        duration_ms: u64,
    },

    /// Add on a key that already has a live version.
    #[snafu(display("write conflict: key {key_hash:#018x} already exists"))]
    WriteConflict {
        /// 64-bit hash of the serialized key.
        key_hash: u64,
    },

    /// The partition does not grant write access to this replica.
    #[snafu(display("replica is not primary or has no write quorum"))]
    NotPrimary,

    /// The partition does not grant read access to this replica.
    #[snafu(display("replica is not readable"))]
    NotReadable,

    /// On-disk state failed validation.
    #[snafu(display("corruption detected: {reason}"))]
    Corruption {
        /// What failed validation.
        reason: String,
    },

    /// The operation observed its cancellation token before completing.
    #[snafu(display("operation cancelled"))]
    Cancelled,

    /// The replication layer rejected an append permanently.
    #[snafu(display("replication failed: {reason}"))]
    Replication {
        /// Reason reported by the replicator.
        reason: String,
    },

    /// The operation is not valid in the store's current state.
    #[snafu(display("invalid state: {reason}"))]
    InvalidState {
        /// Description of the offending state.
        reason: String,
    },

    /// A caller-supplied argument was rejected.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        /// Description of the offending argument.
        reason: String,
    },

    /// The copy stream ended before its completion marker.
    #[snafu(display("copy aborted before completion, store has no state"))]
    CopyAborted,

    /// Filesystem operation failed.
    #[snafu(display("i/o error at {}: {source}", path.display()))]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Failed to serialize a key, value, or on-disk structure.
    #[snafu(display("failed to serialize: {source}"))]
    Serialize {
        /// The underlying bincode error.
        source: bincode::Error,
    },

    /// Failed to deserialize a key, value, or on-disk structure.
    #[snafu(display("failed to deserialize: {source}"))]
    Deserialize {
        /// The underlying bincode error.
        source: bincode::Error,
    },

    /// Configuration could not be loaded.
    #[snafu(display("invalid configuration: {reason}"))]
    Config {
        /// Parse or validation message.
        reason: String,
    },
}

impl StoreError {
    /// Returns true for errors the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }
}

impl From<StoreError> for io::Error {
    fn from(err: StoreError) -> io::Error {
        match err {
            StoreError::Io { source, .. } => source,
            StoreError::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, err.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Result type for store operations.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Fail-fast check for contract violations.
///
/// Logs at error level with the same message, then panics. Reserved for
/// states that can only arise from a bug or a misbehaving replicator.
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            tracing::error!($($arg)+);
            panic!($($arg)+);
        }
    };
}

pub(crate) use invariant;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_retryable() {
        assert!(StoreError::Timeout { duration_ms: 10 }.is_retryable());
        assert!(!StoreError::NotPrimary.is_retryable());
        assert!(!StoreError::WriteConflict { key_hash: 1 }.is_retryable());
    }

    #[test]
    fn test_replication_error_classification() {
        assert!(ReplicationError::Transient { reason: "queue full".into() }.is_transient());
        assert!(!ReplicationError::NotPrimary.is_transient());
        assert!(!ReplicationError::Closed.is_transient());
    }

    #[test]
    fn test_not_primary_selectors_build_distinct_errors() {
        let store_err: StoreError = NotPrimarySnafu.build();
        let replication_err: ReplicationError = replication::NotPrimarySnafu.build();
        assert!(matches!(store_err, StoreError::NotPrimary));
        assert_eq!(replication_err, ReplicationError::NotPrimary);
        assert_ne!(store_err.to_string(), replication_err.to_string());
    }

    #[test]
    fn test_write_conflict_display_contains_key_hash() {
        let err = StoreError::WriteConflict { key_hash: 0xabcd };
        assert!(err.to_string().contains("0x000000000000abcd"));
    }

    #[test]
    fn test_store_error_into_io_error_keeps_timeout_kind() {
        let io_err: io::Error = StoreError::Timeout { duration_ms: 5 }.into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    #[should_panic(expected = "count went negative")]
    fn test_invariant_panics_with_message() {
        let count = -1;
        invariant!(count >= 0, "count went negative: {}", count);
    }
}
