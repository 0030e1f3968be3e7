//! Errors the replication layer reports back on append.
//!
//! Lives in its own module: snafu generates one context selector per
//! variant, and both this enum and [`StoreError`](super::StoreError) have a
//! `NotPrimary` variant.

use snafu::Snafu;

/// Errors reported by the replication layer on append.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum ReplicationError {
    /// Retry may succeed (e.g. queue full, reconfiguration in flight).
    #[snafu(display("transient replication failure: {reason}"))]
    Transient {
        /// Reason reported by the replicator.
        reason: String,
    },

    /// The replica lost its primary role.
    #[snafu(display("replica is not primary"))]
    NotPrimary,

    /// The replicator is closed.
    #[snafu(display("replicator is closed"))]
    Closed,

    /// Permanent failure.
    #[snafu(display("replication failed: {reason}"))]
    Failed {
        /// Reason reported by the replicator.
        reason: String,
    },
}

impl ReplicationError {
    /// Returns true if the append should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplicationError::Transient { .. })
    }
}
