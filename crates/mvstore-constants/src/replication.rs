//! Replication append retry policy.

/// First backoff after a transient replication failure (16 ms).
pub const REPLICATION_RETRY_INITIAL_BACKOFF_MS: u64 = 16;

/// Cap for exponential backoff between append retries (4 seconds).
pub const REPLICATION_RETRY_MAX_BACKOFF_MS: u64 = 4_000;
