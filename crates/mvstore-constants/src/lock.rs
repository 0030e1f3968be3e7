//! Lock manager bounds.

/// Default timeout for key and prime lock acquisition (4 seconds).
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 4_000;

/// Default timeout for the internal metadata table swap lock (30 seconds).
pub const DEFAULT_METADATA_TABLE_LOCK_TIMEOUT_MS: u64 = 30_000;

/// Default bounded wait for in-flight work to drain on close (10 seconds).
pub const DEFAULT_CLOSE_DRAIN_TIMEOUT_MS: u64 = 10_000;

/// Maximum number of key locks a single transaction may hold.
///
/// Tiger Style: Transactions are single-key in practice; this bound catches
/// runaway lock accumulation.
pub const MAX_KEY_LOCKS_PER_TRANSACTION: usize = 1_024;
