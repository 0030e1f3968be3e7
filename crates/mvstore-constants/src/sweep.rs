//! Sweep (value eviction) defaults.

/// Memory budget above which cached values are evicted (256 MB).
pub const DEFAULT_SWEEP_THRESHOLD_BYTES: u64 = 256 * 1024 * 1024;

/// Interval between background sweep passes (5 seconds).
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;

/// Maximum number of items inspected in one sweep pass.
///
/// Tiger Style: Bounds the time a single pass holds the consolidated view.
pub const MAX_SWEEP_ITEMS_PER_PASS: usize = 100_000;
