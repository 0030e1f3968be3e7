//! Checkpoint, consolidation, and merge defaults.
//!
//! All of these are defaults for tunables in the store configuration; the
//! engine never reads them directly outside of `Default` impls.

// ============================================================================
// Consolidation
// ============================================================================

/// Number of aggregated deltas folded into the consolidated view per pass.
pub const DEFAULT_DELTAS_TO_CONSOLIDATE: u32 = 3;

/// Upper bound on deltas folded in a single pass.
pub const MAX_DELTAS_TO_CONSOLIDATE: u32 = 64;

// ============================================================================
// Merge Policy
// ============================================================================

/// Number of checkpoint files that triggers a full merge.
pub const DEFAULT_MERGE_FILE_COUNT_THRESHOLD: u32 = 16;

/// Percentage of superseded or deleted entries that triggers a full merge.
pub const DEFAULT_MERGE_INVALID_ENTRIES_PERCENT: u32 = 50;

/// Minimum number of files before the invalid-entry policy is consulted.
///
/// A single file never merges on invalid entries alone: only tombstones
/// could be dropped and the next checkpoint would recreate the file.
pub const MIN_FILES_FOR_INVALID_ENTRY_MERGE: u32 = 2;

// ============================================================================
// Recovery
// ============================================================================

/// Default number of concurrent value loads while pre-loading on recovery.
pub const DEFAULT_MAX_INFLIGHT_VALUE_LOADS: u32 = 16;

/// Upper bound for concurrent value loads on recovery.
pub const MAX_INFLIGHT_VALUE_LOADS: u32 = 1_024;
