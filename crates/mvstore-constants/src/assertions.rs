//! Compile-time constant assertions.
//!
//! Each assertion verifies a relationship between constants that must hold
//! for correct engine operation.

use super::checkpoint::*;
use super::copy::*;
use super::lock::*;
use super::replication::*;
use super::storage::*;
use super::sweep::*;

// ============================================================================
// Sequence Numbers
// ============================================================================

const _: () = assert!(INVALID_LSN < ZERO_LSN);

// ============================================================================
// Consolidation and Merge
// ============================================================================

const _: () = assert!(DEFAULT_DELTAS_TO_CONSOLIDATE > 0);
const _: () = assert!(DEFAULT_DELTAS_TO_CONSOLIDATE <= MAX_DELTAS_TO_CONSOLIDATE);
const _: () = assert!(DEFAULT_MERGE_FILE_COUNT_THRESHOLD >= 2);
const _: () = assert!(DEFAULT_MERGE_FILE_COUNT_THRESHOLD <= MAX_FILES_PER_TABLE);
const _: () = assert!(DEFAULT_MERGE_INVALID_ENTRIES_PERCENT > 0);
const _: () = assert!(DEFAULT_MERGE_INVALID_ENTRIES_PERCENT <= 100);
const _: () = assert!(MIN_FILES_FOR_INVALID_ENTRY_MERGE >= 2);
const _: () = assert!(DEFAULT_MAX_INFLIGHT_VALUE_LOADS > 0);
const _: () = assert!(DEFAULT_MAX_INFLIGHT_VALUE_LOADS <= MAX_INFLIGHT_VALUE_LOADS);

// ============================================================================
// Timeouts
// ============================================================================
// The metadata swap must outlast an ordinary lock wait, and close must give
// in-flight operations at least one lock timeout to drain.

const _: () = assert!(DEFAULT_LOCK_TIMEOUT_MS > 0);
const _: () = assert!(DEFAULT_METADATA_TABLE_LOCK_TIMEOUT_MS >= DEFAULT_LOCK_TIMEOUT_MS);
const _: () = assert!(DEFAULT_CLOSE_DRAIN_TIMEOUT_MS >= DEFAULT_LOCK_TIMEOUT_MS);
const _: () = assert!(REPLICATION_RETRY_INITIAL_BACKOFF_MS > 0);
const _: () = assert!(REPLICATION_RETRY_INITIAL_BACKOFF_MS < REPLICATION_RETRY_MAX_BACKOFF_MS);
const _: () = assert!(MAX_KEY_LOCKS_PER_TRANSACTION > 0);

// ============================================================================
// Copy and Sweep
// ============================================================================

const _: () = assert!(DEFAULT_COPY_CHUNK_SIZE_BYTES > 0);
const _: () = assert!(DEFAULT_COPY_CHUNK_SIZE_BYTES <= MAX_COPY_CHUNK_SIZE_BYTES);
const _: () = assert!(DEFAULT_COPY_VOLATILE_BATCH_ITEMS > 0);
const _: () = assert!(COPY_PROTOCOL_VERSION > 0);
const _: () = assert!(DEFAULT_SWEEP_THRESHOLD_BYTES > 0);
const _: () = assert!(DEFAULT_SWEEP_INTERVAL_MS > 0);
const _: () = assert!(MAX_SWEEP_ITEMS_PER_PASS > 0);

// ============================================================================
// File Formats
// ============================================================================

const _: () = assert!(CHECKSUM_SIZE == 32);
const _: () = assert!(METADATA_FILE_VERSION > 0);
const _: () = assert!(CHECKPOINT_FILE_VERSION > 0);
const _: () = assert!(MAX_VALUE_SIZE > 0);
