//! On-disk layout constants.
//!
//! Every store instance owns one working directory holding a single metadata
//! table file (in up to three crash-safety incarnations) and zero or more
//! immutable checkpoint file pairs.

// ============================================================================
// Sequence Numbers
// ============================================================================

/// Sentinel for "no sequence number".
///
/// Used as the checkpoint LSN of a table that has not been checkpointed and
/// as the version of items that were never committed.
pub const INVALID_LSN: i64 = -1;

/// Checkpoint LSN of a freshly created empty store.
pub const ZERO_LSN: i64 = 0;

// ============================================================================
// Metadata Table Files
// ============================================================================

/// File name of the authoritative metadata table.
pub const CURRENT_METADATA_FILE_NAME: &str = "current_metadata";

/// File name of a metadata table being written, promoted on completion.
pub const TEMP_METADATA_FILE_NAME: &str = "temp_metadata";

/// File name of the previous metadata table while a replace is in progress.
pub const BACKUP_METADATA_FILE_NAME: &str = "backup_metadata";

/// Magic prefix of every metadata table file.
pub const METADATA_FILE_MAGIC: [u8; 8] = *b"MVSTMETA";

/// On-disk format version of the metadata table file.
pub const METADATA_FILE_VERSION: u32 = 1;

// ============================================================================
// Checkpoint Files
// ============================================================================

/// Suffix of key checkpoint files.
pub const KEY_CHECKPOINT_FILE_SUFFIX: &str = ".sptr";

/// Suffix of value checkpoint files.
pub const VALUE_CHECKPOINT_FILE_SUFFIX: &str = ".sptv";

/// Magic prefix of every key checkpoint file.
pub const KEY_FILE_MAGIC: [u8; 8] = *b"MVSTKEYS";

/// On-disk format version of checkpoint files.
pub const CHECKPOINT_FILE_VERSION: u32 = 1;

/// Size of the blake3 digest trailing every checksummed file (32 bytes).
pub const CHECKSUM_SIZE: usize = 32;

/// Maximum number of files a single metadata table may reference.
///
/// Tiger Style: Bounds recovery work and the size of the metadata file.
pub const MAX_FILES_PER_TABLE: u32 = 4_096;

/// Maximum size of a single serialized value stored in a value file (64 MB).
pub const MAX_VALUE_SIZE: u64 = 64 * 1024 * 1024;
