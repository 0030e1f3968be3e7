//! Copy stream chunking.

/// Default size of a file data chunk in the copy stream (512 KB).
pub const DEFAULT_COPY_CHUNK_SIZE_BYTES: u32 = 512 * 1024;

/// Upper bound for a file data chunk (16 MB).
pub const MAX_COPY_CHUNK_SIZE_BYTES: u32 = 16 * 1024 * 1024;

/// Default number of items per volatile copy batch.
pub const DEFAULT_COPY_VOLATILE_BATCH_ITEMS: u32 = 1_024;

/// Copy stream format version.
pub const COPY_PROTOCOL_VERSION: u32 = 1;
