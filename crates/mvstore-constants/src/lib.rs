//! Centralized constants for the mvstore storage engine.
//!
//! This crate contains the fixed names, defaults, and bounds used throughout
//! the engine, organized by category for easy discovery and maintenance.
//!
//! Tiger Style: Constants are fixed and immutable, enforced at compile time.
//! Each constant has explicit bounds to prevent unbounded resource allocation.
//!
//! # Modules
//!
//! - [`storage`]: On-disk layout (metadata file names, checkpoint suffixes, versions)
//! - [`checkpoint`]: Consolidation and merge thresholds
//! - [`lock`]: Lock manager timeouts and bucket bounds
//! - [`replication`]: Append retry backoff bounds
//! - [`copy`]: Copy stream chunking
//! - [`sweep`]: Value eviction budget
//!
//! # Usage
//!
//! ```
//! use mvstore_constants::storage::CURRENT_METADATA_FILE_NAME;
//! use mvstore_constants::prelude::*;
//! ```

mod assertions;
pub mod checkpoint;
pub mod copy;
pub mod lock;
pub mod replication;
pub mod storage;
pub mod sweep;

/// Prelude module for commonly used constants.
pub mod prelude {
    pub use crate::checkpoint::DEFAULT_DELTAS_TO_CONSOLIDATE;
    pub use crate::checkpoint::DEFAULT_MERGE_FILE_COUNT_THRESHOLD;
    pub use crate::checkpoint::DEFAULT_MERGE_INVALID_ENTRIES_PERCENT;
    pub use crate::lock::DEFAULT_LOCK_TIMEOUT_MS;
    pub use crate::replication::REPLICATION_RETRY_INITIAL_BACKOFF_MS;
    pub use crate::replication::REPLICATION_RETRY_MAX_BACKOFF_MS;
    pub use crate::storage::INVALID_LSN;
    pub use crate::storage::ZERO_LSN;
}

pub use storage::INVALID_LSN;
pub use storage::ZERO_LSN;
