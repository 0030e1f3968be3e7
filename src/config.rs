//! Store configuration.
//!
//! All tunables are passed explicitly at construction; there is no global
//! configuration. Millisecond fields are the serialized form; the matching
//! `Duration` fields are computed by [`StoreConfig::finalize`].

use std::path::Path;
use std::time::Duration;

use mvstore_constants::checkpoint::DEFAULT_DELTAS_TO_CONSOLIDATE;
use mvstore_constants::checkpoint::DEFAULT_MAX_INFLIGHT_VALUE_LOADS;
use mvstore_constants::checkpoint::DEFAULT_MERGE_FILE_COUNT_THRESHOLD;
use mvstore_constants::checkpoint::DEFAULT_MERGE_INVALID_ENTRIES_PERCENT;
use mvstore_constants::checkpoint::MAX_DELTAS_TO_CONSOLIDATE;
use mvstore_constants::checkpoint::MAX_INFLIGHT_VALUE_LOADS;
use mvstore_constants::copy::DEFAULT_COPY_CHUNK_SIZE_BYTES;
use mvstore_constants::copy::DEFAULT_COPY_VOLATILE_BATCH_ITEMS;
use mvstore_constants::copy::MAX_COPY_CHUNK_SIZE_BYTES;
use mvstore_constants::lock::DEFAULT_CLOSE_DRAIN_TIMEOUT_MS;
use mvstore_constants::lock::DEFAULT_LOCK_TIMEOUT_MS;
use mvstore_constants::lock::DEFAULT_METADATA_TABLE_LOCK_TIMEOUT_MS;
use mvstore_constants::replication::REPLICATION_RETRY_INITIAL_BACKOFF_MS;
use mvstore_constants::replication::REPLICATION_RETRY_MAX_BACKOFF_MS;
use mvstore_constants::storage::MAX_FILES_PER_TABLE;
use mvstore_constants::sweep::DEFAULT_SWEEP_INTERVAL_MS;
use mvstore_constants::sweep::DEFAULT_SWEEP_THRESHOLD_BYTES;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::error::IoSnafu;
use crate::error::Result;
use crate::error::StoreError;

/// Configuration for a single store instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StoreConfig {
    /// Persist checkpoints to disk. A volatile store keeps everything in memory
    /// and transfers a full dump on copy.
    pub durable: bool,

    /// Run consolidation in a background task after each checkpoint instead of
    /// inline.
    pub enable_background_consolidation: bool,
    /// Number of aggregated deltas that triggers a consolidation pass.
    pub deltas_to_consolidate: u32,
    /// Number of checkpoint files that triggers a full merge.
    pub merge_file_count_threshold: u32,
    /// Share (percent) of superseded or deleted entries that triggers a full merge.
    pub merge_invalid_entries_percent: u32,

    /// Evict cached values when resident value bytes exceed the threshold.
    pub enable_sweep: bool,
    /// Memory budget for cached values in bytes.
    pub sweep_threshold_bytes: u64,
    /// Interval between background sweep passes in milliseconds.
    pub sweep_interval_ms: u64,

    /// Load all values into memory during recovery.
    pub load_values_on_recovery: bool,
    /// Concurrent value loads while pre-loading on recovery.
    pub max_inflight_value_loads: u32,

    /// Default key and prime lock timeout in milliseconds.
    pub default_lock_timeout_ms: u64,
    /// Timeout for the internal metadata table swap lock in milliseconds.
    pub metadata_table_lock_timeout_ms: u64,
    /// Bounded wait for in-flight transactions to drain on close.
    pub close_drain_timeout_ms: u64,

    /// First backoff after a transient replication failure.
    pub replication_retry_initial_backoff_ms: u64,
    /// Cap on the backoff between replication retries.
    pub replication_retry_max_backoff_ms: u64,

    /// Size of file data chunks in the copy stream.
    pub copy_chunk_size_bytes: u32,
    /// Number of items per volatile copy chunk.
    pub copy_volatile_batch_items: u32,

    /// Computed from `default_lock_timeout_ms` (not serialized).
    #[serde(skip)]
    #[schemars(skip)]
    pub default_lock_timeout: Duration,
    /// Computed from `metadata_table_lock_timeout_ms` (not serialized).
    #[serde(skip)]
    #[schemars(skip)]
    pub metadata_table_lock_timeout: Duration,
    /// Computed from `close_drain_timeout_ms` (not serialized).
    #[serde(skip)]
    #[schemars(skip)]
    pub close_drain_timeout: Duration,
    /// Computed from `sweep_interval_ms` (not serialized).
    #[serde(skip)]
    #[schemars(skip)]
    pub sweep_interval: Duration,
    /// Computed from `replication_retry_initial_backoff_ms` (not serialized).
    #[serde(skip)]
    #[schemars(skip)]
    pub replication_retry_initial_backoff: Duration,
    /// Computed from `replication_retry_max_backoff_ms` (not serialized).
    #[serde(skip)]
    #[schemars(skip)]
    pub replication_retry_max_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            durable: true,
            enable_background_consolidation: true,
            deltas_to_consolidate: DEFAULT_DELTAS_TO_CONSOLIDATE,
            merge_file_count_threshold: DEFAULT_MERGE_FILE_COUNT_THRESHOLD,
            merge_invalid_entries_percent: DEFAULT_MERGE_INVALID_ENTRIES_PERCENT,
            enable_sweep: true,
            sweep_threshold_bytes: DEFAULT_SWEEP_THRESHOLD_BYTES,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            load_values_on_recovery: false,
            max_inflight_value_loads: DEFAULT_MAX_INFLIGHT_VALUE_LOADS,
            default_lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            metadata_table_lock_timeout_ms: DEFAULT_METADATA_TABLE_LOCK_TIMEOUT_MS,
            close_drain_timeout_ms: DEFAULT_CLOSE_DRAIN_TIMEOUT_MS,
            replication_retry_initial_backoff_ms: REPLICATION_RETRY_INITIAL_BACKOFF_MS,
            replication_retry_max_backoff_ms: REPLICATION_RETRY_MAX_BACKOFF_MS,
            copy_chunk_size_bytes: DEFAULT_COPY_CHUNK_SIZE_BYTES,
            copy_volatile_batch_items: DEFAULT_COPY_VOLATILE_BATCH_ITEMS,
            default_lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            metadata_table_lock_timeout: Duration::from_millis(DEFAULT_METADATA_TABLE_LOCK_TIMEOUT_MS),
            close_drain_timeout: Duration::from_millis(DEFAULT_CLOSE_DRAIN_TIMEOUT_MS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            replication_retry_initial_backoff: Duration::from_millis(REPLICATION_RETRY_INITIAL_BACKOFF_MS),
            replication_retry_max_backoff: Duration::from_millis(REPLICATION_RETRY_MAX_BACKOFF_MS),
        }
    }
}

impl StoreConfig {
    /// Durable store with default thresholds.
    pub fn durable() -> Self {
        Self::default()
    }

    /// In-memory store: no checkpoint files, no sweep.
    pub fn volatile() -> Self {
        Self {
            durable: false,
            enable_sweep: false,
            ..Self::default()
        }
    }

    /// Parse a TOML document and finalize it.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(input).map_err(|e| StoreError::Config { reason: e.to_string() })?;
        config.validate()?;
        Ok(config.finalize())
    }

    /// Load and finalize a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let input = std::fs::read_to_string(path).context(IoSnafu { path })?;
        Self::from_toml_str(&input)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| StoreError::Config { reason: e.to_string() })
    }

    /// Non-panicking bound checks for configuration loaded from outside.
    fn validate(&self) -> Result<()> {
        let check = |ok: bool, reason: &str| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(StoreError::Config {
                    reason: reason.to_string(),
                })
            }
        };
        check(
            self.deltas_to_consolidate > 0 && self.deltas_to_consolidate <= MAX_DELTAS_TO_CONSOLIDATE,
            "deltas_to_consolidate out of range",
        )?;
        check(
            self.merge_file_count_threshold >= 2 && self.merge_file_count_threshold <= MAX_FILES_PER_TABLE,
            "merge_file_count_threshold out of range",
        )?;
        check(
            self.merge_invalid_entries_percent > 0 && self.merge_invalid_entries_percent <= 100,
            "merge_invalid_entries_percent must be in 1..=100",
        )?;
        check(
            self.max_inflight_value_loads > 0 && self.max_inflight_value_loads <= MAX_INFLIGHT_VALUE_LOADS,
            "max_inflight_value_loads out of range",
        )?;
        check(
            self.copy_chunk_size_bytes > 0 && self.copy_chunk_size_bytes <= MAX_COPY_CHUNK_SIZE_BYTES,
            "copy_chunk_size_bytes out of range",
        )?;
        check(self.copy_volatile_batch_items > 0, "copy_volatile_batch_items must be > 0")?;
        check(
            self.replication_retry_initial_backoff_ms > 0
                && self.replication_retry_initial_backoff_ms <= self.replication_retry_max_backoff_ms,
            "replication backoff bounds are inverted",
        )
    }

    /// Finalize config by computing durations from millisecond fields.
    /// Call this after deserializing or after mutating fields directly.
    pub fn finalize(mut self) -> Self {
        // Tiger Style: thresholds must be positive and bounded
        assert!(self.deltas_to_consolidate > 0, "STORE_CONFIG: deltas_to_consolidate must be > 0");
        assert!(
            self.deltas_to_consolidate <= MAX_DELTAS_TO_CONSOLIDATE,
            "STORE_CONFIG: deltas_to_consolidate {} exceeds hard limit {}",
            self.deltas_to_consolidate,
            MAX_DELTAS_TO_CONSOLIDATE
        );
        assert!(
            self.merge_file_count_threshold >= 2,
            "STORE_CONFIG: merge_file_count_threshold must be >= 2"
        );
        assert!(
            self.merge_invalid_entries_percent > 0 && self.merge_invalid_entries_percent <= 100,
            "STORE_CONFIG: merge_invalid_entries_percent {} not in 1..=100",
            self.merge_invalid_entries_percent
        );
        assert!(
            self.max_inflight_value_loads > 0 && self.max_inflight_value_loads <= MAX_INFLIGHT_VALUE_LOADS,
            "STORE_CONFIG: max_inflight_value_loads {} out of range",
            self.max_inflight_value_loads
        );
        assert!(
            self.copy_chunk_size_bytes > 0 && self.copy_chunk_size_bytes <= MAX_COPY_CHUNK_SIZE_BYTES,
            "STORE_CONFIG: copy_chunk_size_bytes {} out of range",
            self.copy_chunk_size_bytes
        );
        assert!(self.copy_volatile_batch_items > 0, "STORE_CONFIG: copy_volatile_batch_items must be > 0");
        assert!(
            self.replication_retry_initial_backoff_ms > 0
                && self.replication_retry_initial_backoff_ms <= self.replication_retry_max_backoff_ms,
            "STORE_CONFIG: replication backoff bounds are inverted"
        );

        self.default_lock_timeout = Duration::from_millis(self.default_lock_timeout_ms);
        self.metadata_table_lock_timeout = Duration::from_millis(self.metadata_table_lock_timeout_ms);
        self.close_drain_timeout = Duration::from_millis(self.close_drain_timeout_ms);
        self.sweep_interval = Duration::from_millis(self.sweep_interval_ms);
        self.replication_retry_initial_backoff = Duration::from_millis(self.replication_retry_initial_backoff_ms);
        self.replication_retry_max_backoff = Duration::from_millis(self.replication_retry_max_backoff_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_durable() {
        let config = StoreConfig::default().finalize();
        assert!(config.durable);
        assert_eq!(config.deltas_to_consolidate, DEFAULT_DELTAS_TO_CONSOLIDATE);
        assert_eq!(config.default_lock_timeout, Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS));
    }

    #[test]
    fn test_volatile_preset_disables_sweep() {
        let config = StoreConfig::volatile();
        assert!(!config.durable);
        assert!(!config.enable_sweep);
    }

    #[test]
    fn test_from_toml_overrides_and_computes_durations() {
        let config = StoreConfig::from_toml_str(
            r#"
            durable = false
            default_lock_timeout_ms = 250
            sweep_interval_ms = 100
            "#,
        )
        .unwrap();
        assert!(!config.durable);
        assert_eq!(config.default_lock_timeout, Duration::from_millis(250));
        assert_eq!(config.sweep_interval, Duration::from_millis(100));
        // Unspecified fields keep their defaults.
        assert_eq!(config.merge_file_count_threshold, DEFAULT_MERGE_FILE_COUNT_THRESHOLD);
    }

    #[test]
    fn test_from_toml_rejects_out_of_range_values() {
        let err = StoreConfig::from_toml_str("merge_invalid_entries_percent = 0").unwrap_err();
        assert!(matches!(err, StoreError::Config { .. }));
    }

    #[test]
    fn test_toml_round_trip_preserves_fields() {
        let mut config = StoreConfig::volatile();
        config.deltas_to_consolidate = 7;
        let text = config.to_toml_string().unwrap();
        let parsed = StoreConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.deltas_to_consolidate, 7);
        assert!(!parsed.durable);
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.toml");
        std::fs::write(&path, "enable_sweep = false\n").unwrap();
        let config = StoreConfig::load(&path).unwrap();
        assert!(!config.enable_sweep);
    }

    #[test]
    fn test_json_schema_lists_durable() {
        let schema = schemars::schema_for!(StoreConfig);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("durable"));
        assert!(!json.contains("default_lock_timeout\""));
    }

    #[test]
    #[should_panic(expected = "STORE_CONFIG")]
    fn test_finalize_rejects_zero_deltas() {
        let config = StoreConfig {
            deltas_to_consolidate: 0,
            ..StoreConfig::default()
        };
        let _ = config.finalize();
    }
}
