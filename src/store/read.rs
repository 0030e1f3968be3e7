//! Reads: layered version resolution, lazy value loads, and the client read
//! operations.

use std::collections::BTreeSet;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Store;
use crate::enumeration::KeyEnumerator;
use crate::enumeration::StoreEnumerator;
use crate::error::Result;
use crate::error::StoreError;
use crate::item::VersionedItem;
use crate::key::decode;
use crate::key::key_hash;
use crate::key::StoreKey;
use crate::key::StoreValue;
use crate::lock::Deadline;
use crate::lock::LockMode;
use crate::lock::PrimeLockMode;
use crate::metadata::FileMetadata;
use crate::replicator::TransactionHandle;
use crate::snapshot::SnapshotRegistration;
use crate::transaction::IsolationLevel;
use crate::transaction::ReadMode;
use crate::transaction::StoreTransaction;

/// Attempts to find a locator's file before reporting corruption. A merge
/// can move an item between files while a load is in flight.
const MAX_LOCATE_ATTEMPTS: u32 = 3;

/// A value together with the sequence number that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue<V> {
    pub version: i64,
    pub value: V,
}

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Read `key` within `txn`.
    ///
    /// Returns the transaction's own uncommitted write first. Otherwise a
    /// read-repeatable transaction takes a shared key lock held until it
    /// completes, and a snapshot transaction reads committed state as of the
    /// visibility sequence number pinned by its first read.
    pub async fn conditional_get(
        &self,
        txn: &TransactionHandle,
        key: &K,
        timeout: Duration,
        read_mode: ReadMode,
        cancel: &CancellationToken,
    ) -> Result<Option<VersionedValue<V>>> {
        let Some(item) = self.read_item(txn, key, Deadline::after(timeout), cancel).await? else {
            return Ok(None);
        };
        if item.is_deleted() {
            return Ok(None);
        }
        let value = self.load_value(&item, read_mode).await?;
        Ok(Some(VersionedValue {
            version: item.lsn(),
            value: (*value).clone(),
        }))
    }

    /// True if `key` has a live version visible to `txn`.
    pub async fn contains_key(
        &self,
        txn: &TransactionHandle,
        key: &K,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let item = self.read_item(txn, key, Deadline::after(timeout), cancel).await?;
        Ok(item.map(|item| !item.is_deleted()).unwrap_or(false))
    }

    /// Lazily enumerate live keys in `range`, in key order, as of the
    /// transaction's snapshot (or the current visibility sequence number).
    pub fn create_key_enumerator<R: RangeBounds<K>>(
        &self,
        txn: &TransactionHandle,
        range: R,
    ) -> Result<KeyEnumerator<'_, K, V>> {
        let (keys, registration) = self.enumeration_keys(txn, &range)?;
        Ok(KeyEnumerator::new(self, keys, registration))
    }

    /// Lazily enumerate live key-value pairs in `range`, in key order.
    pub fn create_enumerator<R: RangeBounds<K>>(
        &self,
        txn: &TransactionHandle,
        range: R,
    ) -> Result<StoreEnumerator<'_, K, V>> {
        let (keys, registration) = self.enumeration_keys(txn, &range)?;
        Ok(StoreEnumerator::new(self, keys, registration))
    }

    fn enumeration_keys<R: RangeBounds<K>>(
        &self,
        txn: &TransactionHandle,
        range: &R,
    ) -> Result<(Vec<K>, SnapshotRegistration<K, V>)> {
        self.check_readable()?;
        let store_txn = self.transaction(txn);
        let snapshots = self.snapshots.load_full();
        let registration = match (txn.isolation(), store_txn.snapshot_lsn()) {
            (IsolationLevel::Snapshot, Some(lsn)) => snapshots.register(lsn),
            _ => snapshots.register_visible(|| self.replicator.visibility_sequence_number()),
        };
        let lsn = registration.lsn();

        let mut keys: BTreeSet<K> = self.consolidation.load().keys_in_range(range);
        keys.extend(self.differential.load().keys_in_range(range));
        keys.extend(snapshots.keys_in_range(lsn, range));
        debug!(store = %self.name, visibility_lsn = lsn, candidates = keys.len(), "created enumerator");
        Ok((keys.into_iter().collect(), registration))
    }

    async fn read_item(
        &self,
        txn: &TransactionHandle,
        key: &K,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<VersionedItem<V>>>> {
        self.check_readable()?;
        let store_txn = self.transaction(txn);
        if let Some(item) = store_txn.write_set_get(key) {
            return Ok(Some(item));
        }

        match txn.isolation() {
            IsolationLevel::Snapshot => {
                let lsn = match store_txn.snapshot_lsn() {
                    Some(lsn) => lsn,
                    None => store_txn.pin_snapshot(
                        self.snapshots
                            .load_full()
                            .register_visible(|| self.replicator.visibility_sequence_number()),
                    ),
                };
                Ok(self.resolve_at(key, lsn))
            }
            IsolationLevel::ReadRepeatable => {
                let (_, hash) = key_hash(key)?;
                self.lock_key(&store_txn, hash, LockMode::Shared, deadline, cancel).await?;
                // Access may have been revoked while waiting.
                self.check_readable()?;
                Ok(self.resolve_latest(key))
            }
        }
    }

    /// Take the transaction's shared prime lock (once) and a key lock.
    pub(super) async fn lock_key(
        &self,
        txn: &StoreTransaction<K, V>,
        key_hash: u64,
        mode: LockMode,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !txn.holds_prime_lock() {
            let guard = self.lock_manager.acquire_prime_lock(PrimeLockMode::Shared, deadline, cancel).await?;
            txn.set_prime_lock(guard);
        }
        self.lock_manager.acquire_key_lock(txn.id(), key_hash, mode, deadline, cancel).await?;
        txn.track_key_lock(key_hash);
        Ok(())
    }

    // ========================================================================
    // Version resolution
    // ========================================================================

    /// Newest committed version of `key`: differential, then aggregated
    /// deltas, then the consolidated map.
    pub(crate) fn resolve_latest(&self, key: &K) -> Option<Arc<VersionedItem<V>>> {
        self.differential.load().read(key).or_else(|| self.consolidation.load().read(key))
    }

    /// Newest committed version of `key` with `lsn <= visibility_lsn`.
    pub(crate) fn resolve_at(&self, key: &K, visibility_lsn: i64) -> Option<Arc<VersionedItem<V>>> {
        self.snapshots
            .load()
            .read(visibility_lsn, key)
            .or_else(|| self.differential.load().read_at(key, visibility_lsn))
            .or_else(|| self.consolidation.load().read_at(key, visibility_lsn))
    }

    // ========================================================================
    // Value loading
    // ========================================================================

    /// Value of a live version, loading it from its checkpoint file if it
    /// was never resident or has been swept.
    pub(crate) async fn load_value(&self, item: &Arc<VersionedItem<V>>, mode: ReadMode) -> Result<Arc<V>> {
        if let Some(value) = item.value() {
            return Ok(value);
        }
        let _load = item.load_lock().lock().await;
        if let Some(value) = item.value() {
            return Ok(value);
        }

        let mut attempts = 0;
        loop {
            let Some(locator) = item.locator() else {
                return Err(StoreError::InvalidState {
                    reason: format!("version at lsn {} has neither a value nor a locator", item.lsn()),
                });
            };
            if let Some(file) = self.find_file(locator.file_id) {
                let bytes = file.read_value(locator).await?;
                let value: Arc<V> = Arc::new(decode(&bytes)?);
                if mode == ReadMode::CacheResult {
                    item.set_value(Arc::clone(&value));
                }
                return Ok(value);
            }
            attempts += 1;
            if attempts >= MAX_LOCATE_ATTEMPTS {
                return Err(StoreError::Corruption {
                    reason: format!(
                        "checkpoint file {} for version at lsn {} is not referenced by any metadata table",
                        locator.file_id,
                        item.lsn()
                    ),
                });
            }
            tokio::task::yield_now().await;
        }
    }

    /// Look `file_id` up in the merge, next, and current tables.
    fn find_file(&self, file_id: u32) -> Option<Arc<FileMetadata>> {
        [&self.merge, &self.next, &self.current]
            .into_iter()
            .filter_map(|generation| generation.load_full())
            .find_map(|table| table.get(file_id).cloned())
    }
}
