//! Per-transaction state owned by the store.
//!
//! One [`StoreTransaction`] exists per in-flight replicated transaction id.
//! It holds the uncommitted write-set, the key locks taken on its behalf, its
//! shared prime lock, and (for snapshot isolation) the visibility sequence
//! number its reads are pinned to.

use std::collections::BTreeMap;
use std::sync::Arc;

use mvstore_constants::lock::MAX_KEY_LOCKS_PER_TRANSACTION;
use parking_lot::Mutex;

use crate::item::VersionedItem;
use crate::lock::LockManager;
use crate::lock::PrimeLockGuard;
use crate::replicator::TransactionHandle;
use crate::snapshot::SnapshotRegistration;

/// Read isolation of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Reads take shared key locks held until the transaction completes.
    #[default]
    ReadRepeatable,
    /// Reads see committed state as of a visibility sequence number, without
    /// key locks.
    Snapshot,
}

/// Whether a value loaded from disk is kept in memory afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadMode {
    #[default]
    CacheResult,
    Off,
}

/// Store-side state of one replicated transaction.
pub struct StoreTransaction<K, V> {
    handle: TransactionHandle,
    write_set: Mutex<BTreeMap<K, Arc<VersionedItem<V>>>>,
    key_locks: Mutex<Vec<u64>>,
    prime: Mutex<Option<PrimeLockGuard>>,
    snapshot: Mutex<Option<SnapshotRegistration<K, V>>>,
}

impl<K: Ord + Clone, V> StoreTransaction<K, V> {
    pub fn new(handle: TransactionHandle) -> Self {
        Self {
            handle,
            write_set: Mutex::new(BTreeMap::new()),
            key_locks: Mutex::new(Vec::new()),
            prime: Mutex::new(None),
            snapshot: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn handle(&self) -> &TransactionHandle {
        &self.handle
    }

    /// Latest uncommitted version of `key` written by this transaction.
    pub fn write_set_get(&self, key: &K) -> Option<Arc<VersionedItem<V>>> {
        self.write_set.lock().get(key).cloned()
    }

    pub fn write_set_put(&self, key: K, item: Arc<VersionedItem<V>>) {
        self.write_set.lock().insert(key, item);
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.lock().len()
    }

    pub fn holds_prime_lock(&self) -> bool {
        self.prime.lock().is_some()
    }

    /// Keep a shared prime lock for the transaction's lifetime. A second
    /// guard is dropped immediately.
    pub fn set_prime_lock(&self, guard: PrimeLockGuard) {
        let mut prime = self.prime.lock();
        if prime.is_none() {
            *prime = Some(guard);
        }
    }

    /// Record a key lock to release on unlock.
    pub fn track_key_lock(&self, key_hash: u64) {
        let mut locks = self.key_locks.lock();
        if !locks.contains(&key_hash) {
            debug_assert!(
                locks.len() < MAX_KEY_LOCKS_PER_TRANSACTION,
                "TXN: transaction {} exceeds {} key locks",
                self.handle.id(),
                MAX_KEY_LOCKS_PER_TRANSACTION
            );
            locks.push(key_hash);
        }
    }

    pub fn key_lock_count(&self) -> usize {
        self.key_locks.lock().len()
    }

    /// Visibility sequence number pinned by the first snapshot read.
    pub fn snapshot_lsn(&self) -> Option<i64> {
        self.snapshot.lock().as_ref().map(|registration| registration.lsn())
    }

    /// Pin snapshot reads to `registration` unless already pinned. Returns the
    /// pinned sequence number.
    pub fn pin_snapshot(&self, registration: SnapshotRegistration<K, V>) -> i64 {
        let mut snapshot = self.snapshot.lock();
        match snapshot.as_ref() {
            Some(existing) => existing.lsn(),
            None => {
                let lsn = registration.lsn();
                *snapshot = Some(registration);
                lsn
            }
        }
    }

    /// Release everything the transaction holds: key locks, prime lock,
    /// snapshot pin, and the write-set.
    pub fn unlock(&self, locks: &LockManager) {
        let key_locks = std::mem::take(&mut *self.key_locks.lock());
        locks.release_key_locks(self.handle.id(), &key_locks);
        self.prime.lock().take();
        self.snapshot.lock().take();
        self.write_set.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::lock::Deadline;
    use crate::lock::LockMode;

    #[tokio::test]
    async fn test_unlock_releases_tracked_key_locks() {
        let locks = LockManager::new("test");
        let cancel = CancellationToken::new();
        let txn: StoreTransaction<String, u64> = StoreTransaction::new(TransactionHandle::new(1));

        let deadline = Deadline::after(Duration::from_millis(50));
        locks.acquire_key_lock(1, 11, LockMode::Exclusive, deadline, &cancel).await.unwrap();
        txn.track_key_lock(11);
        txn.track_key_lock(11);
        assert_eq!(txn.key_lock_count(), 1);

        txn.write_set_put("a".into(), Arc::new(VersionedItem::inserted(1, Arc::new(1), 8)));
        txn.unlock(&locks);

        assert_eq!(txn.key_lock_count(), 0);
        assert_eq!(txn.write_set_len(), 0);
        locks.acquire_key_lock(2, 11, LockMode::Exclusive, deadline, &cancel).await.unwrap();
    }

    #[test]
    fn test_write_set_keeps_latest_version() {
        let txn: StoreTransaction<String, u64> = StoreTransaction::new(TransactionHandle::new(1));
        txn.write_set_put("a".into(), Arc::new(VersionedItem::inserted(1, Arc::new(1), 8)));
        txn.write_set_put("a".into(), Arc::new(VersionedItem::deleted(2)));
        let item = txn.write_set_get(&"a".to_string()).unwrap();
        assert!(item.is_deleted());
        assert_eq!(item.lsn(), 2);
    }
}
