//! Client writes on the primary.
//!
//! Each write takes the transaction's shared prime lock and an exclusive key
//! lock, validates against the newest committed or own-uncommitted version,
//! replicates the operation, and records the result in the write-set. The
//! differential and the live-key count only change when the operation is
//! applied.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::Store;
use crate::error::ReplicationError;
use crate::error::Result;
use crate::error::StoreError;
use crate::item::VersionedItem;
use crate::key::encode;
use crate::key::key_hash;
use crate::key::StoreKey;
use crate::key::StoreValue;
use crate::lock::Deadline;
use crate::lock::LockMode;
use crate::operation::build_operation;
use crate::operation::StoreModification;
use crate::replicator::ReplicatedOperation;
use crate::replicator::TransactionHandle;
use crate::transaction::ReadMode;
use crate::transaction::StoreTransaction;

/// A locked key and its newest version visible to the writer.
struct LockedKey<K, V> {
    txn: Arc<StoreTransaction<K, V>>,
    key_bytes: Vec<u8>,
    key_hash: u64,
    current: Option<Arc<VersionedItem<V>>>,
}

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Insert a key that has no live version.
    ///
    /// Fails with `WriteConflict` if the key is live, as seen by this
    /// transaction.
    pub async fn add(
        &self,
        txn: &TransactionHandle,
        key: K,
        value: V,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let locked = self.lock_for_write(txn, &key, deadline, cancel).await?;
        if locked.current.as_ref().is_some_and(|item| !item.is_deleted()) {
            debug!(store = %self.name, txn_id = txn.id(), key_hash = locked.key_hash, "add on live key");
            return Err(StoreError::WriteConflict {
                key_hash: locked.key_hash,
            });
        }

        let value_bytes = encode(&value)?;
        let value_size = value_bytes.len() as u32;
        let operation = build_operation(StoreModification::Add, locked.key_bytes, Some(value_bytes), None)?;
        let lsn = self.replicate(txn, operation, locked.key_hash, deadline, cancel).await?;

        locked
            .txn
            .write_set_put(key, Arc::new(VersionedItem::inserted(lsn, Arc::new(value), value_size)));
        Ok(())
    }

    /// Replace the value of a live key.
    ///
    /// Returns `false` without writing if the key has no live version or
    /// `conditional_version` is set and differs from the current version.
    pub async fn conditional_update(
        &self,
        txn: &TransactionHandle,
        key: &K,
        value: V,
        timeout: Duration,
        conditional_version: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let deadline = Deadline::after(timeout);
        let locked = self.lock_for_write(txn, key, deadline, cancel).await?;
        let Some(current) = Self::check_condition(&locked, conditional_version) else {
            return Ok(false);
        };

        let previous = encode(&*self.load_value(&current, ReadMode::Off).await?)?;
        let value_bytes = encode(&value)?;
        let value_size = value_bytes.len() as u32;
        let operation = build_operation(StoreModification::Update, locked.key_bytes, Some(value_bytes), Some(previous))?;
        let lsn = self.replicate(txn, operation, locked.key_hash, deadline, cancel).await?;

        locked
            .txn
            .write_set_put(key.clone(), Arc::new(VersionedItem::updated(lsn, Arc::new(value), value_size)));
        Ok(true)
    }

    /// Remove a live key.
    ///
    /// Returns `false` without writing under the same conditions as
    /// [`Store::conditional_update`].
    pub async fn conditional_remove(
        &self,
        txn: &TransactionHandle,
        key: &K,
        timeout: Duration,
        conditional_version: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let deadline = Deadline::after(timeout);
        let locked = self.lock_for_write(txn, key, deadline, cancel).await?;
        let Some(current) = Self::check_condition(&locked, conditional_version) else {
            return Ok(false);
        };

        let previous = encode(&*self.load_value(&current, ReadMode::Off).await?)?;
        let operation = build_operation(StoreModification::Remove, locked.key_bytes, None, Some(previous))?;
        let lsn = self.replicate(txn, operation, locked.key_hash, deadline, cancel).await?;

        locked.txn.write_set_put(key.clone(), Arc::new(VersionedItem::deleted(lsn)));
        Ok(true)
    }

    fn check_condition(locked: &LockedKey<K, V>, conditional_version: Option<i64>) -> Option<Arc<VersionedItem<V>>> {
        let current = locked.current.as_ref().filter(|item| !item.is_deleted())?;
        if conditional_version.is_some_and(|version| version != current.lsn()) {
            return None;
        }
        Some(Arc::clone(current))
    }

    async fn lock_for_write(
        &self,
        txn: &TransactionHandle,
        key: &K,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<LockedKey<K, V>> {
        self.check_writable()?;
        let (key_bytes, key_hash) = key_hash(key)?;
        let store_txn = self.transaction(txn);

        if let Err(e) = self.lock_key(&store_txn, key_hash, LockMode::Exclusive, deadline, cancel).await {
            debug!(store = %self.name, txn_id = txn.id(), key_hash, error = %e, "write lock not acquired");
            return Err(e);
        }
        self.check_writable()?;

        let current = store_txn.write_set_get(key).or_else(|| self.resolve_latest(key));
        Ok(LockedKey {
            txn: store_txn,
            key_bytes,
            key_hash,
            current,
        })
    }

    /// Append `operation`, retrying transient failures with exponential
    /// backoff until the deadline.
    async fn replicate(
        &self,
        txn: &TransactionHandle,
        operation: ReplicatedOperation,
        key_hash: u64,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let mut backoff = self.config.replication_retry_initial_backoff;
        let mut attempt = 0u32;
        loop {
            self.check_writable()?;
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            match self.replicator.append(txn, operation.clone()).await {
                Ok(lsn) => return Ok(lsn),
                Err(ReplicationError::Transient { reason }) => {
                    attempt += 1;
                    let remaining = deadline.remaining();
                    if remaining.is_zero() {
                        warn!(store = %self.name, txn_id = txn.id(), key_hash, attempt, %reason, "replication retries exhausted");
                        return Err(deadline.timeout_error());
                    }
                    debug!(store = %self.name, txn_id = txn.id(), attempt, %reason, ?backoff, "retrying append");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                        _ = tokio::time::sleep(backoff.min(remaining)) => {}
                    }
                    backoff = (backoff * 2).min(self.config.replication_retry_max_backoff);
                }
                Err(ReplicationError::NotPrimary) => {
                    warn!(store = %self.name, txn_id = txn.id(), key_hash, "append rejected, replica is not primary");
                    return Err(StoreError::NotPrimary);
                }
                Err(ReplicationError::Closed) => return Err(self.closed_error()),
                Err(ReplicationError::Failed { reason }) => {
                    warn!(store = %self.name, txn_id = txn.id(), key_hash, %reason, "replication failed");
                    return Err(StoreError::Replication { reason });
                }
            }
        }
    }
}
