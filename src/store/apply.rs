//! Applying replicated operations.
//!
//! | role      | redo                         | undo / false progress          |
//! |-----------|------------------------------|--------------------------------|
//! | primary   | fold write-set item          | nothing (write-set discarded)  |
//! | secondary | validate, fold               | roll back newest differential  |
//! | recovery  | fold if newer                | fold the inverse operation     |
//!
//! Operations at or below the current checkpoint are duplicates and skipped.
//! While a replica may be replaying operations it already holds (recovery,
//! catch-up after copy, or before the first checkpoint) an operation is only
//! folded if it is newer than the key's existing version.

use std::sync::Arc;

use mvstore_constants::INVALID_LSN;
use tracing::debug;
use tracing::warn;

use super::Store;
use crate::error::invariant;
use crate::error::Result;
use crate::error::StoreError;
use crate::item::is_live;
use crate::item::VersionedItem;
use crate::key::decode;
use crate::key::hash_key_bytes;
use crate::key::StoreKey;
use crate::key::StoreValue;
use crate::notification::ChangeEventMask;
use crate::operation::MetadataOperationData;
use crate::operation::RedoUndoOperationData;
use crate::operation::StoreModification;
use crate::operation::OPERATION_FORMAT_VERSION;
use crate::replicator::AccessStatus;
use crate::replicator::ApplyContext;
use crate::replicator::ApplyKind;
use crate::replicator::ApplyRole;
use crate::replicator::OperationContext;
use crate::replicator::TransactionHandle;
use crate::transaction::ReadMode;

/// Decoded record of one apply call.
struct AppliedRecord<K> {
    lsn: i64,
    modification: StoreModification,
    key: K,
    key_len: usize,
    key_hash: u64,
}

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Apply a committed (or undone) operation.
    ///
    /// `data` is the redo payload for redo and false progress, the undo
    /// payload for undo. The returned context must be passed to
    /// [`Store::unlock`] once the transaction finishes.
    pub async fn apply(
        &self,
        lsn: i64,
        txn: &TransactionHandle,
        context: ApplyContext,
        metadata: &[u8],
        data: Option<&[u8]>,
    ) -> Result<OperationContext> {
        self.check_open()?;
        self.check_has_state()?;

        let record = decode_record::<K>(lsn, metadata)?;
        let store_txn = self.transaction(txn);
        let operation_context = OperationContext {
            transaction_id: txn.id(),
        };

        match (context.role, context.kind) {
            (ApplyRole::Primary, ApplyKind::Redo) => {
                let item = match store_txn.write_set_get(&record.key) {
                    Some(item) if item.lsn() == lsn => item,
                    _ => Arc::new(self.item_from_redo(&record, data)?),
                };
                self.fold(txn, record, item, true).await?;
            }
            (ApplyRole::Primary, ApplyKind::Undo | ApplyKind::FalseProgress) => {
                debug!(store = %self.name, lsn, txn_id = txn.id(), "primary undo, write-set discarded on unlock");
            }
            (ApplyRole::Secondary | ApplyRole::Recovery, ApplyKind::Redo) => {
                self.apply_replicated(txn, record, context.role, data).await?;
            }
            (ApplyRole::Recovery, ApplyKind::Undo) => {
                self.apply_recovery_undo(txn, record, data).await?;
            }
            (ApplyRole::Secondary, ApplyKind::Undo) | (_, ApplyKind::FalseProgress) => {
                self.undo_false_progress(txn, record).await?;
            }
        }
        Ok(operation_context)
    }

    async fn apply_replicated(
        &self,
        txn: &TransactionHandle,
        record: AppliedRecord<K>,
        role: ApplyRole,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let checkpoint_lsn = self.checkpoint_lsn();
        if record.lsn <= checkpoint_lsn {
            debug!(store = %self.name, lsn = record.lsn, checkpoint_lsn, "skipping checkpointed operation");
            return Ok(());
        }

        let existing = self.resolve_latest(&record.key);
        let could_be_duplicate = role == ApplyRole::Recovery
            || self.replicator.read_status() != AccessStatus::Granted
            || checkpoint_lsn == INVALID_LSN;

        if could_be_duplicate {
            if let Some(existing) = &existing {
                if existing.lsn() >= record.lsn {
                    debug!(store = %self.name, lsn = record.lsn, existing_lsn = existing.lsn(), "skipping replayed operation");
                    return Ok(());
                }
            }
        } else {
            let live = is_live(existing.as_ref());
            let consistent = match record.modification {
                StoreModification::Add => !live,
                StoreModification::Update | StoreModification::Remove => live,
            };
            invariant!(
                consistent,
                "STORE: {:?} at lsn {} contradicts key {:#018x} in store {} (live: {})",
                record.modification,
                record.lsn,
                record.key_hash,
                self.name,
                live
            );
        }

        let item = Arc::new(self.item_from_redo(&record, data)?);
        self.fold(txn, record, item, false).await
    }

    /// Recovery undo: fold the inverse of the operation, stamped at its own
    /// sequence number.
    async fn apply_recovery_undo(
        &self,
        txn: &TransactionHandle,
        record: AppliedRecord<K>,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let checkpoint_lsn = self.checkpoint_lsn();
        if record.lsn <= checkpoint_lsn {
            debug!(store = %self.name, lsn = record.lsn, checkpoint_lsn, "skipping checkpointed undo");
            return Ok(());
        }

        let item = match record.modification {
            StoreModification::Add => VersionedItem::deleted(record.lsn),
            StoreModification::Update | StoreModification::Remove => {
                let previous = data
                    .map(RedoUndoOperationData::decode)
                    .transpose()?
                    .and_then(|undo| undo.value)
                    .ok_or_else(|| StoreError::Corruption {
                        reason: format!("{:?} at lsn {} has no undo value", record.modification, record.lsn),
                    })?;
                let value_size = previous.len() as u32;
                let value: V = decode(&previous)?;
                if record.modification == StoreModification::Update {
                    VersionedItem::updated(record.lsn, Arc::new(value), value_size)
                } else {
                    VersionedItem::inserted(record.lsn, Arc::new(value), value_size)
                }
            }
        };
        self.fold(txn, record, Arc::new(item), false).await
    }

    /// Roll back the newest differential version of the key.
    async fn undo_false_progress(&self, txn: &TransactionHandle, record: AppliedRecord<K>) -> Result<()> {
        let checkpoint_lsn = self.checkpoint_lsn();
        invariant!(
            record.lsn > checkpoint_lsn,
            "STORE: false progress at lsn {} is at or below checkpoint {} in store {}",
            record.lsn,
            checkpoint_lsn,
            self.name
        );

        let differential = self.differential.load_full();
        let Some(outcome) = differential.undo_false_progress(&record.key, record.lsn) else {
            warn!(
                store = %self.name,
                lsn = record.lsn,
                key_hash = record.key_hash,
                "no differential version to undo"
            );
            return Ok(());
        };

        let restored = outcome.restored.or_else(|| self.consolidation.load().read(&record.key));
        let was_live = !outcome.undone.is_deleted();
        let now_live = is_live(restored.as_ref());
        self.adjust_count(i64::from(now_live) - i64::from(was_live));
        debug!(
            store = %self.name,
            lsn = record.lsn,
            key_hash = record.key_hash,
            restored_lsn = restored.as_ref().map(|item| item.lsn()),
            "undid false progress"
        );

        let lsn = restored.as_ref().map(|item| item.lsn()).unwrap_or(record.lsn);
        self.notify_transition(txn, &record.key, was_live, restored.as_ref(), lsn, false)
            .await
    }

    /// Build the version a redo payload describes.
    fn item_from_redo(&self, record: &AppliedRecord<K>, data: Option<&[u8]>) -> Result<VersionedItem<V>> {
        if record.modification == StoreModification::Remove {
            return Ok(VersionedItem::deleted(record.lsn));
        }
        let bytes = data
            .map(RedoUndoOperationData::decode)
            .transpose()?
            .and_then(|redo| redo.value)
            .ok_or_else(|| StoreError::Corruption {
                reason: format!("{:?} at lsn {} has no redo value", record.modification, record.lsn),
            })?;
        let value_size = bytes.len() as u32;
        let value: V = decode(&bytes)?;
        Ok(match record.modification {
            StoreModification::Add => VersionedItem::inserted(record.lsn, Arc::new(value), value_size),
            _ => VersionedItem::updated(record.lsn, Arc::new(value), value_size),
        })
    }

    /// Make `item` the key's newest version, adjust the count by the change
    /// in liveness, and notify.
    async fn fold(
        &self,
        txn: &TransactionHandle,
        record: AppliedRecord<K>,
        item: Arc<VersionedItem<V>>,
        is_primary: bool,
    ) -> Result<()> {
        let existing = self.resolve_latest(&record.key);
        let was_live = is_live(existing.as_ref());
        let now_live = !item.is_deleted();

        self.add_to_differential(record.key.clone(), Arc::clone(&item)).await;
        self.adjust_count(i64::from(now_live) - i64::from(was_live));
        self.key_sizes.add_sample(record.key_len);

        self.notify_transition(txn, &record.key, was_live, Some(&item), item.lsn(), is_primary)
            .await
    }

    /// Insert into the mutable differential, retrying against its
    /// replacement if a prepare froze it first.
    pub(super) async fn add_to_differential(&self, key: K, item: Arc<VersionedItem<V>>) {
        loop {
            let differential = self.differential.load_full();
            match differential.add(key.clone(), Arc::clone(&item)) {
                Ok(displaced) => {
                    if let Some(displaced) = displaced {
                        let visible_lsn = self.replicator.visibility_sequence_number();
                        self.snapshots
                            .load()
                            .offer(&key, &displaced.item, displaced.replaced_by_lsn, visible_lsn);
                    }
                    return;
                }
                Err(_) => tokio::task::yield_now().await,
            }
        }
    }

    async fn notify_transition(
        &self,
        txn: &TransactionHandle,
        key: &K,
        was_live: bool,
        after: Option<&Arc<VersionedItem<V>>>,
        lsn: i64,
        is_primary: bool,
    ) -> Result<()> {
        let Some(registration) = self.change_handler.load_full() else {
            return Ok(());
        };
        let after = after.filter(|item| !item.is_deleted());
        match (was_live, after) {
            (false, Some(item)) if registration.wants(ChangeEventMask::ADDED) => {
                let value = self.load_value(item, ReadMode::Off).await?;
                registration.handler.on_added(txn, key, &value, lsn, is_primary).await;
            }
            (true, Some(item)) if registration.wants(ChangeEventMask::UPDATED) => {
                let value = self.load_value(item, ReadMode::Off).await?;
                registration.handler.on_updated(txn, key, &value, lsn, is_primary).await;
            }
            (true, None) if registration.wants(ChangeEventMask::REMOVED) => {
                registration.handler.on_removed(txn, key, lsn, is_primary).await;
            }
            _ => {}
        }
        Ok(())
    }
}

fn decode_record<K: StoreKey>(lsn: i64, metadata: &[u8]) -> Result<AppliedRecord<K>> {
    let metadata = MetadataOperationData::decode(metadata)?;
    if metadata.version != OPERATION_FORMAT_VERSION {
        return Err(StoreError::Corruption {
            reason: format!(
                "operation at lsn {} has format version {}, expected {}",
                lsn, metadata.version, OPERATION_FORMAT_VERSION
            ),
        });
    }
    Ok(AppliedRecord {
        lsn,
        modification: metadata.modification,
        key: decode(&metadata.key)?,
        key_len: metadata.key.len(),
        key_hash: hash_key_bytes(&metadata.key),
    })
}
