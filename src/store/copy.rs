//! Building a replica from another store's state.
//!
//! The producer snapshots its committed state under the exclusive prime lock
//! and streams it: checkpoint files for a durable store, a dump of live
//! items for a volatile one. The consumer discards everything it holds,
//! feeds the chunks to a [`CopyManager`], and installs the result.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mvstore_constants::INVALID_LSN;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::Store;
use crate::consolidation::ConsolidatedMap;
use crate::consolidation::ConsolidationManager;
use crate::copy::CopiedState;
use crate::copy::CopyItem;
use crate::copy::CopyManager;
use crate::copy::StoreCopyStream;
use crate::differential::DifferentialStoreComponent;
use crate::error::Result;
use crate::error::StoreError;
use crate::item::VersionedItem;
use crate::key::decode;
use crate::key::encode;
use crate::key::StoreKey;
use crate::key::StoreValue;
use crate::lock::Deadline;
use crate::lock::PrimeLockMode;
use crate::metadata;
use crate::metadata::MetadataTable;
use crate::snapshot::SnapshotContainer;
use crate::transaction::ReadMode;

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Snapshot committed state for a copy to another replica.
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn get_current_state(&self) -> Result<StoreCopyStream> {
        self.check_open()?;
        self.check_has_state()?;
        let deadline = Deadline::after(self.config.default_lock_timeout);
        let _prime = self
            .lock_manager
            .acquire_prime_lock(PrimeLockMode::Exclusive, deadline, &CancellationToken::new())
            .await?;

        if self.config.durable {
            let table = self.current.load_full().ok_or_else(|| StoreError::InvalidState {
                reason: format!("store {} has no current metadata table", self.name),
            })?;
            info!(store = %self.name, checkpoint_lsn = table.checkpoint_lsn(), files = table.file_count(), "copying checkpoint files");
            return Ok(StoreCopyStream::durable(table, self.config.copy_chunk_size_bytes as usize));
        }

        // No transaction is in flight under the exclusive prime lock, so the
        // dump is exactly the state as of the visibility sequence number.
        let items = self.dump_live_items().await?;
        let checkpoint_lsn = items
            .iter()
            .map(|item| item.lsn)
            .chain([self.checkpoint_lsn(), self.replicator.visibility_sequence_number()])
            .max()
            .unwrap_or(INVALID_LSN);
        info!(store = %self.name, checkpoint_lsn, items = items.len(), "copying volatile state");
        Ok(StoreCopyStream::volatile(
            checkpoint_lsn,
            items,
            self.config.copy_volatile_batch_items as usize,
        ))
    }

    async fn dump_live_items(&self) -> Result<Vec<CopyItem>> {
        let mut keys: BTreeSet<K> = self.consolidation.load().keys_in_range(&(..));
        keys.extend(self.differential.load().keys_in_range(&(..)));

        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(item) = self.resolve_latest(&key) else {
                continue;
            };
            if item.is_deleted() {
                continue;
            }
            let value = self.load_value(&item, ReadMode::Off).await?;
            items.push(CopyItem {
                key: encode(&key)?,
                lsn: item.lsn(),
                kind: item.kind(),
                value: encode(&*value)?,
            });
        }
        Ok(items)
    }

    /// Discard all state ahead of receiving a copy.
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn begin_setting_current_state(&self) -> Result<()> {
        self.check_open()?;
        self.await_consolidation().await;

        let deadline = Deadline::after(self.config.close_drain_timeout);
        let prime = self
            .lock_manager
            .acquire_prime_lock(PrimeLockMode::Exclusive, deadline, &CancellationToken::new())
            .await?;

        // Wake and fail every waiter, then start over with an empty table.
        self.lock_manager.close();
        self.release_all_transactions();
        self.lock_manager.reopen();

        self.has_state.store(false, Ordering::Release);
        self.was_copy_aborted.store(false, Ordering::Release);
        self.differential.store(Arc::new(DifferentialStoreComponent::new()));
        self.consolidation.store(Arc::new(ConsolidationManager::new()));
        self.snapshots.store(Arc::new(SnapshotContainer::new()));
        self.unflushed.lock().clear();
        self.reset_count(0);

        {
            let _guard = self.metadata_table_lock.lock().await;
            for generation in [&self.current, &self.next, &self.merge] {
                if let Some(table) = generation.swap(None) {
                    table.mark_all_deletable();
                }
            }
        }
        for file in self.merged_away.lock().drain(..).chain(self.files_to_be_deleted.lock().drain(..)) {
            file.mark_deletable();
        }
        if self.config.durable {
            metadata::remove_metadata_files(&self.dir).await?;
        }
        *self.checkpoint.lock() = super::CheckpointProgress::default();
        *self.copy_manager.lock().await = Some(CopyManager::new(&self.dir));
        drop(prime);
        info!(store = %self.name, "began receiving copy");
        Ok(())
    }

    /// Feed one chunk of a copy stream.
    pub async fn set_current_state(&self, chunk: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut manager = self.copy_manager.lock().await;
        let Some(manager) = manager.as_mut() else {
            return Err(StoreError::InvalidState {
                reason: format!("store {} is not receiving a copy", self.name),
            });
        };
        manager.add_chunk(chunk).await
    }

    /// Finish a copy and install the received state.
    ///
    /// If the stream never completed the store stays without state:
    /// `CopyAborted` here and `InvalidState` from every later operation.
    pub async fn end_setting_current_state(&self) -> Result<()> {
        self.check_open()?;
        let manager = self.copy_manager.lock().await.take().ok_or_else(|| StoreError::InvalidState {
            reason: format!("store {} is not receiving a copy", self.name),
        })?;
        let bytes_received = manager.bytes_received();

        let copied = match manager.finish().await {
            Ok(copied) => copied,
            Err(e) => {
                self.was_copy_aborted.store(true, Ordering::Release);
                warn!(store = %self.name, bytes_received, error = %e, "copy aborted");
                return Err(e);
            }
        };

        match copied {
            CopiedState::Durable { checkpoint_lsn } => {
                let table = metadata::open_table(&self.dir).await?.ok_or_else(|| StoreError::Corruption {
                    reason: format!("copy to store {} left no metadata table", self.name),
                })?;
                info!(store = %self.name, checkpoint_lsn, bytes_received, "received checkpoint files");
                self.install_table(table).await
            }
            CopiedState::Volatile { checkpoint_lsn, items } => {
                let mut map: ConsolidatedMap<K, V> = BTreeMap::new();
                for item in items {
                    let key: K = decode(&item.key)?;
                    let value: V = decode(&item.value)?;
                    let version = VersionedItem::with_value(item.kind, item.lsn, Arc::new(value), item.value.len() as u32);
                    map.insert(key, Arc::new(version));
                }
                info!(store = %self.name, checkpoint_lsn, items = map.len(), "received volatile state");
                self.install_state(MetadataTable::new(checkpoint_lsn), map).await?;
                self.notify_rebuilt().await
            }
        }
    }
}
