//! Checkpoint lifecycle, consolidation, merge, and recovery.
//!
//! 1. `prepare_checkpoint(lsn)` freezes the differential into a delta
//! 2. `perform_checkpoint` writes the prepared deltas as one file pair and a
//!    temp metadata table naming it, then consolidates (inline or in the
//!    background) and may merge every file into one
//! 3. `complete_checkpoint` promotes temp metadata with a safe replace and
//!    makes the new table current
//!
//! A crash between 2 and 3 leaves `temp_metadata` behind; recovery promotes
//! it if valid. Files no table references are deleted at recovery.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::StreamExt;
use mvstore_constants::INVALID_LSN;
use mvstore_constants::ZERO_LSN;
use snafu::ResultExt;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::Store;
use crate::checkpoint_file;
use crate::checkpoint_file::CheckpointRecord;
use crate::consolidation::ConsolidatedMap;
use crate::consolidation::ConsolidationManager;
use crate::consolidation::MergeReason;
use crate::differential::DifferentialStoreComponent;
use crate::error::IoSnafu;
use crate::error::Result;
use crate::error::StoreError;
use crate::item::ValueLocator;
use crate::item::VersionedItem;
use crate::key::decode;
use crate::key::encode;
use crate::key::KeySizeSnapshot;
use crate::key::StoreKey;
use crate::key::StoreValue;
use crate::metadata;
use crate::metadata::FileMetadata;
use crate::metadata::FileRecord;
use crate::metadata::MetadataTable;
use crate::notification::ChangeEventMask;
use crate::notification::RebuiltEntry;
use crate::snapshot::SnapshotContainer;
use crate::transaction::ReadMode;

/// Where a store is in the checkpoint lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CheckpointState {
    /// No checkpoint in progress.
    #[default]
    Idle,
    Prepared,
    Performed,
    Completed,
}

/// Checkpoint state and the sequence number each step last ran at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointProgress {
    pub state: CheckpointState,
    pub last_prepare_lsn: i64,
    pub last_perform_lsn: i64,
    pub last_complete_lsn: i64,
    /// Key sizes as of the last prepare (or state install). Sizes the
    /// checkpointed keys in memory estimates.
    pub key_sizes: KeySizeSnapshot,
}

impl Default for CheckpointProgress {
    fn default() -> Self {
        Self {
            state: CheckpointState::Idle,
            last_prepare_lsn: INVALID_LSN,
            last_perform_lsn: INVALID_LSN,
            last_complete_lsn: INVALID_LSN,
            key_sizes: KeySizeSnapshot::default(),
        }
    }
}

impl CheckpointProgress {
    fn reset(&mut self, checkpoint_lsn: i64, key_sizes: KeySizeSnapshot) {
        self.state = CheckpointState::Idle;
        self.last_prepare_lsn = checkpoint_lsn;
        self.last_perform_lsn = checkpoint_lsn;
        self.last_complete_lsn = checkpoint_lsn;
        self.key_sizes = key_sizes;
    }
}

/// A freshly written file pair and the versions it holds.
struct WrittenFile<V> {
    file: Arc<FileMetadata>,
    locators: Vec<ValueLocator>,
    items: Vec<Arc<VersionedItem<V>>>,
}

impl<V> WrittenFile<V> {
    fn publish_locators(&self) {
        for (item, locator) in self.items.iter().zip(&self.locators) {
            item.set_locator(*locator);
        }
    }
}

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    // ========================================================================
    // Prepare / perform / complete
    // ========================================================================

    /// Freeze the differential as of `lsn` and start a fresh one.
    ///
    /// May be called again before perform; the second call adds another
    /// delta to the same checkpoint.
    pub fn prepare_checkpoint(&self, lsn: i64) -> Result<()> {
        self.check_open()?;
        self.check_has_state()?;
        let mut progress = self.checkpoint.lock();
        if progress.state == CheckpointState::Performed {
            return Err(StoreError::InvalidState {
                reason: format!("store {} has a performed checkpoint awaiting completion", self.name),
            });
        }
        if lsn < progress.last_prepare_lsn {
            return Err(StoreError::InvalidArgument {
                reason: format!("checkpoint lsn {} is below last prepared lsn {}", lsn, progress.last_prepare_lsn),
            });
        }

        // Freeze and hand off before swapping, so a reader that misses the
        // new differential still finds the delta.
        let frozen = self.differential.load_full();
        frozen.freeze();
        self.consolidation.load().append_delta(Arc::clone(&frozen));
        self.unflushed.lock().push(Arc::clone(&frozen));
        self.differential.store(Arc::new(DifferentialStoreComponent::new()));

        progress.state = CheckpointState::Prepared;
        progress.last_prepare_lsn = lsn;
        progress.key_sizes = self.key_sizes.snapshot();
        info!(
            store = %self.name,
            lsn,
            delta_items = frozen.len(),
            key_size = progress.key_sizes.estimate(),
            "prepared checkpoint"
        );
        Ok(())
    }

    /// Write the prepared deltas and build the next metadata table, then
    /// consolidate.
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn perform_checkpoint(self: &Arc<Self>) -> Result<()> {
        self.check_open()?;
        let (checkpoint_lsn, key_sizes) = {
            let progress = self.checkpoint.lock();
            if progress.state != CheckpointState::Prepared {
                return Err(StoreError::InvalidState {
                    reason: format!("perform requires a prepared checkpoint, store {} is {:?}", self.name, progress.state),
                });
            }
            (progress.last_prepare_lsn, progress.key_sizes)
        };

        // One consolidation at a time: its merge table is the base below.
        self.await_consolidation().await;

        let deltas = self.unflushed.lock().clone();
        let mut newest: ConsolidatedMap<K, V> = BTreeMap::new();
        for delta in &deltas {
            for (key, item) in delta.items() {
                newest.insert(key, item);
            }
        }

        let merge_table = self.merge.load_full();
        let base = match merge_table.clone().or_else(|| self.current.load_full()) {
            Some(base) => base,
            None => {
                return Err(StoreError::InvalidState {
                    reason: format!("store {} has no metadata table", self.name),
                })
            }
        };

        let next = if self.config.durable {
            let file = if newest.is_empty() {
                None
            } else {
                let written = self.write_checkpoint_file(&newest).await?;
                written.publish_locators();
                Some(written.file)
            };
            let next = Arc::new(base.with_file(file, checkpoint_lsn));
            metadata::write_table(&metadata::temp_metadata_path(&self.dir), &next).await?;
            next
        } else {
            Arc::new(base.with_file(None, checkpoint_lsn))
        };

        {
            let _guard = self.lock_metadata_tables().await?;
            self.next.store(Some(Arc::clone(&next)));
            if merge_table.is_some() {
                self.merge.store(None);
                let merged_away = std::mem::take(&mut *self.merged_away.lock());
                self.files_to_be_deleted.lock().extend(merged_away);
            }
        }
        self.unflushed
            .lock()
            .retain(|delta| !deltas.iter().any(|flushed| Arc::ptr_eq(delta, flushed)));

        {
            let mut progress = self.checkpoint.lock();
            progress.state = CheckpointState::Performed;
            progress.last_perform_lsn = checkpoint_lsn;
        }
        info!(
            store = %self.name,
            lsn = checkpoint_lsn,
            items = newest.len(),
            estimated_key_bytes = key_sizes.estimate() * newest.len() as u64,
            files = next.file_count(),
            "performed checkpoint"
        );

        self.start_consolidation(next).await
    }

    /// Make the performed table current and release replaced files.
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn complete_checkpoint(&self) -> Result<()> {
        self.check_open()?;
        {
            let progress = self.checkpoint.lock();
            if progress.state != CheckpointState::Performed {
                return Err(StoreError::InvalidState {
                    reason: format!("complete requires a performed checkpoint, store {} is {:?}", self.name, progress.state),
                });
            }
        }

        if self.config.durable {
            metadata::safe_file_replace(&self.dir).await?;
        }
        let lsn = {
            let _guard = self.lock_metadata_tables().await?;
            let Some(next) = self.next.swap(None) else {
                return Err(StoreError::InvalidState {
                    reason: format!("store {} has no next metadata table", self.name),
                });
            };
            let lsn = next.checkpoint_lsn();
            self.current.store(Some(next));
            lsn
        };

        let released = std::mem::take(&mut *self.files_to_be_deleted.lock());
        for file in &released {
            file.mark_deletable();
        }
        let released_count = released.len();
        drop(released);

        {
            let mut progress = self.checkpoint.lock();
            progress.state = CheckpointState::Completed;
            progress.last_complete_lsn = lsn;
        }
        info!(store = %self.name, lsn, released_files = released_count, "completed checkpoint");
        Ok(())
    }

    async fn lock_metadata_tables(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        let timeout = self.config.metadata_table_lock_timeout;
        tokio::time::timeout(timeout, self.metadata_table_lock.lock())
            .await
            .map_err(|_| StoreError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            })
    }

    /// Write `items` as one checkpoint file pair. Items keep their old
    /// locators until [`WrittenFile::publish_locators`].
    async fn write_checkpoint_file(&self, items: &ConsolidatedMap<K, V>) -> Result<WrittenFile<V>> {
        let file_id = self.next_file_id.fetch_add(1, Ordering::AcqRel);
        let file_name = checkpoint_file::new_file_name();
        let (records, written_items) = self.checkpoint_records(items).await?;

        let written = checkpoint_file::write_checkpoint_files(&self.dir, file_id, &file_name, &records).await?;
        debug!(store = %self.name, file_id, file_name = %file_name, entries = written.total_entries, "wrote checkpoint file");
        let file = Arc::new(FileMetadata::new(
            &self.dir,
            FileRecord {
                file_id,
                file_name,
                total_entries: written.total_entries,
                deleted_entries: written.deleted_entries,
                size_bytes: written.size_bytes,
            },
        ));
        Ok(WrittenFile {
            file,
            locators: written.locators,
            items: written_items,
        })
    }

    async fn checkpoint_records(
        &self,
        items: &ConsolidatedMap<K, V>,
    ) -> Result<(Vec<CheckpointRecord>, Vec<Arc<VersionedItem<V>>>)> {
        let mut records = Vec::with_capacity(items.len());
        let mut written = Vec::with_capacity(items.len());
        for (key, item) in items {
            let value = if item.is_deleted() {
                None
            } else {
                Some(encode(&*self.load_value(item, ReadMode::Off).await?)?)
            };
            records.push(CheckpointRecord {
                key: encode(key)?,
                lsn: item.lsn(),
                kind: item.kind(),
                value,
            });
            written.push(Arc::clone(item));
        }
        Ok((records, written))
    }

    // ========================================================================
    // Consolidation and merge
    // ========================================================================

    async fn start_consolidation(self: &Arc<Self>, table: Arc<MetadataTable>) -> Result<()> {
        let manager = self.consolidation.load_full();
        if manager.delta_count() < self.config.deltas_to_consolidate as usize {
            return Ok(());
        }
        let deltas = manager.deltas();

        if !self.config.enable_background_consolidation {
            return self.consolidate_and_merge(&manager, &deltas, &table).await;
        }
        let store = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = store.consolidate_and_merge(&manager, &deltas, &table).await;
            if let Err(e) = &result {
                warn!(store = %store.name, error = %e, "background consolidation failed");
            }
            result
        });
        *self.consolidation_task.lock() = Some(task);
        Ok(())
    }

    /// Wait for a running consolidation task, logging its failure.
    pub(super) async fn await_consolidation(&self) {
        let task = self.consolidation_task.lock().take();
        let Some(task) = task else {
            return;
        };
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(store = %self.name, error = %e, "consolidation task failed"),
            Err(e) => error!(store = %self.name, error = %e, "consolidation task panicked"),
        }
    }

    async fn consolidate_and_merge(
        &self,
        manager: &Arc<ConsolidationManager<K, V>>,
        deltas: &[Arc<DifferentialStoreComponent<K, V>>],
        table: &MetadataTable,
    ) -> Result<()> {
        let snapshots: Arc<SnapshotContainer<K, V>> = self.snapshots.load_full();
        let outcome = manager.consolidate(deltas, &snapshots, self.replicator.visibility_sequence_number());
        // Snapshot readers may outlive the files these versions live in.
        for item in &outcome.retained_for_snapshots {
            if !item.is_deleted() {
                self.load_value(item, ReadMode::CacheResult).await?;
            }
        }
        debug!(
            store = %self.name,
            folded_deltas = outcome.folded_deltas,
            folded_items = outcome.folded_items,
            retained = outcome.retained_for_snapshots.len(),
            snapshot_items = snapshots.retained_item_count(),
            "consolidated deltas"
        );

        if !self.config.durable || self.background_cancel.is_cancelled() {
            return Ok(());
        }
        let live_entries = manager.live_entries_in(table);
        let Some(reason) = self.merge_policy.should_merge(table, live_entries) else {
            return Ok(());
        };
        self.merge_files(manager, table, reason).await
    }

    /// Rewrite every live consolidated version in `table`'s files into one
    /// new file, and publish a merge table naming only that file.
    async fn merge_files(
        &self,
        manager: &Arc<ConsolidationManager<K, V>>,
        table: &MetadataTable,
        reason: MergeReason,
    ) -> Result<()> {
        let map = manager.consolidated();
        if let Some(stray) = map
            .values()
            .filter_map(|item| item.locator())
            .find(|locator| table.get(locator.file_id).is_none())
        {
            warn!(store = %self.name, file_id = stray.file_id, "skipping merge: version outside the merged table");
            return Ok(());
        }

        let written = self.write_checkpoint_file(&map).await?;

        let still_current = Arc::ptr_eq(&self.consolidation.load_full(), manager);
        if !still_current || self.background_cancel.is_cancelled() {
            written.file.mark_deletable();
            debug!(store = %self.name, "discarding merge for replaced state");
            return Ok(());
        }

        let lsn = table.checkpoint_lsn();
        let merge_table = Arc::new(MetadataTable::new(lsn).with_file(Some(Arc::clone(&written.file)), lsn));
        {
            let _guard = self.lock_metadata_tables().await?;
            self.merge.store(Some(merge_table));
            *self.merged_away.lock() = table.files().values().cloned().collect();
        }
        // Readers can resolve the merged file only once the table is published.
        written.publish_locators();
        info!(
            store = %self.name,
            ?reason,
            merged_files = table.file_count(),
            live_entries = written.items.len(),
            file_id = written.file.file_id(),
            "merged checkpoint files"
        );
        Ok(())
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Load the last completed checkpoint from disk, or start empty.
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn recover_checkpoint(&self) -> Result<()> {
        self.check_open()?;
        let table = if self.config.durable {
            match metadata::open_table(&self.dir).await? {
                Some(table) => table,
                None => {
                    let table = MetadataTable::new(ZERO_LSN);
                    metadata::write_table(&metadata::temp_metadata_path(&self.dir), &table).await?;
                    metadata::safe_file_replace(&self.dir).await?;
                    info!(store = %self.name, "no checkpoint found, starting empty");
                    table
                }
            }
        } else {
            MetadataTable::new(ZERO_LSN)
        };
        self.install_table(table).await
    }

    /// Rebuild the consolidated map from `table`'s key files and make it
    /// the store's whole state.
    pub(super) async fn install_table(&self, table: MetadataTable) -> Result<()> {
        for file in table.files().values() {
            if !file.exists().await? {
                return Err(StoreError::Corruption {
                    reason: format!("checkpoint file {} ({}) is missing", file.file_id(), file.file_name()),
                });
            }
        }

        let mut map: ConsolidatedMap<K, V> = BTreeMap::new();
        for file in table.files().values() {
            let key_file = checkpoint_file::read_key_file(&file.key_path()).await?;
            for entry in key_file.entries {
                self.key_sizes.add_sample(entry.key.len());
                let key: K = decode(&entry.key)?;
                let item = Arc::new(VersionedItem::on_disk(
                    entry.kind,
                    entry.lsn,
                    entry.value_len,
                    ValueLocator {
                        file_id: file.file_id(),
                        offset: entry.value_offset,
                        len: entry.value_len,
                    },
                ));
                match map.get(&key) {
                    Some(existing) if existing.lsn() >= item.lsn() => {}
                    _ => {
                        map.insert(key, item);
                    }
                }
            }
        }
        map.retain(|_, item| !item.is_deleted());

        self.install_state(table, map).await?;
        if self.config.load_values_on_recovery {
            self.preload_values().await?;
        }
        if self.config.durable {
            self.trim_unreferenced_files().await?;
        }
        self.notify_rebuilt().await
    }

    /// Replace every in-memory layer with `map` and make `table` current.
    pub(super) async fn install_state(&self, table: MetadataTable, map: ConsolidatedMap<K, V>) -> Result<()> {
        let checkpoint_lsn = table.checkpoint_lsn();
        let count = map.len() as i64;
        let files = table.file_count();

        self.await_consolidation().await;
        self.next_file_id
            .store(table.max_file_id().map(|id| id + 1).unwrap_or(1), Ordering::Release);
        self.consolidation.store(Arc::new(ConsolidationManager::from_consolidated(map)));
        self.differential.store(Arc::new(DifferentialStoreComponent::new()));
        self.unflushed.lock().clear();
        self.reset_count(count);
        {
            let _guard = self.lock_metadata_tables().await?;
            self.current.store(Some(Arc::new(table)));
            self.next.store(None);
            self.merge.store(None);
        }
        self.merged_away.lock().clear();
        self.files_to_be_deleted.lock().clear();
        self.checkpoint.lock().reset(checkpoint_lsn, self.key_sizes.snapshot());
        self.has_state.store(true, Ordering::Release);
        info!(store = %self.name, checkpoint_lsn, count, files, "installed state");
        Ok(())
    }

    async fn preload_values(&self) -> Result<()> {
        let map = self.consolidation.load().consolidated();
        let parallelism = self.config.max_inflight_value_loads as usize;
        let mut loads = futures::stream::iter(map.values().cloned().collect::<Vec<_>>())
            .map(|item| async move { self.load_value(&item, ReadMode::CacheResult).await.map(|_| ()) })
            .buffer_unordered(parallelism);
        let mut loaded = 0usize;
        while let Some(result) = loads.next().await {
            result?;
            loaded += 1;
        }
        debug!(store = %self.name, loaded, parallelism, "preloaded values");
        Ok(())
    }

    /// Delete checkpoint files that no metadata table references.
    async fn trim_unreferenced_files(&self) -> Result<()> {
        let mut referenced: HashSet<String> = HashSet::new();
        for generation in [&self.current, &self.next, &self.merge] {
            if let Some(table) = generation.load_full() {
                referenced.extend(table.files().values().map(|file| file.file_name().to_string()));
            }
        }

        let mut trimmed = 0usize;
        for path in super::checkpoint_files_in(&self.dir).await? {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some((stem, _)) = checkpoint_file::parse_checkpoint_file_name(name) else {
                continue;
            };
            if !referenced.contains(stem) {
                tokio::fs::remove_file(&path).await.context(IoSnafu { path: &path })?;
                trimmed += 1;
            }
        }
        if trimmed > 0 {
            info!(store = %self.name, trimmed, "deleted unreferenced checkpoint files");
        }
        Ok(())
    }

    pub(super) async fn notify_rebuilt(&self) -> Result<()> {
        let Some(registration) = self.change_handler.load_full() else {
            return Ok(());
        };
        if !registration.wants(ChangeEventMask::REBUILT) {
            return Ok(());
        }
        let map = self.consolidation.load().consolidated();
        let mut state = Vec::with_capacity(map.len());
        for (key, item) in map.iter() {
            let value = self.load_value(item, ReadMode::Off).await?;
            state.push(RebuiltEntry {
                key: key.clone(),
                version: item.lsn(),
                value: (*value).clone(),
            });
        }
        registration.handler.on_rebuilt(state).await;
        Ok(())
    }
}
