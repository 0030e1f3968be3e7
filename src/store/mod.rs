//! The store orchestrator.
//!
//! [`Store`] composes the in-memory layers (differential, consolidated,
//! snapshot), the lock manager, the checkpoint files and the replicator into
//! one replicated key-value state provider:
//!
//! - client operations (`add`, `conditional_get`, ...) run on the primary,
//!   replicate through [`TransactionalReplicator::append`] and land in the
//!   transaction's write-set
//! - [`Store::apply`] folds committed operations into the differential on
//!   every replica, including the primary
//! - the checkpoint lifecycle (prepare, perform, complete, recover) moves
//!   state to disk and back
//! - copy, backup, and restore move whole states between stores
//!
//! # Tiger Style
//!
//! - The live-key count only changes on apply and never goes negative
//! - Every lock wait is bounded by a caller deadline or a configured timeout
//! - File and metadata generations are swapped under one async lock; readers
//!   never block on them

mod apply;
mod backup;
mod checkpoint;
mod copy;
mod read;
mod write;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use arc_swap::ArcSwapOption;
use mvstore_constants::INVALID_LSN;
use parking_lot::Mutex;
use parking_lot::RwLock;
use snafu::ResultExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::instrument;
use tracing::warn;

pub use self::checkpoint::CheckpointProgress;
pub use self::checkpoint::CheckpointState;
pub use self::read::VersionedValue;
use crate::checkpoint_file;
use crate::config::StoreConfig;
use crate::consolidation::ConsolidationManager;
use crate::consolidation::MergePolicy;
use crate::copy::CopyManager;
use crate::differential::DifferentialStoreComponent;
use crate::error::invariant;
use crate::error::IoSnafu;
use crate::error::Result;
use crate::error::StoreError;
use crate::key::KeySizeEstimator;
use crate::key::StoreKey;
use crate::key::StoreValue;
use crate::lock::Deadline;
use crate::lock::LockManager;
use crate::lock::PrimeLockGuard;
use crate::lock::PrimeLockMode;
use crate::metadata;
use crate::metadata::FileMetadata;
use crate::metadata::MetadataTable;
use crate::notification::ChangeEventMask;
use crate::notification::ChangeHandlerRegistration;
use crate::notification::StoreChangeHandler;
use crate::replicator::AccessStatus;
use crate::replicator::OperationContext;
use crate::replicator::ReplicaRole;
use crate::replicator::TransactionHandle;
use crate::replicator::TransactionalReplicator;
use crate::snapshot::SnapshotContainer;
use crate::sweep::SweepManager;
use crate::sweep::SweepStats;
use crate::transaction::StoreTransaction;

/// Lifecycle status of a store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreStatus {
    /// Constructed, not yet opened.
    Created,
    Open,
    Closing,
    Closed,
    /// On-disk state was deleted; the instance cannot be reopened.
    Removed,
}

/// Replicated, transactional, multi-version key-value store.
///
/// Shared as `Arc<Store<K, V>>`: background consolidation holds a clone.
pub struct Store<K: StoreKey, V: StoreValue> {
    name: String,
    dir: PathBuf,
    config: StoreConfig,
    replicator: Arc<dyn TransactionalReplicator>,

    status: RwLock<StoreStatus>,
    role: RwLock<ReplicaRole>,
    /// False between the start of a copy and its successful end.
    has_state: AtomicBool,
    was_copy_aborted: AtomicBool,

    lock_manager: LockManager,
    inflight: Mutex<HashMap<u64, Arc<StoreTransaction<K, V>>>>,

    differential: ArcSwap<DifferentialStoreComponent<K, V>>,
    consolidation: Arc<ArcSwap<ConsolidationManager<K, V>>>,
    snapshots: ArcSwap<SnapshotContainer<K, V>>,
    /// Deltas prepared but not yet written by `perform_checkpoint`.
    unflushed: Mutex<Vec<Arc<DifferentialStoreComponent<K, V>>>>,
    count: AtomicI64,
    key_sizes: KeySizeEstimator,

    current: ArcSwapOption<MetadataTable>,
    next: ArcSwapOption<MetadataTable>,
    merge: ArcSwapOption<MetadataTable>,
    /// Serializes swaps of `current`, `next`, and `merge`.
    metadata_table_lock: tokio::sync::Mutex<()>,
    /// Files replaced by the published merge table.
    merged_away: Mutex<Vec<Arc<FileMetadata>>>,
    /// Files to release once the next table becomes current.
    files_to_be_deleted: Mutex<Vec<Arc<FileMetadata>>>,
    next_file_id: AtomicU32,
    merge_policy: MergePolicy,

    checkpoint: Mutex<CheckpointProgress>,
    consolidation_task: Mutex<Option<JoinHandle<Result<()>>>>,
    background_cancel: CancellationToken,
    sweep: Arc<SweepManager>,

    copy_manager: tokio::sync::Mutex<Option<CopyManager>>,
    change_handler: ArcSwapOption<ChangeHandlerRegistration<K, V>>,
    remove_guard: Mutex<Option<PrimeLockGuard>>,
}

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Create a store rooted at `dir`. Nothing touches the disk until
    /// [`Store::open`].
    pub fn new(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        config: StoreConfig,
        replicator: Arc<dyn TransactionalReplicator>,
    ) -> Arc<Self> {
        let name = name.into();
        let config = config.finalize();
        let merge_policy = MergePolicy::new(config.merge_file_count_threshold, config.merge_invalid_entries_percent);
        let sweep = Arc::new(SweepManager::new(&config));
        Arc::new(Self {
            lock_manager: LockManager::new(name.clone()),
            name,
            dir: dir.into(),
            replicator,
            status: RwLock::new(StoreStatus::Created),
            role: RwLock::new(ReplicaRole::None),
            has_state: AtomicBool::new(false),
            was_copy_aborted: AtomicBool::new(false),
            inflight: Mutex::new(HashMap::new()),
            differential: ArcSwap::from_pointee(DifferentialStoreComponent::new()),
            consolidation: Arc::new(ArcSwap::from_pointee(ConsolidationManager::new())),
            snapshots: ArcSwap::from_pointee(SnapshotContainer::new()),
            unflushed: Mutex::new(Vec::new()),
            count: AtomicI64::new(0),
            key_sizes: KeySizeEstimator::new(),
            current: ArcSwapOption::empty(),
            next: ArcSwapOption::empty(),
            merge: ArcSwapOption::empty(),
            metadata_table_lock: tokio::sync::Mutex::new(()),
            merged_away: Mutex::new(Vec::new()),
            files_to_be_deleted: Mutex::new(Vec::new()),
            next_file_id: AtomicU32::new(1),
            merge_policy,
            checkpoint: Mutex::new(CheckpointProgress::default()),
            consolidation_task: Mutex::new(None),
            background_cancel: CancellationToken::new(),
            sweep,
            copy_manager: tokio::sync::Mutex::new(None),
            change_handler: ArcSwapOption::empty(),
            remove_guard: Mutex::new(None),
            config,
        })
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn status(&self) -> StoreStatus {
        *self.status.read()
    }

    pub fn role(&self) -> ReplicaRole {
        *self.role.read()
    }

    /// Number of live keys in committed state.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Estimated resident bytes: cached values plus estimated key sizes.
    ///
    /// Checkpointed keys are sized with the estimate frozen at the last
    /// prepare, keys written since with the running estimate.
    pub fn memory_size(&self) -> u64 {
        let consolidation = self.consolidation.load();
        let values = self.differential.load().resident_bytes() + consolidation.resident_bytes();
        let checkpointed_keys = consolidation.consolidated().len() as u64;
        let recent_keys = (self.count().max(0) as u64).saturating_sub(checkpointed_keys);
        let prepared = self.checkpoint.lock().key_sizes;
        values + prepared.estimate() * checkpointed_keys + self.key_sizes.estimate() * recent_keys
    }

    /// Bytes referenced by the current metadata table.
    pub fn disk_size(&self) -> u64 {
        self.current.load().as_ref().map(|table| table.disk_size()).unwrap_or(0)
    }

    /// Checkpoint sequence number of the current table, or `INVALID_LSN`.
    pub fn checkpoint_lsn(&self) -> i64 {
        self.current.load().as_ref().map(|table| table.checkpoint_lsn()).unwrap_or(INVALID_LSN)
    }

    pub fn checkpoint_state(&self) -> CheckpointState {
        self.checkpoint.lock().state
    }

    pub fn checkpoint_progress(&self) -> CheckpointProgress {
        *self.checkpoint.lock()
    }

    pub fn has_state(&self) -> bool {
        self.has_state.load(Ordering::Acquire)
    }

    pub fn was_copy_aborted(&self) -> bool {
        self.was_copy_aborted.load(Ordering::Acquire)
    }

    pub fn inflight_transaction_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Number of checkpoint file pairs in the current table.
    pub fn file_count(&self) -> usize {
        self.current.load().as_ref().map(|table| table.file_count()).unwrap_or(0)
    }

    pub fn active_snapshot_count(&self) -> usize {
        self.snapshots.load().active_snapshot_count()
    }

    /// Run one sweep pass now, regardless of the background interval.
    pub fn sweep_now(&self) -> SweepStats {
        if !self.sweep.is_enabled() {
            return SweepStats::default();
        }
        let manager = self.consolidation.load_full();
        self.sweep.sweep(&manager)
    }

    pub fn set_change_handler(&self, handler: Arc<dyn StoreChangeHandler<K, V>>, mask: ChangeEventMask) {
        self.change_handler.store(Some(Arc::new(ChangeHandlerRegistration { handler, mask })));
    }

    pub fn clear_change_handler(&self) {
        self.change_handler.store(None);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the store: create the working directory and start the sweeper.
    ///
    /// State is loaded separately by [`Store::recover_checkpoint`], a copy,
    /// or a restore.
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn open(&self) -> Result<()> {
        {
            let status = self.status.read();
            if *status != StoreStatus::Created {
                return Err(StoreError::InvalidState {
                    reason: format!("cannot open store {} in status {:?}", self.name, *status),
                });
            }
        }
        if self.config.durable {
            tokio::fs::create_dir_all(&self.dir).await.context(IoSnafu { path: &self.dir })?;
        }
        *self.status.write() = StoreStatus::Open;
        self.sweep.start(Arc::downgrade(&self.consolidation));
        info!(store = %self.name, dir = %self.dir.display(), durable = self.config.durable, "store opened");
        Ok(())
    }

    /// Record a role change. Moving to `None` stops background work; the
    /// host is expected to remove the state next.
    pub async fn change_role(&self, role: ReplicaRole) -> Result<()> {
        self.check_open()?;
        let previous = std::mem::replace(&mut *self.role.write(), role);
        if role == ReplicaRole::None {
            self.sweep.stop().await;
            self.await_consolidation().await;
        }
        info!(store = %self.name, ?previous, ?role, "role changed");
        Ok(())
    }

    /// Drain in-flight transactions (bounded by the close timeout), stop
    /// background work, and release all locks.
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn close(&self) -> Result<()> {
        self.shutdown(true).await
    }

    /// Close without waiting for in-flight transactions.
    pub async fn abort(&self) {
        if let Err(e) = self.shutdown(false).await {
            warn!(store = %self.name, error = %e, "abort failed");
        }
    }

    async fn shutdown(&self, drain: bool) -> Result<()> {
        {
            let mut status = self.status.write();
            match *status {
                StoreStatus::Closing | StoreStatus::Closed | StoreStatus::Removed => return Ok(()),
                StoreStatus::Created | StoreStatus::Open => *status = StoreStatus::Closing,
            }
        }

        let drained = if drain {
            let deadline = Deadline::after(self.config.close_drain_timeout);
            match self
                .lock_manager
                .acquire_prime_lock(PrimeLockMode::Exclusive, deadline, &CancellationToken::new())
                .await
            {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!(
                        store = %self.name,
                        inflight = self.inflight_transaction_count(),
                        error = %e,
                        "in-flight transactions did not drain before close"
                    );
                    None
                }
            }
        } else {
            None
        };

        self.background_cancel.cancel();
        self.sweep.stop().await;
        self.await_consolidation().await;

        self.lock_manager.close();
        self.release_all_transactions();
        drop(drained);
        self.remove_guard.lock().take();
        self.copy_manager.lock().await.take();

        {
            let _guard = self.metadata_table_lock.lock().await;
            self.current.store(None);
            self.next.store(None);
            self.merge.store(None);
        }
        self.merged_away.lock().clear();
        self.files_to_be_deleted.lock().clear();

        *self.status.write() = StoreStatus::Closed;
        info!(store = %self.name, drained = drain, "store closed");
        Ok(())
    }

    /// Block new transactions ahead of [`Store::remove_state`].
    pub async fn prepare_for_remove(&self) -> Result<()> {
        self.check_open()?;
        let deadline = Deadline::after(self.config.close_drain_timeout);
        let guard = self
            .lock_manager
            .acquire_prime_lock(PrimeLockMode::Exclusive, deadline, &CancellationToken::new())
            .await?;
        *self.remove_guard.lock() = Some(guard);
        info!(store = %self.name, "prepared for remove");
        Ok(())
    }

    /// Close the store and delete everything it wrote to its directory.
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn remove_state(&self) -> Result<()> {
        self.remove_guard.lock().take();
        self.shutdown(false).await?;

        if self.config.durable && tokio::fs::try_exists(&self.dir).await.context(IoSnafu { path: &self.dir })? {
            metadata::remove_metadata_files(&self.dir).await?;
            let mut removed = 0usize;
            for path in checkpoint_files_in(&self.dir).await? {
                tokio::fs::remove_file(&path).await.context(IoSnafu { path: &path })?;
                removed += 1;
            }
            if let Err(e) = tokio::fs::remove_dir(&self.dir).await {
                warn!(store = %self.name, dir = %self.dir.display(), error = %e, "working directory not removed");
            }
            info!(store = %self.name, removed_files = removed, "removed store state");
        }
        *self.status.write() = StoreStatus::Removed;
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Release everything the transaction holds in this store. Called by the
    /// replicator when the transaction commits or aborts.
    pub fn unlock(&self, context: OperationContext) {
        let txn = self.inflight.lock().remove(&context.transaction_id);
        if let Some(txn) = txn {
            txn.unlock(&self.lock_manager);
        }
    }

    pub(crate) fn transaction(&self, handle: &TransactionHandle) -> Arc<StoreTransaction<K, V>> {
        Arc::clone(
            self.inflight
                .lock()
                .entry(handle.id())
                .or_insert_with(|| Arc::new(StoreTransaction::new(*handle))),
        )
    }

    fn release_all_transactions(&self) {
        let drained: Vec<_> = self.inflight.lock().drain().map(|(_, txn)| txn).collect();
        for txn in drained {
            txn.unlock(&self.lock_manager);
        }
    }

    // ========================================================================
    // Status checks
    // ========================================================================

    fn closed_error(&self) -> StoreError {
        StoreError::ObjectClosed {
            store: self.name.clone(),
        }
    }

    fn check_open(&self) -> Result<()> {
        if *self.status.read() != StoreStatus::Open {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn check_has_state(&self) -> Result<()> {
        if !self.has_state() {
            return Err(StoreError::InvalidState {
                reason: if self.was_copy_aborted() {
                    format!("store {} has no state: last copy was aborted", self.name)
                } else {
                    format!("store {} has no state", self.name)
                },
            });
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<()> {
        self.check_open()?;
        if self.replicator.read_status() != AccessStatus::Granted {
            return Err(StoreError::NotReadable);
        }
        self.check_has_state()
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.replicator.write_status() != AccessStatus::Granted {
            return Err(StoreError::NotPrimary);
        }
        self.check_has_state()
    }

    // ========================================================================
    // Count
    // ========================================================================

    fn adjust_count(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let count = self.count.fetch_add(delta, Ordering::AcqRel) + delta;
        invariant!(count >= 0, "STORE: live key count of store {} went negative: {}", self.name, count);
    }

    fn reset_count(&self, count: i64) {
        invariant!(count >= 0, "STORE: live key count of store {} went negative: {}", self.name, count);
        self.count.store(count, Ordering::Release);
    }
}

/// Paths of every `.sptr`/`.sptv` file directly under `dir`.
async fn checkpoint_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await.context(IoSnafu { path: dir })?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.context(IoSnafu { path: dir })? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if checkpoint_file::parse_checkpoint_file_name(name).is_some() {
            paths.push(entry.path());
        }
    }
    Ok(paths)
}
