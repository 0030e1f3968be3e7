//! Replicated, transactional, multi-version key-value storage engine.
//!
//! One [`Store`] is a single replica of a replicated state: the primary runs
//! client reads and writes inside transactions and replicates every write,
//! and each replica (primary included) applies committed operations in log
//! order. State lives in layered in-memory components and periodic on-disk
//! checkpoints.
//!
//! # Key Components
//!
//! - **Store**: [`Store`], the orchestrator, with client operations, apply,
//!   checkpoint lifecycle, copy, backup, and restore
//! - **Layers**: [`DifferentialStoreComponent`], [`ConsolidationManager`],
//!   [`SnapshotContainer`]
//! - **Disk**: [`MetadataTable`] and the checkpoint file pairs it names
//! - **Concurrency**: [`LockManager`] (prime lock plus per-key locks)
//! - **Replication contract**: [`TransactionalReplicator`]
//! - **Testing**: [`testing::LoopbackReplicator`]

pub mod checkpoint_file;
pub mod config;
pub mod consolidation;
pub mod copy;
pub mod differential;
pub mod enumeration;
pub mod error;
pub mod item;
pub mod key;
pub mod lock;
pub mod metadata;
pub mod notification;
pub mod operation;
pub mod replicator;
pub mod snapshot;
pub mod store;
pub mod sweep;
pub mod testing;
pub mod transaction;

pub use mvstore_constants as constants;

// Re-export the types needed to drive a store at crate root

// Configuration and errors
pub use config::StoreConfig;
pub use consolidation::ConsolidationManager;
pub use copy::StoreCopyStream;
pub use differential::DifferentialStoreComponent;
// Enumeration
pub use enumeration::KeyEnumerator;
pub use enumeration::StoreEnumerator;
pub use error::ReplicationError;
pub use error::Result;
pub use error::StoreError;
// Items and locks
pub use item::RecordKind;
pub use item::VersionedItem;
pub use key::StoreKey;
pub use key::StoreValue;
pub use lock::LockManager;
pub use lock::LockMode;
pub use metadata::MetadataTable;
// Notifications
pub use notification::ChangeEventMask;
pub use notification::RebuiltEntry;
pub use notification::StoreChangeHandler;
// Replication contract
pub use replicator::AccessStatus;
pub use replicator::ApplyContext;
pub use replicator::ApplyKind;
pub use replicator::ApplyRole;
pub use replicator::OperationContext;
pub use replicator::ReplicaRole;
pub use replicator::ReplicatedOperation;
pub use replicator::TransactionHandle;
pub use replicator::TransactionalReplicator;
pub use snapshot::SnapshotContainer;
// Store
pub use store::CheckpointProgress;
pub use store::CheckpointState;
pub use store::Store;
pub use store::StoreStatus;
pub use store::VersionedValue;
pub use sweep::SweepStats;
pub use transaction::IsolationLevel;
pub use transaction::ReadMode;
