//! Contract with the replication layer.
//!
//! The store consumes a narrow interface: append an operation to the
//! replicated log, query the partition's access status and role, and learn
//! the visibility sequence number for snapshot reads. In the other direction
//! the replication layer drives `Store::apply` / `Store::unlock` for every
//! durable record and the copy protocol for replica builds.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ReplicationError;
use crate::transaction::IsolationLevel;

/// Replica role assigned by the partition authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplicaRole {
    #[default]
    None,
    Secondary,
    Primary,
}

/// Read or write access granted to the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessStatus {
    #[default]
    Granted,
    NotPrimary,
    NoWriteQuorum,
    ReconfigurationPending,
}

/// Where an apply call originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyRole {
    /// Produced locally by a write on this primary.
    Primary,
    /// Replicated from the primary.
    Secondary,
    /// Replayed from the local log during startup.
    Recovery,
}

/// Direction of an applied record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyKind {
    Redo,
    Undo,
    /// Undo of a record a secondary applied beyond the new primary's log.
    FalseProgress,
}

/// Role and direction of one apply call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyContext {
    pub role: ApplyRole,
    pub kind: ApplyKind,
}

impl ApplyContext {
    pub const PRIMARY_REDO: ApplyContext = ApplyContext {
        role: ApplyRole::Primary,
        kind: ApplyKind::Redo,
    };
    pub const PRIMARY_UNDO: ApplyContext = ApplyContext {
        role: ApplyRole::Primary,
        kind: ApplyKind::Undo,
    };
    pub const SECONDARY_REDO: ApplyContext = ApplyContext {
        role: ApplyRole::Secondary,
        kind: ApplyKind::Redo,
    };
    pub const SECONDARY_FALSE_PROGRESS: ApplyContext = ApplyContext {
        role: ApplyRole::Secondary,
        kind: ApplyKind::FalseProgress,
    };
    pub const RECOVERY_REDO: ApplyContext = ApplyContext {
        role: ApplyRole::Recovery,
        kind: ApplyKind::Redo,
    };
    pub const RECOVERY_UNDO: ApplyContext = ApplyContext {
        role: ApplyRole::Recovery,
        kind: ApplyKind::Undo,
    };
}

/// Replication-layer transaction a store operation is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle {
    id: u64,
    isolation: IsolationLevel,
}

impl TransactionHandle {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            isolation: IsolationLevel::ReadRepeatable,
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }
}

/// Encoded record handed to the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedOperation {
    pub metadata: Vec<u8>,
    pub redo: Vec<u8>,
    pub undo: Option<Vec<u8>>,
}

/// Returned by apply; hand it back to `Store::unlock` when the transaction
/// is finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationContext {
    pub transaction_id: u64,
}

/// The replication layer as seen by the store.
#[async_trait]
pub trait TransactionalReplicator: Send + Sync + 'static {
    /// Replicate one operation; resolves with its sequence number once the
    /// log acknowledges it.
    async fn append(&self, txn: &TransactionHandle, operation: ReplicatedOperation) -> Result<i64, ReplicationError>;

    fn read_status(&self) -> AccessStatus;

    fn write_status(&self) -> AccessStatus;

    fn role(&self) -> ReplicaRole;

    /// Highest sequence number visible to snapshot reads.
    fn visibility_sequence_number(&self) -> i64;
}
