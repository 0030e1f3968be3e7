//! In-process replicator for tests and embedding experiments.
//!
//! [`LoopbackReplicator`] assigns sequence numbers at append time, buffers
//! each transaction's operations, and on [`LoopbackReplicator::commit`]
//! applies them to the primary store in order. The committed log can be
//! replayed onto other stores to drive secondaries or recovery.

use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ReplicationError;
use crate::error::Result;
use crate::key::StoreKey;
use crate::key::StoreValue;
use crate::replicator::AccessStatus;
use crate::replicator::ApplyContext;
use crate::replicator::OperationContext;
use crate::replicator::ReplicaRole;
use crate::replicator::ReplicatedOperation;
use crate::replicator::TransactionHandle;
use crate::replicator::TransactionalReplicator;
use crate::store::Store;

/// One appended operation.
#[derive(Debug, Clone)]
pub struct LoggedOperation {
    pub lsn: i64,
    pub txn: TransactionHandle,
    pub operation: ReplicatedOperation,
}

#[derive(Debug)]
struct Status {
    read: AccessStatus,
    write: AccessStatus,
    role: ReplicaRole,
}

/// Single-replica log that applies committed transactions in-process.
#[derive(Debug)]
pub struct LoopbackReplicator {
    next_lsn: AtomicI64,
    last_committed: AtomicI64,
    status: Mutex<Status>,
    transient_failures: AtomicU32,
    rejection: Mutex<Option<ReplicationError>>,
    pending: Mutex<HashMap<u64, Vec<LoggedOperation>>>,
    committed: Mutex<Vec<LoggedOperation>>,
}

impl LoopbackReplicator {
    /// Replicator whose first append gets `first_lsn`. Starts as a readable,
    /// writable primary.
    pub fn new(first_lsn: i64) -> Arc<Self> {
        Arc::new(Self {
            next_lsn: AtomicI64::new(first_lsn),
            last_committed: AtomicI64::new(first_lsn - 1),
            status: Mutex::new(Status {
                read: AccessStatus::Granted,
                write: AccessStatus::Granted,
                role: ReplicaRole::Primary,
            }),
            transient_failures: AtomicU32::new(0),
            rejection: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            committed: Mutex::new(Vec::new()),
        })
    }

    /// Replicator for a secondary: readable, not writable.
    pub fn secondary(first_lsn: i64) -> Arc<Self> {
        let replicator = Self::new(first_lsn);
        replicator.set_write_status(AccessStatus::NotPrimary);
        replicator.set_role(ReplicaRole::Secondary);
        replicator
    }

    pub fn set_read_status(&self, status: AccessStatus) {
        self.status.lock().read = status;
    }

    pub fn set_write_status(&self, status: AccessStatus) {
        self.status.lock().write = status;
    }

    pub fn set_role(&self, role: ReplicaRole) {
        self.status.lock().role = role;
    }

    /// Fail the next `count` appends with a transient error.
    pub fn fail_next_appends(&self, count: u32) {
        self.transient_failures.store(count, Ordering::Release);
    }

    /// Fail the next append with `error`, ahead of any status check.
    pub fn reject_next_append(&self, error: ReplicationError) {
        *self.rejection.lock() = Some(error);
    }

    /// Raise the visibility sequence number, as a host does after applying
    /// operations that arrived by other means.
    pub fn advance_visibility(&self, lsn: i64) {
        self.last_committed.fetch_max(lsn, Ordering::AcqRel);
        self.next_lsn.fetch_max(lsn + 1, Ordering::AcqRel);
    }

    pub fn last_committed_lsn(&self) -> i64 {
        self.last_committed.load(Ordering::Acquire)
    }

    /// Committed operations in sequence order.
    pub fn committed(&self) -> Vec<LoggedOperation> {
        self.committed.lock().clone()
    }

    pub fn pending_count(&self, txn: &TransactionHandle) -> usize {
        self.pending.lock().get(&txn.id()).map(Vec::len).unwrap_or(0)
    }

    /// Apply the transaction's operations to `store` as primary, then
    /// release its locks. Returns the last sequence number committed.
    pub async fn commit<K: StoreKey, V: StoreValue>(&self, store: &Store<K, V>, txn: &TransactionHandle) -> Result<i64> {
        let operations = self.pending.lock().remove(&txn.id()).unwrap_or_default();
        for logged in &operations {
            store
                .apply(
                    logged.lsn,
                    txn,
                    ApplyContext::PRIMARY_REDO,
                    &logged.operation.metadata,
                    Some(&logged.operation.redo),
                )
                .await?;
        }
        let last = operations.last().map(|logged| logged.lsn);
        self.committed.lock().extend(operations);
        if let Some(lsn) = last {
            self.last_committed.fetch_max(lsn, Ordering::AcqRel);
        }
        store.unlock(OperationContext {
            transaction_id: txn.id(),
        });
        Ok(self.last_committed_lsn())
    }

    /// Discard the transaction's operations and release its locks.
    pub async fn abort<K: StoreKey, V: StoreValue>(&self, store: &Store<K, V>, txn: &TransactionHandle) -> Result<()> {
        let operations = self.pending.lock().remove(&txn.id()).unwrap_or_default();
        for logged in operations.iter().rev() {
            store
                .apply(
                    logged.lsn,
                    txn,
                    ApplyContext::PRIMARY_UNDO,
                    &logged.operation.metadata,
                    logged.operation.undo.as_deref(),
                )
                .await?;
        }
        store.unlock(OperationContext {
            transaction_id: txn.id(),
        });
        Ok(())
    }

    /// Apply every committed operation after `after_lsn` to `store` with
    /// `context`. Returns the number of operations applied.
    pub async fn replay<K: StoreKey, V: StoreValue>(
        &self,
        store: &Store<K, V>,
        context: ApplyContext,
        after_lsn: i64,
    ) -> Result<usize> {
        let operations: Vec<LoggedOperation> =
            self.committed.lock().iter().filter(|logged| logged.lsn > after_lsn).cloned().collect();
        for logged in &operations {
            let operation_context = store
                .apply(
                    logged.lsn,
                    &logged.txn,
                    context,
                    &logged.operation.metadata,
                    Some(&logged.operation.redo),
                )
                .await?;
            store.unlock(operation_context);
        }
        Ok(operations.len())
    }
}

#[async_trait]
impl TransactionalReplicator for LoopbackReplicator {
    async fn append(&self, txn: &TransactionHandle, operation: ReplicatedOperation) -> Result<i64, ReplicationError> {
        if let Some(error) = self.rejection.lock().take() {
            return Err(error);
        }
        let failures = self.transient_failures.load(Ordering::Acquire);
        if failures > 0 {
            self.transient_failures.store(failures - 1, Ordering::Release);
            return Err(ReplicationError::Transient {
                reason: "injected failure".to_string(),
            });
        }
        if self.write_status() != AccessStatus::Granted {
            return Err(ReplicationError::NotPrimary);
        }
        let lsn = self.next_lsn.fetch_add(1, Ordering::AcqRel);
        self.pending.lock().entry(txn.id()).or_default().push(LoggedOperation {
            lsn,
            txn: *txn,
            operation,
        });
        Ok(lsn)
    }

    fn read_status(&self) -> AccessStatus {
        self.status.lock().read
    }

    fn write_status(&self) -> AccessStatus {
        self.status.lock().write
    }

    fn role(&self) -> ReplicaRole {
        self.status.lock().role
    }

    fn visibility_sequence_number(&self) -> i64 {
        self.last_committed_lsn()
    }
}
