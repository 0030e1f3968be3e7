//! Change notifications for embedders of the store.
//!
//! Handlers are awaited inline on the apply path, so a slow handler slows
//! replication. Each event kind can be masked off independently.

use std::sync::Arc;

use async_trait::async_trait;

use crate::replicator::TransactionHandle;

/// Bit set selecting which events reach the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeEventMask(u8);

impl ChangeEventMask {
    pub const NONE: ChangeEventMask = ChangeEventMask(0);
    pub const ADDED: ChangeEventMask = ChangeEventMask(1);
    pub const UPDATED: ChangeEventMask = ChangeEventMask(1 << 1);
    pub const REMOVED: ChangeEventMask = ChangeEventMask(1 << 2);
    pub const REBUILT: ChangeEventMask = ChangeEventMask(1 << 3);
    pub const ALL: ChangeEventMask = ChangeEventMask(0b1111);

    pub fn contains(self, other: ChangeEventMask) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl std::ops::BitOr for ChangeEventMask {
    type Output = ChangeEventMask;

    fn bitor(self, rhs: ChangeEventMask) -> ChangeEventMask {
        ChangeEventMask(self.0 | rhs.0)
    }
}

/// One committed key-value pair in a rebuilt state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuiltEntry<K, V> {
    pub key: K,
    pub version: i64,
    pub value: V,
}

/// Receives store change events. All methods default to no-ops.
#[async_trait]
pub trait StoreChangeHandler<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn on_added(&self, _txn: &TransactionHandle, _key: &K, _value: &V, _lsn: i64, _is_primary: bool) {}

    async fn on_updated(&self, _txn: &TransactionHandle, _key: &K, _value: &V, _lsn: i64, _is_primary: bool) {}

    async fn on_removed(&self, _txn: &TransactionHandle, _key: &K, _lsn: i64, _is_primary: bool) {}

    /// The store's whole state was replaced (recovery, copy, restore).
    async fn on_rebuilt(&self, _state: Vec<RebuiltEntry<K, V>>) {}
}

/// Handler and the events it subscribed to.
pub struct ChangeHandlerRegistration<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub handler: Arc<dyn StoreChangeHandler<K, V>>,
    pub mask: ChangeEventMask,
}

impl<K, V> ChangeHandlerRegistration<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn wants(&self, event: ChangeEventMask) -> bool {
        self.mask.contains(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_contains() {
        let mask = ChangeEventMask::ADDED | ChangeEventMask::REMOVED;
        assert!(mask.contains(ChangeEventMask::ADDED));
        assert!(mask.contains(ChangeEventMask::REMOVED));
        assert!(!mask.contains(ChangeEventMask::UPDATED));
        assert!(!mask.contains(ChangeEventMask::NONE));
        assert!(ChangeEventMask::ALL.contains(ChangeEventMask::REBUILT));
    }
}
