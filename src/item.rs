//! Versioned items: one (sequence number, value-or-tombstone) pair for a key.
//!
//! An item is shared by `Arc` across the write-set, differential, snapshot,
//! and consolidated layers. Its sequence number and kind never change after
//! construction. The value slot and on-disk locator do: a checkpoint assigns
//! the locator, sweep evicts the value, and a lazy load restores it.
//!
//! # Tiger Style
//!
//! - A `Deleted` item never carries a value payload
//! - Only items with a locator may have their value evicted
//! - Value loads for one item are serialized by its load lock

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;

/// Kind of mutation an item records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Inserted,
    Updated,
    Deleted,
}

/// Location of an item's entry in a checkpoint file pair.
///
/// Tombstones are located too (file id only, zero-length value) so file
/// validity accounting sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueLocator {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

/// One version of a key.
#[derive(Debug)]
pub struct VersionedItem<V> {
    lsn: i64,
    kind: RecordKind,
    value: ArcSwapOption<V>,
    value_size: u32,
    locator: RwLock<Option<ValueLocator>>,
    load_lock: tokio::sync::Mutex<()>,
    in_use: AtomicBool,
}

impl<V> VersionedItem<V> {
    /// New in-memory version carrying a value.
    pub fn with_value(kind: RecordKind, lsn: i64, value: Arc<V>, value_size: u32) -> Self {
        debug_assert!(kind != RecordKind::Deleted, "ITEM: deleted item cannot carry a value");
        Self {
            lsn,
            kind,
            value: ArcSwapOption::new(Some(value)),
            value_size,
            locator: RwLock::new(None),
            load_lock: tokio::sync::Mutex::new(()),
            in_use: AtomicBool::new(true),
        }
    }

    pub fn inserted(lsn: i64, value: Arc<V>, value_size: u32) -> Self {
        Self::with_value(RecordKind::Inserted, lsn, value, value_size)
    }

    pub fn updated(lsn: i64, value: Arc<V>, value_size: u32) -> Self {
        Self::with_value(RecordKind::Updated, lsn, value, value_size)
    }

    pub fn deleted(lsn: i64) -> Self {
        Self {
            lsn,
            kind: RecordKind::Deleted,
            value: ArcSwapOption::empty(),
            value_size: 0,
            locator: RwLock::new(None),
            load_lock: tokio::sync::Mutex::new(()),
            in_use: AtomicBool::new(false),
        }
    }

    /// Version read back from a checkpoint file, value not yet loaded.
    pub fn on_disk(kind: RecordKind, lsn: i64, value_size: u32, locator: ValueLocator) -> Self {
        Self {
            lsn,
            kind,
            value: ArcSwapOption::empty(),
            value_size: if kind == RecordKind::Deleted { 0 } else { value_size },
            locator: RwLock::new(Some(locator)),
            load_lock: tokio::sync::Mutex::new(()),
            in_use: AtomicBool::new(false),
        }
    }

    pub fn lsn(&self) -> i64 {
        self.lsn
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == RecordKind::Deleted
    }

    /// Size of the encoded value in bytes.
    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    /// Resident value, if any. Marks the item as recently used.
    pub fn value(&self) -> Option<Arc<V>> {
        let value = self.value.load_full();
        if value.is_some() {
            self.in_use.store(true, Ordering::Relaxed);
        }
        value
    }

    pub fn has_value(&self) -> bool {
        self.value.load().is_some()
    }

    /// Cache a loaded value.
    pub fn set_value(&self, value: Arc<V>) {
        debug_assert!(!self.is_deleted(), "ITEM: deleted item cannot carry a value");
        if self.is_deleted() {
            return;
        }
        self.value.store(Some(value));
        self.in_use.store(true, Ordering::Relaxed);
    }

    /// Drop the resident value. Returns the bytes released, or 0 if the item
    /// has no on-disk copy to reload from.
    pub fn evict_value(&self) -> u64 {
        if self.locator.read().is_none() {
            return 0;
        }
        match self.value.swap(None) {
            Some(_) => u64::from(self.value_size),
            None => 0,
        }
    }

    pub fn locator(&self) -> Option<ValueLocator> {
        *self.locator.read()
    }

    pub fn set_locator(&self, locator: ValueLocator) {
        *self.locator.write() = Some(locator);
    }

    /// Serializes concurrent loads of this item's value.
    pub fn load_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.load_lock
    }

    /// Clears the recently-used bit, returning its previous value.
    pub fn take_in_use(&self) -> bool {
        self.in_use.swap(false, Ordering::Relaxed)
    }

    /// Bytes of value payload held in memory.
    pub fn resident_bytes(&self) -> u64 {
        if self.has_value() {
            u64::from(self.value_size)
        } else {
            0
        }
    }
}

/// True if `item` is present and not a tombstone.
pub fn is_live<V>(item: Option<&Arc<VersionedItem<V>>>) -> bool {
    item.map(|item| !item.is_deleted()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator() -> ValueLocator {
        ValueLocator {
            file_id: 1,
            offset: 0,
            len: 8,
        }
    }

    #[test]
    fn test_deleted_item_never_holds_value() {
        let item: VersionedItem<u64> = VersionedItem::deleted(7);
        assert!(item.is_deleted());
        assert!(!item.has_value());
        assert_eq!(item.value_size(), 0);
        assert_eq!(item.resident_bytes(), 0);
    }

    #[test]
    fn test_evict_requires_locator() {
        let item = VersionedItem::inserted(3, Arc::new(42u64), 8);
        assert_eq!(item.evict_value(), 0);
        assert!(item.has_value());

        item.set_locator(locator());
        assert_eq!(item.evict_value(), 8);
        assert!(!item.has_value());
        assert_eq!(item.evict_value(), 0);
    }

    #[test]
    fn test_on_disk_item_loads_lazily() {
        let item: VersionedItem<u64> = VersionedItem::on_disk(RecordKind::Updated, 9, 8, locator());
        assert!(!item.has_value());
        assert_eq!(item.locator(), Some(locator()));

        item.set_value(Arc::new(5));
        assert_eq!(item.value().as_deref(), Some(&5));
    }

    #[test]
    fn test_value_access_sets_in_use() {
        let item: VersionedItem<u64> = VersionedItem::on_disk(RecordKind::Inserted, 1, 8, locator());
        assert!(!item.take_in_use());
        item.set_value(Arc::new(1));
        assert!(item.take_in_use());
        assert!(!item.take_in_use());
        let _ = item.value();
        assert!(item.take_in_use());
    }

    #[test]
    fn test_is_live() {
        let live = Arc::new(VersionedItem::inserted(1, Arc::new(1u64), 8));
        let dead: Arc<VersionedItem<u64>> = Arc::new(VersionedItem::deleted(2));
        assert!(is_live(Some(&live)));
        assert!(!is_live(Some(&dead)));
        assert!(!is_live::<u64>(None));
    }
}
