//! Versions retained for active snapshot reads.
//!
//! Each active visibility sequence number owns a component holding the
//! versions it can still see but that newer writes or consolidation have
//! displaced from the differential and consolidated layers. A displaced
//! version belongs to snapshot `v` iff `displaced.lsn <= v < replacing.lsn`.
//! Components are reference counted by [`SnapshotRegistration`] guards and
//! dropped with their last reader.
//!
//! A version displaced above the replicator's visibility sequence number may
//! still be the one a snapshot registered later must see, so such versions
//! are also kept as pending until visibility passes their replacement. A new
//! component is seeded from them, and [`SnapshotContainer::register_visible`]
//! reads visibility under the same lock `offer` takes.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::item::VersionedItem;

struct SnapshotComponent<K, V> {
    readers: usize,
    items: BTreeMap<K, Arc<VersionedItem<V>>>,
}

/// A displaced version not yet invisible to every future snapshot.
struct PendingVersion<K, V> {
    key: K,
    item: Arc<VersionedItem<V>>,
    replaced_by_lsn: i64,
}

struct SnapshotState<K, V> {
    components: BTreeMap<i64, SnapshotComponent<K, V>>,
    pending: Vec<PendingVersion<K, V>>,
}

/// Snapshot components keyed by visibility sequence number.
pub struct SnapshotContainer<K, V> {
    state: Mutex<SnapshotState<K, V>>,
}

impl<K: Ord + Clone, V> Default for SnapshotContainer<K, V> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SnapshotState {
                components: BTreeMap::new(),
                pending: Vec::new(),
            }),
        }
    }
}

impl<K, V> SnapshotContainer<K, V> {
    fn unregister(&self, lsn: i64) {
        let mut state = self.state.lock();
        if let Some(component) = state.components.get_mut(&lsn) {
            component.readers = component.readers.saturating_sub(1);
            if component.readers == 0 {
                state.components.remove(&lsn);
            }
        }
    }
}

impl<K: Ord + Clone, V> SnapshotContainer<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `lsn` for reading until the returned guard drops.
    pub fn register(self: &Arc<Self>, lsn: i64) -> SnapshotRegistration<K, V> {
        let mut state = self.state.lock();
        Self::register_locked(&mut state, lsn);
        SnapshotRegistration {
            container: Arc::clone(self),
            lsn,
        }
    }

    /// Pin the visibility sequence number `visibility` returns, read while
    /// no version can be offered.
    pub fn register_visible(self: &Arc<Self>, visibility: impl FnOnce() -> i64) -> SnapshotRegistration<K, V> {
        let mut state = self.state.lock();
        let lsn = visibility();
        Self::register_locked(&mut state, lsn);
        SnapshotRegistration {
            container: Arc::clone(self),
            lsn,
        }
    }

    fn register_locked(state: &mut SnapshotState<K, V>, lsn: i64) {
        let SnapshotState { components, pending } = state;
        let component = components.entry(lsn).or_insert_with(|| {
            let items = pending
                .iter()
                .filter(|version| version.item.lsn() <= lsn && lsn < version.replaced_by_lsn)
                .map(|version| (version.key.clone(), Arc::clone(&version.item)))
                .collect();
            SnapshotComponent { readers: 0, items }
        });
        component.readers += 1;
    }

    /// Offer a version displaced by a write at `replaced_by_lsn`, with
    /// `visible_lsn` the current visibility sequence number. Returns true if
    /// an active snapshot kept it or a later one may still need it.
    pub fn offer(&self, key: &K, displaced: &Arc<VersionedItem<V>>, replaced_by_lsn: i64, visible_lsn: i64) -> bool {
        if displaced.lsn() >= replaced_by_lsn {
            return false;
        }
        let mut state = self.state.lock();
        state.pending.retain(|version| version.replaced_by_lsn > visible_lsn);

        let mut kept = false;
        for (_, component) in state.components.range_mut(displaced.lsn()..replaced_by_lsn) {
            component.items.entry(key.clone()).or_insert_with(|| {
                kept = true;
                Arc::clone(displaced)
            });
        }
        if replaced_by_lsn > visible_lsn {
            state.pending.push(PendingVersion {
                key: key.clone(),
                item: Arc::clone(displaced),
                replaced_by_lsn,
            });
            kept = true;
        }
        kept
    }

    /// Version of `key` retained for snapshot `lsn`.
    pub fn read(&self, lsn: i64, key: &K) -> Option<Arc<VersionedItem<V>>> {
        self.state
            .lock()
            .components
            .get(&lsn)
            .and_then(|component| component.items.get(key).cloned())
    }

    /// Keys retained for snapshot `lsn` within `range`.
    pub fn keys_in_range<R: RangeBounds<K>>(&self, lsn: i64, range: &R) -> Vec<K> {
        let state = self.state.lock();
        let Some(component) = state.components.get(&lsn) else {
            return Vec::new();
        };
        component
            .items
            .range::<K, _>((clone_bound(range.start_bound()), clone_bound(range.end_bound())))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn active_snapshot_count(&self) -> usize {
        self.state.lock().components.len()
    }

    pub fn has_active_snapshots(&self) -> bool {
        !self.state.lock().components.is_empty()
    }

    /// Retained versions across all snapshots, pending ones included.
    pub fn retained_item_count(&self) -> usize {
        let state = self.state.lock();
        state.components.values().map(|component| component.items.len()).sum::<usize>() + state.pending.len()
    }
}

fn clone_bound<K: Clone>(bound: Bound<&K>) -> Bound<K> {
    match bound {
        Bound::Included(key) => Bound::Included(key.clone()),
        Bound::Excluded(key) => Bound::Excluded(key.clone()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Keeps a snapshot component alive; unregisters on drop.
pub struct SnapshotRegistration<K, V> {
    container: Arc<SnapshotContainer<K, V>>,
    lsn: i64,
}

impl<K, V> SnapshotRegistration<K, V> {
    pub fn lsn(&self) -> i64 {
        self.lsn
    }
}

impl<K, V> Drop for SnapshotRegistration<K, V> {
    fn drop(&mut self) {
        self.container.unregister(self.lsn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(lsn: i64, value: u64) -> Arc<VersionedItem<u64>> {
        Arc::new(VersionedItem::inserted(lsn, Arc::new(value), 8))
    }

    #[test]
    fn test_offer_only_reaches_snapshots_that_saw_the_version() {
        let container: Arc<SnapshotContainer<String, u64>> = Arc::new(SnapshotContainer::new());
        let before = container.register(4);
        let during = container.register(6);
        let after = container.register(10);

        // Version written at 5, replaced at 10: visible to snapshot 6 only.
        assert!(container.offer(&"k".to_string(), &item(5, 1), 10, 10));
        assert!(container.read(before.lsn(), &"k".to_string()).is_none());
        assert_eq!(container.read(during.lsn(), &"k".to_string()).unwrap().lsn(), 5);
        assert!(container.read(after.lsn(), &"k".to_string()).is_none());
    }

    #[test]
    fn test_first_offer_wins_per_snapshot() {
        let container: Arc<SnapshotContainer<String, u64>> = Arc::new(SnapshotContainer::new());
        let snapshot = container.register(8);
        assert!(container.offer(&"k".to_string(), &item(3, 1), 9, 9));
        assert!(!container.offer(&"k".to_string(), &item(2, 0), 9, 9));
        assert_eq!(container.read(snapshot.lsn(), &"k".to_string()).unwrap().lsn(), 3);
    }

    #[test]
    fn test_registration_drop_releases_component() {
        let container: Arc<SnapshotContainer<String, u64>> = Arc::new(SnapshotContainer::new());
        let first = container.register(5);
        let second = container.register(5);
        assert_eq!(container.active_snapshot_count(), 1);

        drop(first);
        assert!(container.has_active_snapshots());
        drop(second);
        assert!(!container.has_active_snapshots());
        assert!(!container.offer(&"k".to_string(), &item(1, 1), 9, 9));
    }

    #[test]
    fn test_keys_in_range() {
        let container: Arc<SnapshotContainer<String, u64>> = Arc::new(SnapshotContainer::new());
        let snapshot = container.register(5);
        for key in ["a", "b", "c"] {
            container.offer(&key.to_string(), &item(1, 1), 9, 9);
        }
        let keys = container.keys_in_range(snapshot.lsn(), &("b".to_string()..));
        assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(container.retained_item_count(), 3);
    }

    #[test]
    fn test_snapshot_registered_late_sees_version_displaced_above_visibility() {
        let container: Arc<SnapshotContainer<String, u64>> = Arc::new(SnapshotContainer::new());
        let key = "k".to_string();
        // Visible at 10: version 8. Writes at 11 and 12 land before any
        // snapshot at 10 exists; the second pushes 8 out (replaced at 11).
        assert!(container.offer(&key, &item(8, 1), 11, 10));
        assert_eq!(container.retained_item_count(), 1);

        let reader = container.register_visible(|| 10);
        assert_eq!(reader.lsn(), 10);
        assert_eq!(container.read(10, &key).unwrap().lsn(), 8);

        // Once visibility passes the replacement, no new snapshot needs it.
        drop(reader);
        assert!(!container.offer(&"other".to_string(), &item(1, 1), 2, 12));
        assert_eq!(container.retained_item_count(), 0);
        let later = container.register_visible(|| 12);
        assert!(container.read(later.lsn(), &key).is_none());
    }
}
