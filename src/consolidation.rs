//! Consolidated view of all checkpointed versions.
//!
//! Prepared checkpoints hand their frozen differential to the manager as a
//! delta. Consolidation folds a batch of the oldest deltas into a single
//! key-ordered map, published copy-on-write so readers never block on it.
//! Versions that a fold displaces are offered to the snapshot container, and
//! tombstones are dropped once folded.
//!
//! Merging (file compaction) is decided by [`MergePolicy`] and executed by the
//! store, which owns file I/O.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::RangeBounds;
use std::sync::Arc;

use arc_swap::ArcSwap;
use mvstore_constants::checkpoint::MIN_FILES_FOR_INVALID_ENTRY_MERGE;
use parking_lot::RwLock;

use crate::differential::DifferentialStoreComponent;
use crate::item::VersionedItem;
use crate::metadata::MetadataTable;
use crate::snapshot::SnapshotContainer;

/// Key-ordered map of consolidated versions.
pub type ConsolidatedMap<K, V> = BTreeMap<K, Arc<VersionedItem<V>>>;

/// Result of one consolidation pass.
#[derive(Debug)]
pub struct ConsolidationOutcome<V> {
    pub folded_deltas: usize,
    pub folded_items: usize,
    /// Displaced versions now held by active snapshots; their values must
    /// stay readable after the files they live in are merged away.
    pub retained_for_snapshots: Vec<Arc<VersionedItem<V>>>,
}

/// Consolidated map plus the deltas not yet folded into it.
pub struct ConsolidationManager<K, V> {
    consolidated: ArcSwap<ConsolidatedMap<K, V>>,
    deltas: RwLock<Vec<Arc<DifferentialStoreComponent<K, V>>>>,
}

impl<K: Ord + Clone, V> Default for ConsolidationManager<K, V> {
    fn default() -> Self {
        Self::from_consolidated(BTreeMap::new())
    }
}

impl<K: Ord + Clone, V> ConsolidationManager<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager seeded with a recovered or copied map.
    pub fn from_consolidated(map: ConsolidatedMap<K, V>) -> Self {
        Self {
            consolidated: ArcSwap::from_pointee(map),
            deltas: RwLock::new(Vec::new()),
        }
    }

    pub fn append_delta(&self, delta: Arc<DifferentialStoreComponent<K, V>>) {
        debug_assert!(delta.is_frozen(), "CONSOLIDATION: delta must be frozen before aggregation");
        self.deltas.write().push(delta);
    }

    pub fn delta_count(&self) -> usize {
        self.deltas.read().len()
    }

    /// Aggregated deltas, oldest first.
    pub fn deltas(&self) -> Vec<Arc<DifferentialStoreComponent<K, V>>> {
        self.deltas.read().clone()
    }

    /// Current consolidated map.
    pub fn consolidated(&self) -> Arc<ConsolidatedMap<K, V>> {
        self.consolidated.load_full()
    }

    /// Newest version of `key` across deltas and the consolidated map.
    pub fn read(&self, key: &K) -> Option<Arc<VersionedItem<V>>> {
        // Deltas first: a fold publishes the map before removing its deltas.
        let from_delta = self.deltas.read().iter().rev().find_map(|delta| delta.read(key));
        from_delta.or_else(|| self.consolidated.load().get(key).cloned())
    }

    /// Newest version of `key` with `lsn <= visibility_lsn`.
    pub fn read_at(&self, key: &K, visibility_lsn: i64) -> Option<Arc<VersionedItem<V>>> {
        let from_delta = self.deltas.read().iter().rev().find_map(|delta| delta.read_at(key, visibility_lsn));
        from_delta.or_else(|| {
            self.consolidated
                .load()
                .get(key)
                .filter(|item| item.lsn() <= visibility_lsn)
                .cloned()
        })
    }

    /// Fold `to_fold` (a prefix of the aggregated deltas) into the map.
    /// `visible_lsn` is the visibility sequence number displaced versions
    /// are offered to `snapshots` against.
    pub fn consolidate(
        &self,
        to_fold: &[Arc<DifferentialStoreComponent<K, V>>],
        snapshots: &SnapshotContainer<K, V>,
        visible_lsn: i64,
    ) -> ConsolidationOutcome<V> {
        let mut map: ConsolidatedMap<K, V> = (*self.consolidated.load_full()).clone();
        let mut retained = Vec::new();
        let mut folded_items = 0usize;

        for delta in to_fold {
            for (key, state) in delta.states() {
                folded_items += 1;
                if let Some(previous) = &state.previous {
                    if snapshots.offer(&key, previous, state.current.lsn(), visible_lsn) {
                        retained.push(Arc::clone(previous));
                    }
                }
                let current = state.current;
                if let Some(older) = map.get(&key) {
                    if snapshots.offer(&key, older, current.lsn(), visible_lsn) {
                        retained.push(Arc::clone(older));
                    }
                }
                if current.is_deleted() {
                    map.remove(&key);
                } else {
                    map.insert(key, current);
                }
            }
        }

        self.consolidated.store(Arc::new(map));
        self.deltas
            .write()
            .retain(|delta| !to_fold.iter().any(|folded| Arc::ptr_eq(delta, folded)));

        ConsolidationOutcome {
            folded_deltas: to_fold.len(),
            folded_items,
            retained_for_snapshots: retained,
        }
    }

    /// Keys with any version in deltas or the map, within `range`.
    pub fn keys_in_range<R: RangeBounds<K>>(&self, range: &R) -> BTreeSet<K> {
        let mut keys: BTreeSet<K> = self
            .consolidated
            .load()
            .keys()
            .filter(|key| range.contains(*key))
            .cloned()
            .collect();
        for delta in self.deltas.read().iter() {
            keys.extend(delta.keys_in_range(range));
        }
        keys
    }

    /// Value bytes resident in memory across the map and deltas.
    pub fn resident_bytes(&self) -> u64 {
        let consolidated: u64 = self.consolidated.load().values().map(|item| item.resident_bytes()).sum();
        let deltas: u64 = self.deltas.read().iter().map(|delta| delta.resident_bytes()).sum();
        consolidated + deltas
    }

    /// Live versions in the map whose entry sits in one of `table`'s files.
    pub fn live_entries_in(&self, table: &MetadataTable) -> u64 {
        self.consolidated
            .load()
            .values()
            .filter(|item| {
                !item.is_deleted() && item.locator().map(|loc| table.get(loc.file_id).is_some()).unwrap_or(false)
            })
            .count() as u64
    }
}

// ============================================================================
// Merge policy
// ============================================================================

/// Why a merge was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeReason {
    FileCount,
    InvalidEntries,
}

/// Decides when the files of a table should be compacted into one.
#[derive(Debug, Clone, Copy)]
pub struct MergePolicy {
    pub file_count_threshold: u32,
    pub invalid_entries_percent: u32,
}

impl MergePolicy {
    pub fn new(file_count_threshold: u32, invalid_entries_percent: u32) -> Self {
        debug_assert!(file_count_threshold >= 2, "MERGE_POLICY: file_count_threshold must be >= 2");
        debug_assert!(
            invalid_entries_percent > 0 && invalid_entries_percent <= 100,
            "MERGE_POLICY: invalid_entries_percent must be in 1..=100"
        );
        Self {
            file_count_threshold,
            invalid_entries_percent,
        }
    }

    /// `live_entries` counts entries across `table`'s files that are still
    /// the newest version of a live key.
    pub fn should_merge(&self, table: &MetadataTable, live_entries: u64) -> Option<MergeReason> {
        let files = table.file_count() as u32;
        if files >= self.file_count_threshold {
            return Some(MergeReason::FileCount);
        }
        if files < MIN_FILES_FOR_INVALID_ENTRY_MERGE {
            return None;
        }
        let total = table.total_entries();
        if total == 0 {
            return None;
        }
        let invalid = total.saturating_sub(live_entries);
        if invalid.saturating_mul(100) >= total.saturating_mul(u64::from(self.invalid_entries_percent)) {
            return Some(MergeReason::InvalidEntries);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::metadata::FileRecord;

    fn live(lsn: i64, value: u64) -> Arc<VersionedItem<u64>> {
        Arc::new(VersionedItem::inserted(lsn, Arc::new(value), 8))
    }

    fn frozen(entries: &[(&str, Arc<VersionedItem<u64>>)]) -> Arc<DifferentialStoreComponent<String, u64>> {
        let delta = DifferentialStoreComponent::new();
        for (key, item) in entries {
            delta.add(key.to_string(), Arc::clone(item)).unwrap();
        }
        delta.freeze();
        Arc::new(delta)
    }

    fn table(files: u32, entries_per_file: u64) -> MetadataTable {
        let records = (1..=files)
            .map(|id| FileRecord {
                file_id: id,
                file_name: format!("f{id}"),
                total_entries: entries_per_file,
                deleted_entries: 0,
                size_bytes: 0,
            })
            .collect();
        MetadataTable::from_records(Path::new("/nonexistent"), 1, records)
    }

    #[test]
    fn test_read_prefers_newest_delta() {
        let manager = ConsolidationManager::new();
        manager.append_delta(frozen(&[("a", live(1, 1))]));
        manager.append_delta(frozen(&[("a", live(2, 2))]));
        let key = "a".to_string();
        assert_eq!(manager.read(&key).unwrap().lsn(), 2);
        assert_eq!(manager.read_at(&key, 1).unwrap().lsn(), 1);
        assert!(manager.read_at(&key, 0).is_none());
    }

    #[test]
    fn test_consolidate_folds_and_drops_tombstones() {
        let manager = ConsolidationManager::new();
        let snapshots = SnapshotContainer::new();
        let first = frozen(&[("a", live(1, 1)), ("b", live(2, 2))]);
        let second = frozen(&[("a", Arc::new(VersionedItem::deleted(3))), ("c", live(4, 4))]);
        manager.append_delta(Arc::clone(&first));
        manager.append_delta(Arc::clone(&second));

        let outcome = manager.consolidate(&[first, second], &snapshots, 4);
        assert_eq!(outcome.folded_deltas, 2);
        assert_eq!(outcome.folded_items, 4);
        assert!(outcome.retained_for_snapshots.is_empty());
        assert_eq!(manager.delta_count(), 0);

        let map = manager.consolidated();
        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn test_consolidate_leaves_newer_deltas() {
        let manager = ConsolidationManager::new();
        let snapshots = SnapshotContainer::new();
        let first = frozen(&[("a", live(1, 1))]);
        let second = frozen(&[("a", live(2, 2))]);
        manager.append_delta(Arc::clone(&first));
        manager.append_delta(second);

        manager.consolidate(&[first], &snapshots, 2);
        assert_eq!(manager.delta_count(), 1);
        assert_eq!(manager.read(&"a".to_string()).unwrap().lsn(), 2);
        assert_eq!(manager.consolidated().get("a").unwrap().lsn(), 1);
    }

    #[test]
    fn test_consolidate_offers_displaced_versions_to_snapshots() {
        let manager = ConsolidationManager::from_consolidated(BTreeMap::from([("a".to_string(), live(1, 1))]));
        let snapshots = Arc::new(SnapshotContainer::new());
        let reader = snapshots.register(2);
        let delta = frozen(&[("a", live(5, 5))]);
        manager.append_delta(Arc::clone(&delta));

        let outcome = manager.consolidate(&[delta], &snapshots, 5);
        assert_eq!(outcome.retained_for_snapshots.len(), 1);
        assert_eq!(snapshots.read(reader.lsn(), &"a".to_string()).unwrap().lsn(), 1);
    }

    #[test]
    fn test_keys_in_range_unions_layers() {
        let manager = ConsolidationManager::from_consolidated(BTreeMap::from([("a".to_string(), live(1, 1))]));
        manager.append_delta(frozen(&[("b", live(2, 2))]));
        let keys: Vec<String> = manager.keys_in_range(&(..)).into_iter().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_merge_policy_file_count() {
        let policy = MergePolicy::new(3, 50);
        assert_eq!(policy.should_merge(&table(3, 10), 30), Some(MergeReason::FileCount));
        assert_eq!(policy.should_merge(&table(2, 10), 20), None);
    }

    #[test]
    fn test_merge_policy_invalid_entries() {
        let policy = MergePolicy::new(16, 50);
        assert_eq!(policy.should_merge(&table(2, 10), 10), Some(MergeReason::InvalidEntries));
        assert_eq!(policy.should_merge(&table(2, 10), 11), None);
        // A single file never merges on invalid entries.
        assert_eq!(policy.should_merge(&table(1, 10), 0), None);
    }
}
