//! In-memory versions written since the last checkpoint was prepared.
//!
//! One mutable component receives applies. `PrepareCheckpoint` freezes it
//! into an immutable delta and installs a fresh one. Besides the current
//! version of each key the component keeps the immediately preceding
//! version written here, so a false-progress undo can restore it.

use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::item::VersionedItem;

/// Current and previous differential versions of one key.
#[derive(Debug)]
pub struct DifferentialState<V> {
    pub current: Arc<VersionedItem<V>>,
    pub previous: Option<Arc<VersionedItem<V>>>,
}

impl<V> Clone for DifferentialState<V> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
            previous: self.previous.clone(),
        }
    }
}

/// A version pushed out of the component by a newer write.
#[derive(Debug)]
pub struct Displaced<V> {
    pub item: Arc<VersionedItem<V>>,
    pub replaced_by_lsn: i64,
}

/// Result of undoing one applied version.
#[derive(Debug)]
pub struct UndoOutcome<V> {
    pub undone: Arc<VersionedItem<V>>,
    /// The version now current in this component, if any.
    pub restored: Option<Arc<VersionedItem<V>>>,
}

struct Inner<K, V> {
    entries: BTreeMap<K, DifferentialState<V>>,
    frozen: bool,
}

/// Differential state component.
pub struct DifferentialStoreComponent<K, V> {
    inner: RwLock<Inner<K, V>>,
}

impl<K: Ord + Clone, V> Default for DifferentialStoreComponent<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: BTreeMap::new(),
                frozen: false,
            }),
        }
    }
}

impl<K: Ord + Clone, V> DifferentialStoreComponent<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new current version of `key`.
    ///
    /// Fails with the item handed back if the component has been frozen;
    /// the caller retries against the component that replaced it.
    pub fn add(&self, key: K, item: Arc<VersionedItem<V>>) -> Result<Option<Displaced<V>>, Arc<VersionedItem<V>>> {
        let mut inner = self.inner.write();
        if inner.frozen {
            return Err(item);
        }
        match inner.entries.get_mut(&key) {
            Some(state) => {
                debug_assert!(
                    item.lsn() >= state.current.lsn(),
                    "DIFFERENTIAL: lsn {} applied after {}",
                    item.lsn(),
                    state.current.lsn()
                );
                let replaced_by_lsn = state.current.lsn();
                let old_current = std::mem::replace(&mut state.current, item);
                let displaced = state.previous.replace(old_current);
                Ok(displaced.map(|item| Displaced { item, replaced_by_lsn }))
            }
            None => {
                inner.entries.insert(key, DifferentialState {
                    current: item,
                    previous: None,
                });
                Ok(None)
            }
        }
    }

    /// Undo the version of `key` written at `lsn`, restoring the previous
    /// differential version or removing the key. `None` if the current
    /// version is not the one at `lsn`.
    pub fn undo_false_progress(&self, key: &K, lsn: i64) -> Option<UndoOutcome<V>> {
        let mut inner = self.inner.write();
        let state = inner.entries.get_mut(key)?;
        if state.current.lsn() != lsn {
            return None;
        }
        match state.previous.take() {
            Some(previous) => {
                let undone = std::mem::replace(&mut state.current, Arc::clone(&previous));
                Some(UndoOutcome {
                    undone,
                    restored: Some(previous),
                })
            }
            None => {
                let removed = inner.entries.remove(key)?;
                Some(UndoOutcome {
                    undone: removed.current,
                    restored: None,
                })
            }
        }
    }

    pub fn read(&self, key: &K) -> Option<Arc<VersionedItem<V>>> {
        self.inner.read().entries.get(key).map(|state| Arc::clone(&state.current))
    }

    /// Newest version of `key` with `lsn <= visibility_lsn`.
    pub fn read_at(&self, key: &K, visibility_lsn: i64) -> Option<Arc<VersionedItem<V>>> {
        let inner = self.inner.read();
        let state = inner.entries.get(key)?;
        if state.current.lsn() <= visibility_lsn {
            return Some(Arc::clone(&state.current));
        }
        state.previous.as_ref().filter(|previous| previous.lsn() <= visibility_lsn).cloned()
    }

    /// Stop accepting writes. Idempotent.
    pub fn freeze(&self) {
        self.inner.write().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.read().frozen
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Current versions in key order.
    pub fn items(&self) -> Vec<(K, Arc<VersionedItem<V>>)> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|(key, state)| (key.clone(), Arc::clone(&state.current)))
            .collect()
    }

    /// Current and previous versions in key order.
    pub fn states(&self) -> Vec<(K, DifferentialState<V>)> {
        self.inner.read().entries.iter().map(|(key, state)| (key.clone(), state.clone())).collect()
    }

    pub fn keys_in_range<R: RangeBounds<K>>(&self, range: &R) -> Vec<K> {
        self.inner
            .read()
            .entries
            .keys()
            .filter(|key| range.contains(*key))
            .cloned()
            .collect()
    }

    /// Value bytes held in memory by current and previous versions.
    pub fn resident_bytes(&self) -> u64 {
        self.inner
            .read()
            .entries
            .values()
            .map(|state| {
                state.current.resident_bytes() + state.previous.as_ref().map(|p| p.resident_bytes()).unwrap_or(0)
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(component: &DifferentialStoreComponent<String, u64>, key: &str, lsn: i64, value: u64) -> Option<Displaced<u64>> {
        component
            .add(key.to_string(), Arc::new(VersionedItem::inserted(lsn, Arc::new(value), 8)))
            .unwrap()
    }

    #[test]
    fn test_add_keeps_current_and_previous() {
        let component = DifferentialStoreComponent::new();
        assert!(put(&component, "a", 1, 10).is_none());
        assert!(put(&component, "a", 2, 20).is_none());
        let displaced = put(&component, "a", 3, 30).unwrap();
        assert_eq!(displaced.item.lsn(), 1);
        assert_eq!(displaced.replaced_by_lsn, 2);
        assert_eq!(component.read(&"a".to_string()).unwrap().lsn(), 3);
    }

    #[test]
    fn test_read_at_respects_visibility() {
        let component = DifferentialStoreComponent::new();
        put(&component, "a", 5, 1);
        put(&component, "a", 8, 2);
        let key = "a".to_string();
        assert_eq!(component.read_at(&key, 9).unwrap().lsn(), 8);
        assert_eq!(component.read_at(&key, 6).unwrap().lsn(), 5);
        assert!(component.read_at(&key, 4).is_none());
    }

    #[test]
    fn test_undo_false_progress_restores_previous_then_removes() {
        let component = DifferentialStoreComponent::new();
        put(&component, "a", 5, 1);
        put(&component, "a", 8, 2);
        let key = "a".to_string();

        assert!(component.undo_false_progress(&key, 5).is_none());

        let outcome = component.undo_false_progress(&key, 8).unwrap();
        assert_eq!(outcome.undone.lsn(), 8);
        assert_eq!(outcome.restored.unwrap().lsn(), 5);

        let outcome = component.undo_false_progress(&key, 5).unwrap();
        assert!(outcome.restored.is_none());
        assert!(component.read(&key).is_none());
        assert!(component.is_empty());
    }

    #[test]
    fn test_frozen_component_rejects_writes() {
        let component = DifferentialStoreComponent::new();
        put(&component, "a", 1, 1);
        component.freeze();
        assert!(component.is_frozen());
        let rejected = component.add("b".to_string(), Arc::new(VersionedItem::deleted(2)));
        assert_eq!(rejected.unwrap_err().lsn(), 2);
        assert_eq!(component.len(), 1);
    }

    #[test]
    fn test_items_are_key_ordered() {
        let component = DifferentialStoreComponent::new();
        put(&component, "c", 1, 1);
        put(&component, "a", 2, 1);
        put(&component, "b", 3, 1);
        let keys: Vec<String> = component.items().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(component.keys_in_range(&("b".to_string()..)), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(component.resident_bytes(), 24);
    }
}
