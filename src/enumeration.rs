//! Lazy, forward-only enumeration of committed state.
//!
//! The key set is fixed when the enumerator is created: the union of all
//! layers within the range. Each key is resolved at the pinned visibility
//! sequence number only when reached, and values load on demand, so an
//! enumerator over a large store stays cheap until it is driven.

use std::sync::Arc;

use futures::Stream;

use crate::error::Result;
use crate::key::StoreKey;
use crate::key::StoreValue;
use crate::snapshot::SnapshotRegistration;
use crate::store::Store;
use crate::transaction::ReadMode;

/// Enumerates live keys in key order.
pub struct KeyEnumerator<'a, K: StoreKey, V: StoreValue> {
    store: &'a Store<K, V>,
    keys: std::vec::IntoIter<K>,
    registration: SnapshotRegistration<K, V>,
}

impl<'a, K: StoreKey, V: StoreValue> KeyEnumerator<'a, K, V> {
    pub(crate) fn new(store: &'a Store<K, V>, keys: Vec<K>, registration: SnapshotRegistration<K, V>) -> Self {
        Self {
            store,
            keys: keys.into_iter(),
            registration,
        }
    }

    /// Visibility sequence number this enumerator reads at.
    pub fn visibility_lsn(&self) -> i64 {
        self.registration.lsn()
    }

    /// Next live key, or `None` when exhausted.
    pub fn next_key(&mut self) -> Option<K> {
        let lsn = self.registration.lsn();
        self.keys.by_ref().find(|key| {
            self.store
                .resolve_at(key, lsn)
                .map(|item| !item.is_deleted())
                .unwrap_or(false)
        })
    }
}

impl<K: StoreKey, V: StoreValue> Iterator for KeyEnumerator<'_, K, V> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        self.next_key()
    }
}

/// Enumerates live `(key, version, value)` triples in key order.
pub struct StoreEnumerator<'a, K: StoreKey, V: StoreValue> {
    store: &'a Store<K, V>,
    keys: std::vec::IntoIter<K>,
    registration: SnapshotRegistration<K, V>,
}

impl<'a, K: StoreKey, V: StoreValue> StoreEnumerator<'a, K, V> {
    pub(crate) fn new(store: &'a Store<K, V>, keys: Vec<K>, registration: SnapshotRegistration<K, V>) -> Self {
        Self {
            store,
            keys: keys.into_iter(),
            registration,
        }
    }

    pub fn visibility_lsn(&self) -> i64 {
        self.registration.lsn()
    }

    /// Next live entry, loading its value if it is not resident.
    pub async fn next(&mut self) -> Result<Option<(K, i64, V)>> {
        let lsn = self.registration.lsn();
        for key in self.keys.by_ref() {
            let Some(item) = self.store.resolve_at(&key, lsn) else {
                continue;
            };
            if item.is_deleted() {
                continue;
            }
            let value = self.store.load_value(&item, ReadMode::Off).await?;
            return Ok(Some((key, item.lsn(), Arc::unwrap_or_clone(value))));
        }
        Ok(None)
    }

    /// Adapt into a stream. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<(K, i64, V)>> + 'a {
        futures::stream::unfold(Some(self), |state| async move {
            let mut enumerator = state?;
            match enumerator.next().await {
                Ok(Some(entry)) => Some((Ok(entry), Some(enumerator))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
