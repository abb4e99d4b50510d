//! Ordered index of waiting load groups keyed by partition.

use std::collections::btree_map::{self, BTreeMap};
use std::ops::Bound;

/// Handle to an entry of a [`PartitionIndex`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionHandle<K>(K);

impl<K> PartitionHandle<K> {
    pub fn key(&self) -> &K {
        &self.0
    }
}

/// Ordered map from partition key to group, one group per key.
#[derive(Debug)]
pub struct PartitionIndex<K, V> {
    entries: BTreeMap<K, V>,
}

impl<K: Ord + Clone, V> PartitionIndex<K, V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert a group, replacing any group already stored under `key`.
    pub fn insert(&mut self, key: K, value: V) -> (PartitionHandle<K>, Option<V>) {
        let old = self.entries.insert(key.clone(), value);
        (PartitionHandle(key), old)
    }

    /// Get the group for `key`, creating it with `make` if absent.
    pub fn get_or_insert_with(&mut self, key: K, make: impl FnOnce() -> V) -> &mut V {
        match self.entries.entry(key) {
            btree_map::Entry::Occupied(e) => e.into_mut(),
            btree_map::Entry::Vacant(e) => e.insert(make()),
        }
    }

    /// Exact match.
    pub fn find(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Greatest entry whose key is `<= key`.
    pub fn find_nearest(&self, key: &K) -> Option<(PartitionHandle<K>, &V)> {
        self.entries
            .range((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(k, v)| (PartitionHandle(k.clone()), v))
    }

    /// Entry with the greatest key.
    pub fn last(&self) -> Option<(PartitionHandle<K>, &V)> {
        self.entries
            .iter()
            .next_back()
            .map(|(k, v)| (PartitionHandle(k.clone()), v))
    }

    /// Remove and return the entry with the greatest key.
    pub fn pop_last(&mut self) -> Option<(K, V)> {
        let key = self.entries.keys().next_back()?.clone();
        self.entries.remove(&key).map(|v| (key, v))
    }

    /// Delete the entry a handle points at. Stale handles return `None`.
    pub fn remove(&mut self, handle: &PartitionHandle<K>) -> Option<V> {
        self.entries.remove(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut()
    }
}

impl<K: Ord + Clone, V> Default for PartitionIndex<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
