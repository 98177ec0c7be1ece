use crate::cache::RandomState;
use crate::cache::cell::SingleFlightCell;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::{Arc, OnceLock};

/// A concurrent key-value store a [`KeyedCache`](crate::KeyedCache) is layered on.
///
/// Implementations must be safe to call from many threads at once and must not serialize
/// unrelated keys for longer than a single map operation. Eviction backends may drop entries at
/// any time; a dropped entry simply turns the next lookup into a miss.
pub trait BackingStore<K, T>: Send + Sync {
    /// Returns the entry stored for `key` and `true`, or stores `value` and returns it with
    /// `false`.
    fn load_or_store(&self, key: K, value: T) -> (T, bool);

    /// Returns the entry stored for `key` without inserting anything.
    fn load(&self, key: &K) -> Option<T>;

    /// Removes the entry for `key`. Removing a subtree entry clears the nested store as well.
    fn delete(&self, key: &K);

    /// Removes every entry, recursing into nested stores.
    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs an eviction pass. Stores without a size policy do nothing.
    fn evict(&self) {}

    /// Returns the number of evictions since the last call and resets the counter.
    fn take_eviction_count(&self) -> u64 {
        0
    }
}

impl<K, T, S> BackingStore<K, T> for Box<S>
where
    S: BackingStore<K, T> + ?Sized,
{
    fn load_or_store(&self, key: K, value: T) -> (T, bool) {
        (**self).load_or_store(key, value)
    }

    fn load(&self, key: &K) -> Option<T> {
        (**self).load(key)
    }

    fn delete(&self, key: &K) {
        (**self).delete(key)
    }

    fn clear(&self) {
        (**self).clear()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn evict(&self) {
        (**self).evict()
    }

    fn take_eviction_count(&self) -> u64 {
        (**self).take_eviction_count()
    }
}

/// A nested store reachable through an entry of its parent store.
pub trait Subtree: Send + Sync {
    fn clear(&self);

    fn evict(&self);
}

/// Anything a backing store can hold. Entries that own a nested store expose it so removal and
/// eviction can recurse into it.
pub trait StoreEntry: Clone + Send + Sync {
    fn subtree(&self) -> Option<&dyn Subtree> {
        None
    }
}

/// The per-key entry of a [`KeyedCache`](crate::KeyedCache): a single-flight cell plus an
/// optional handle to the nested store the cell's value owns.
pub struct Slot<V> {
    cell: SingleFlightCell<V>,
    subtree: OnceLock<Arc<dyn Subtree>>,
}

pub type SharedSlot<V> = Arc<Slot<V>>;

impl<V> Slot<V> {
    pub fn new() -> Self {
        Self {
            cell: SingleFlightCell::new(),
            subtree: OnceLock::new(),
        }
    }

    pub fn cell(&self) -> &SingleFlightCell<V> {
        &self.cell
    }

    pub(crate) fn attach(&self, subtree: Arc<dyn Subtree>) {
        let _ = self.subtree.set(subtree);
    }
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for Slot<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("cell", &self.cell)
            .field("has_subtree", &self.subtree.get().is_some())
            .finish()
    }
}

impl<V: Send + Sync> StoreEntry for SharedSlot<V> {
    fn subtree(&self) -> Option<&dyn Subtree> {
        self.subtree.get().map(|subtree| subtree.as_ref())
    }
}

/// Unbounded store on top of a sharded concurrent map. Entries stay until deleted.
pub struct ConcurrentStore<K, T, S = RandomState> {
    map: DashMap<K, T, S>,
}

impl<K, T> ConcurrentStore<K, T, RandomState>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K, T> Default for ConcurrentStore<K, T, RandomState>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T, S> ConcurrentStore<K, T, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            map: DashMap::with_hasher(hash_builder),
        }
    }
}

impl<K, T, S> BackingStore<K, T> for ConcurrentStore<K, T, S>
where
    K: Clone + Eq + Hash + Send + Sync,
    T: StoreEntry,
    S: BuildHasher + Clone + Send + Sync,
{
    fn load_or_store(&self, key: K, value: T) -> (T, bool) {
        match self.map.entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), true),
            Entry::Vacant(entry) => {
                entry.insert(value.clone());
                (value, false)
            }
        }
    }

    fn load(&self, key: &K) -> Option<T> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    fn delete(&self, key: &K) {
        // The shard lock is released before recursing.
        if let Some((_, removed)) = self.map.remove(key) {
            if let Some(subtree) = removed.subtree() {
                subtree.clear();
            }
        }
    }

    fn clear(&self) {
        let keys: Vec<K> = self.map.iter().map(|entry| entry.key().clone()).collect();
        for key in &keys {
            self.delete(key);
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
impl StoreEntry for u32 {}

#[cfg(test)]
impl StoreEntry for u64 {}

#[cfg(test)]
impl StoreEntry for &'static str {}
