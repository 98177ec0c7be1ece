use crate::cache::RandomState;
use crate::cache::entry::RecencyList;
use crate::cache::store::{BackingStore, StoreEntry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Recency order that several [`LruBackend`]s can share, typically all levels of one tree.
///
/// Each backend joined to the list keeps its own keys, but an insert always evicts the least
/// recently used entry of the whole list, whichever backend owns it. Clones refer to the same
/// list.
pub struct SharedLruList<K, T, S = RandomState>(Arc<LruList<K, T, S>>);

struct LruList<K, T, S> {
    state: Mutex<LruState<K, T, S>>,
    next_owner: AtomicU64,
}

/// Entries are keyed by the id of the owning backend and the key within that backend.
struct LruState<K, T, S> {
    index: HashMap<(u64, K), usize, S>,
    list: RecencyList<(u64, K), T>,
    lens: HashMap<u64, usize, RandomState>,
}

impl<K, T> SharedLruList<K, T, RandomState> {
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K, T> Default for SharedLruList<K, T, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T, S> Clone for SharedLruList<K, T, S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<K, T, S> SharedLruList<K, T, S> {
    pub fn with_hasher(hash_builder: S) -> Self {
        Self(Arc::new(LruList {
            state: Mutex::new(LruState {
                index: HashMap::with_hasher(hash_builder),
                list: RecencyList::new(),
                lens: HashMap::default(),
            }),
            next_owner: AtomicU64::new(0),
        }))
    }

    /// Returns the number of entries over all joined backends.
    pub fn len(&self) -> usize {
        self.0.state.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry of every joined backend.
    ///
    /// Entries that own a backend joined to the same list keep the list alive, so a list shared by
    /// the levels of a tree must be cleared before it can be freed.
    pub fn clear(&self) {
        let values = {
            let mut state = self.0.state.lock();
            state.index.clear();
            state.lens.clear();
            state.list.take_values()
        };
        // Dropped values may own backends that lock this list again.
        drop(values);
    }

    #[cfg(test)]
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl<K, T, S> LruState<K, T, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn remove_key(&mut self, key: &(u64, K)) -> Option<T> {
        let index = *self.index.get(key)?;
        self.remove_at(index)
    }

    fn remove_at(&mut self, index: usize) -> Option<T> {
        let (key, value) = self.list.remove(index)?.into_parts();
        self.index.remove(&key);

        let owner = key.0;
        if let Some(len) = self.lens.get_mut(&owner) {
            *len -= 1;
            if *len == 0 {
                self.lens.remove(&owner);
            }
        }

        Some(value)
    }
}

/// A backing store bounded by recency.
///
/// Entries live in a doubly linked list ordered from most to least recently used, indexed by a
/// hash map. Every mutation takes a single mutex, which keeps the recency order exact. After an
/// insert the list never holds more than `capacity` entries; a capacity of zero disables caching.
///
/// A backend built with [`LruBackend::new`] has a list of its own. Backends built with
/// [`LruBackend::shared`] bound their combined size through one [`SharedLruList`]. Evicted entries
/// that own a nested store have it cleared.
pub struct LruBackend<K, T, S = RandomState> {
    capacity: usize,
    owner: u64,
    list: Arc<LruList<K, T, S>>,
    eviction_count: AtomicU64,
}

impl<K, T> LruBackend<K, T, RandomState> {
    pub fn new(capacity: usize) -> Self {
        Self::with_hasher(capacity, Default::default())
    }
}

impl<K, T, S> LruBackend<K, T, S> {
    pub fn with_hasher(capacity: usize, hash_builder: S) -> Self {
        Self::shared(&SharedLruList::with_hasher(hash_builder), capacity)
    }

    /// Creates an empty backend that joins `list`. Its inserts evict from the tail of the shared
    /// list until the list holds at most `capacity` entries.
    pub fn shared(list: &SharedLruList<K, T, S>, capacity: usize) -> Self {
        Self {
            capacity,
            owner: list.0.next_owner.fetch_add(1, Ordering::Relaxed),
            list: Arc::clone(&list.0),
            eviction_count: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<K, T, S> LruBackend<K, T, S>
where
    K: Clone,
{
    /// Returns the keys ordered from the most to the least recently used.
    pub fn keys(&self) -> Vec<K> {
        let state = self.list.state.lock();
        state
            .list
            .iter()
            .filter(|entry| entry.key().0 == self.owner)
            .map(|entry| entry.key().1.clone())
            .collect()
    }
}

impl<K, T, S> BackingStore<K, T> for LruBackend<K, T, S>
where
    K: Clone + Eq + Hash + Send + Sync,
    T: StoreEntry,
    S: BuildHasher + Send + Sync,
{
    fn load_or_store(&self, key: K, value: T) -> (T, bool) {
        let key = (self.owner, key);

        let evicted = {
            let mut state = self.list.state.lock();

            if let Some(&index) = state.index.get(&key) {
                state.list.move_to_front(index);
                if let Some(entry) = state.list.get(index) {
                    return (entry.value().clone(), true);
                }
            }

            let index = state.list.push_front(key.clone(), value.clone());
            state.index.insert(key, index);
            *state.lens.entry(self.owner).or_default() += 1;

            let mut evicted = Vec::new();
            while state.list.len() > self.capacity {
                let Some(tail) = state.list.tail() else {
                    break;
                };
                match state.remove_at(tail) {
                    Some(value) => evicted.push(value),
                    None => break,
                }
            }
            if !evicted.is_empty() {
                trace!(
                    evicted = evicted.len(),
                    len = state.list.len(),
                    "evicted least recently used entries"
                );
            }
            evicted
        };

        if !evicted.is_empty() {
            self.eviction_count.fetch_add(evicted.len() as u64, Ordering::AcqRel);
        }
        // Nested stores lock the shared list themselves.
        for subtree in evicted.iter().filter_map(StoreEntry::subtree) {
            debug!("clearing subtree of evicted entry");
            subtree.clear();
        }

        (value, false)
    }

    fn load(&self, key: &K) -> Option<T> {
        let state = self.list.state.lock();
        let index = *state.index.get(&(self.owner, key.clone()))?;
        state.list.get(index).map(|entry| entry.value().clone())
    }

    fn delete(&self, key: &K) {
        let removed = self.list.state.lock().remove_key(&(self.owner, key.clone()));

        // The nested store is cleared without holding the list's lock.
        if let Some(subtree) = removed.as_ref().and_then(StoreEntry::subtree) {
            debug!("clearing subtree of deleted entry");
            subtree.clear();
        }
    }

    fn clear(&self) {
        for key in self.keys() {
            self.delete(&key);
        }
    }

    fn len(&self) -> usize {
        let state = self.list.state.lock();
        state.lens.get(&self.owner).copied().unwrap_or(0)
    }

    fn take_eviction_count(&self) -> u64 {
        self.eviction_count.swap(0, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::{SharedSlot, Slot, Subtree};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn it_evicts_the_least_recently_used_entry() {
        // given
        let lru: LruBackend<u32, u32> = LruBackend::new(3);

        // when
        for key in 1..=4 {
            lru.load_or_store(key, key * 10);
        }

        // then
        assert_eq!(lru.load(&1), None);
        assert_eq!(lru.keys(), vec![4, 3, 2]);
        assert_eq!(lru.take_eviction_count(), 1);
    }

    #[test]
    fn it_refreshes_recency_on_load_or_store() {
        // given
        let lru: LruBackend<u32, u32> = LruBackend::new(3);
        lru.load_or_store(1, 10);
        lru.load_or_store(2, 20);
        lru.load_or_store(3, 30);

        // when
        let existing = lru.load_or_store(1, 11);
        lru.load_or_store(4, 40);

        // then
        assert_eq!(existing, (10, true));
        assert_eq!(lru.load(&2), None);
        assert_eq!(lru.keys(), vec![4, 1, 3]);
    }

    #[test]
    fn it_does_not_refresh_recency_on_load() {
        // given
        let lru: LruBackend<u32, u32> = LruBackend::new(2);
        lru.load_or_store(1, 10);
        lru.load_or_store(2, 20);

        // when
        lru.load(&1);
        lru.load_or_store(3, 30);

        // then
        assert_eq!(lru.keys(), vec![3, 2]);
    }

    #[test]
    fn it_handles_zero_capacity() {
        // given
        let lru: LruBackend<u32, u32> = LruBackend::new(0);

        // when
        let stored = lru.load_or_store(1, 10);

        // then
        assert_eq!(stored, (10, false));
        assert!(lru.is_empty());
    }

    #[test]
    fn it_deletes_and_clears_nested_stores() {
        // given
        #[derive(Default)]
        struct CountingSubtree(AtomicUsize);

        impl Subtree for CountingSubtree {
            fn clear(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }

            fn evict(&self) {}
        }

        let lru: LruBackend<&str, SharedSlot<u32>> = LruBackend::new(4);
        let subtree = Arc::new(CountingSubtree::default());
        let branch = Arc::new(Slot::new());
        branch.attach(subtree.clone());
        lru.load_or_store("branch", branch);
        lru.load_or_store("leaf", Arc::new(Slot::new()));

        // when
        lru.delete(&"branch");
        lru.delete(&"missing");

        // then
        assert_eq!(subtree.0.load(Ordering::SeqCst), 1);
        assert_eq!(lru.keys(), vec!["leaf"]);
    }

    #[test]
    fn it_does_not_reserve_memory_for_the_capacity() {
        // given
        let lru: LruBackend<u64, u64> = LruBackend::new(usize::MAX);

        // when
        let stored = lru.load_or_store(1, 10);

        // then
        assert_eq!(stored, (10, false));
        assert_eq!(lru.keys(), vec![1]);
        assert_eq!(lru.capacity(), usize::MAX);
    }

    #[test]
    fn it_evicts_the_oldest_entry_of_a_shared_list() {
        // given
        let list = SharedLruList::new();
        let left: LruBackend<&str, u32> = LruBackend::shared(&list, 3);
        let right: LruBackend<&str, u32> = LruBackend::shared(&list, 3);
        left.load_or_store("a", 1);
        left.load_or_store("b", 2);
        right.load_or_store("a", 10);

        // when
        right.load_or_store("c", 30);

        // then
        assert_eq!(left.keys(), vec!["b"]);
        assert_eq!(right.keys(), vec!["c", "a"]);
        assert_eq!(left.load(&"a"), None);
        assert_eq!(right.load(&"a"), Some(10));
        assert_eq!(left.len(), 1);
        assert_eq!(right.len(), 2);
        assert_eq!(list.len(), 3);
        assert_eq!(right.take_eviction_count(), 1);
    }

    #[test]
    fn it_keeps_keys_of_shared_backends_apart() {
        // given
        let list = SharedLruList::new();
        let left: LruBackend<&str, u32> = LruBackend::shared(&list, 4);
        let right: LruBackend<&str, u32> = LruBackend::shared(&list, 4);
        left.load_or_store("key1", 1);
        right.load_or_store("key1", 2);

        // when
        left.delete(&"key1");

        // then
        assert_eq!(left.load(&"key1"), None);
        assert_eq!(right.load(&"key1"), Some(2));
        assert!(left.is_empty());
        assert_eq!(list.len(), 1);

        // when
        list.clear();

        // then
        assert!(right.is_empty());
        assert!(list.is_empty());
    }

    #[test]
    fn it_clears_nested_stores_of_evicted_entries() {
        // given
        #[derive(Default)]
        struct CountingSubtree(AtomicUsize);

        impl Subtree for CountingSubtree {
            fn clear(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }

            fn evict(&self) {}
        }

        let lru: LruBackend<&str, SharedSlot<u32>> = LruBackend::new(1);
        let subtree = Arc::new(CountingSubtree::default());
        let branch = Arc::new(Slot::new());
        branch.attach(subtree.clone());
        lru.load_or_store("branch", branch);

        // when
        lru.load_or_store("leaf", Arc::new(Slot::new()));

        // then
        assert_eq!(subtree.0.load(Ordering::SeqCst), 1);
        assert_eq!(lru.keys(), vec!["leaf"]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Touch(u32),
        Delete(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u32..8).prop_map(Op::Touch),
            1 => (0u32..8).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn it_matches_a_recency_model(capacity in 0usize..5, ops in prop::collection::vec(op(), 0..64)) {
            let lru: LruBackend<u32, u32> = LruBackend::new(capacity);
            let mut model: Vec<u32> = Vec::new();

            for op in ops {
                match op {
                    Op::Touch(key) => {
                        let present = model.contains(&key);
                        let (_, loaded) = lru.load_or_store(key, key);
                        prop_assert_eq!(loaded, present);

                        model.retain(|k| *k != key);
                        model.insert(0, key);
                        model.truncate(capacity);
                    }
                    Op::Delete(key) => {
                        lru.delete(&key);
                        model.retain(|k| *k != key);
                    }
                }
                prop_assert_eq!(lru.keys(), model.clone());
            }
        }
    }
}
