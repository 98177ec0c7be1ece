use crate::Stats;
use parking_lot::Mutex;
use stats::Counters;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use store::{BackingStore, ConcurrentStore, SharedSlot, Slot, Subtree};
use tracing::{debug, trace};

pub(crate) mod cell;
mod entry;
pub(crate) mod lru;
pub(crate) mod random;
pub(crate) mod stats;
pub(crate) mod store;
pub(crate) mod tree;

pub(crate) type RandomState = ahash::RandomState;

/// Thread-safe memoizing cache that runs the value function at most once per key.
///
/// A lookup inserts an empty [`Slot`] into the backing store if the key is absent and then
/// resolves it. Concurrent lookups of the same key share that slot, so only one of them runs its
/// compute function while the others wait for the result. Lookups of other keys never wait on it.
///
/// The backing store decides how long entries live. The default [`ConcurrentStore`] keeps them
/// until deleted; [`LruBackend`](crate::LruBackend) and
/// [`RandomReplacementBackend`](crate::RandomReplacementBackend) bound the size.
///
/// Wrap the cache in a [`std::sync::Arc`] to share it between threads. All operations only
/// require shared references.
pub struct KeyedCache<K, V, S = ConcurrentStore<K, SharedSlot<V>>> {
    store: S,
    counters: Counters,
    metrics_last_accessed: Mutex<Instant>,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash,
{
    /// Creates a cache on an unbounded [`ConcurrentStore`].
    pub fn new() -> Self {
        Self::with_store(ConcurrentStore::new())
    }
}

impl<K, V> Default for KeyedCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> KeyedCache<K, V, S> {
    /// Creates a cache on top of `store`.
    pub fn with_store(store: S) -> Self {
        Self {
            store,
            counters: Counters::default(),
            metrics_last_accessed: Mutex::new(Instant::now()),
            _marker: PhantomData,
        }
    }

    /// Returns the backing store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<K, V, S> KeyedCache<K, V, S>
where
    V: Clone + Send + Sync,
    S: BackingStore<K, SharedSlot<V>>,
{
    /// Returns the value cached for `key`, calling `compute` to produce it on a miss.
    ///
    /// `compute` runs at most once per cached entry, even if different functions are passed for
    /// the same key. Callers that arrive while it runs block until the value is ready. If
    /// `compute` panics, the panic reaches this caller and the entry stays empty, so the next
    /// lookup computes again.
    pub fn load_or_call<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        self.slot(key).cell().resolve(compute)
    }

    /// Like [`KeyedCache::load_or_call`] with a fallible compute function.
    ///
    /// Errors are returned to this caller and are not cached.
    pub fn try_load_or_call<F, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let result = self.slot(key).cell().try_resolve(compute);
        if result.is_err() {
            debug!("compute failed, entry left empty");
        }
        result
    }

    /// Returns the cached value without computing anything. Entries still being computed read as
    /// absent.
    pub fn get(&self, key: &K) -> Option<V> {
        self.store.load(key)?.cell().get()
    }

    /// Removes the cached value for `key`.
    ///
    /// Lookups already resolving the old entry still finish with its value. Lookups started after
    /// this call returns compute again.
    pub fn delete(&self, key: &K) {
        self.store.delete(key);
    }

    /// Removes every cached value.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Returns the number of entries in the backing store, including entries still being
    /// computed.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub(crate) fn slot(&self, key: K) -> SharedSlot<V> {
        let (slot, loaded) = self.store.load_or_store(key, Arc::new(Slot::new()));

        if loaded {
            self.counters.increment_hit_count();
        } else {
            self.counters.increment_miss_count();
        }
        trace!(hit = loaded, "cache lookup");

        slot
    }

    pub(crate) fn load_slot(&self, key: &K) -> Option<SharedSlot<V>> {
        self.store.load(key)
    }

    /// Returns hit, miss and eviction counts since the last call and resets them.
    pub fn stats(&self) -> Stats {
        let millis_elapsed = {
            let mut guard = self.metrics_last_accessed.lock();
            let millis_elapsed = guard.elapsed().as_millis();
            *guard = Instant::now();
            millis_elapsed
        };

        let (hit_count, miss_count) = self.counters.take();

        Stats {
            miss_count,
            hit_count,
            eviction_count: self.store.take_eviction_count(),
            millis_elapsed,
        }
    }
}

impl<K, V, S> fmt::Debug for KeyedCache<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCache")
            .field("counters", &self.counters)
            .field("metrics_last_accessed", &self.metrics_last_accessed)
            .finish_non_exhaustive()
    }
}

impl<K, V, S> Subtree for KeyedCache<K, V, S>
where
    V: Clone + Send + Sync,
    S: BackingStore<K, SharedSlot<V>>,
{
    fn clear(&self) {
        self.store.clear();
    }

    fn evict(&self) {
        self.store.evict();
    }
}
