use crate::cache::RandomState;
use crate::cache::store::{BackingStore, StoreEntry};
use crate::error::{Error, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rand::Rng;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use tracing::debug;

/// Upper bound on sweeps per eviction pass, so concurrent growth can't keep an insert spinning.
const MAX_SWEEPS: usize = 5;

/// Entry counter shared by every [`RandomReplacementBackend`] of one tree.
///
/// Clones refer to the same counter.
#[derive(Debug, Clone, Default)]
pub struct SharedSize(Arc<AtomicIsize>);

impl SharedSize {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current number of entries. Racing inserts and deletes may briefly push the raw
    /// counter below zero; that reads as zero.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire).max(0) as usize
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement(&self) {
        self.sub(1);
    }

    fn sub(&self, n: isize) {
        self.0.fetch_sub(n, Ordering::AcqRel);
    }
}

/// Source of uniformly distributed integers in `0..n`.
pub trait RandomSource: Send + Sync {
    fn below(&self, n: usize) -> usize;
}

impl<F> RandomSource for F
where
    F: Fn(usize) -> usize + Send + Sync,
{
    fn below(&self, n: usize) -> usize {
        self(n)
    }
}

/// Draws from the thread-local generator of the `rand` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn below(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..n)
    }
}

/// A backing store bounded by random replacement.
///
/// Once the shared counter goes above `max_size`, an insert runs an eviction pass: each sweep
/// walks the current entries, lets nested stores evict first, and drops every entry with
/// probability `(size - target_num) / size`. A pass stops after five sweeps or as soon as the
/// counter is back under `max_size`, so the resulting size is only approximately
/// `target_num`. There is no ordering metadata, which makes it cheaper than LRU but means a
/// recently used entry is as likely to go as a cold one.
///
/// All backends created with clones of the same [`SharedSize`] bound their combined size. Dropping
/// a backend takes its remaining entries off the shared counter.
pub struct RandomReplacementBackend<K, T, R = ThreadRandom, S = RandomState> {
    map: DashMap<K, T, S>,
    size: SharedSize,
    live: AtomicIsize,
    max_size: usize,
    target_num: usize,
    random: R,
    delete_lock: Mutex<()>,
    eviction_count: AtomicU64,
}

impl<K, T, R> RandomReplacementBackend<K, T, R, RandomState>
where
    K: Eq + Hash,
{
    pub fn new(size: SharedSize, max_size: usize, target_num: usize, random: R) -> Result<Self> {
        Self::with_hasher(size, max_size, target_num, random, Default::default())
    }
}

impl<K, T, R, S> RandomReplacementBackend<K, T, R, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    pub fn with_hasher(
        size: SharedSize,
        max_size: usize,
        target_num: usize,
        random: R,
        hash_builder: S,
    ) -> Result<Self> {
        if target_num >= max_size {
            return Err(Error::InvalidConfig(format!(
                "target_num ({target_num}) must be smaller than max_size ({max_size})"
            )));
        }

        Ok(Self {
            map: DashMap::with_hasher(hash_builder),
            size,
            live: AtomicIsize::new(0),
            max_size,
            target_num,
            random,
            delete_lock: Mutex::new(()),
            eviction_count: AtomicU64::new(0),
        })
    }

    pub fn shared_size(&self) -> &SharedSize {
        &self.size
    }

    /// Creates an empty backend with the same limits, random source and shared counter.
    pub fn sibling(&self) -> Self
    where
        R: Clone,
    {
        Self {
            map: DashMap::with_hasher(self.map.hasher().clone()),
            size: self.size.clone(),
            live: AtomicIsize::new(0),
            max_size: self.max_size,
            target_num: self.target_num,
            random: self.random.clone(),
            delete_lock: Mutex::new(()),
            eviction_count: AtomicU64::new(0),
        }
    }
}

impl<K, T, R, S> RandomReplacementBackend<K, T, R, S>
where
    K: Clone + Eq + Hash,
    T: StoreEntry,
    R: RandomSource,
    S: BuildHasher + Clone,
{
    fn sweep(&self) -> u64 {
        let entries: Vec<(K, T)> = self
            .map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut evicted = 0;
        for (key, value) in entries {
            if let Some(subtree) = value.subtree() {
                subtree.evict();
            }

            let current = self.size.get();
            let num_to_evict = current.saturating_sub(self.target_num);
            if num_to_evict == 0 {
                continue;
            }
            if self.random.below(current) < num_to_evict && self.remove(&key) {
                evicted += 1;
            }
        }

        evicted
    }

    fn remove(&self, key: &K) -> bool {
        let _guard = self.delete_lock.lock();

        let Some((_, removed)) = self.map.remove(key) else {
            return false;
        };
        if let Some(subtree) = removed.subtree() {
            subtree.clear();
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.size.decrement();

        true
    }
}

impl<K, T, R, S> Drop for RandomReplacementBackend<K, T, R, S> {
    fn drop(&mut self) {
        let remaining = *self.live.get_mut();
        if remaining != 0 {
            self.size.sub(remaining);
        }
    }
}

impl<K, T, R, S> BackingStore<K, T> for RandomReplacementBackend<K, T, R, S>
where
    K: Clone + Eq + Hash + Send + Sync,
    T: StoreEntry,
    R: RandomSource,
    S: BuildHasher + Clone + Send + Sync,
{
    fn load_or_store(&self, key: K, value: T) -> (T, bool) {
        match self.map.entry(key) {
            Entry::Occupied(entry) => return (entry.get().clone(), true),
            Entry::Vacant(entry) => {
                entry.insert(value.clone());
            }
        }

        self.live.fetch_add(1, Ordering::AcqRel);
        self.size.increment();
        self.evict();

        (value, false)
    }

    fn load(&self, key: &K) -> Option<T> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    fn delete(&self, key: &K) {
        self.remove(key);
    }

    fn clear(&self) {
        let keys: Vec<K> = self.map.iter().map(|entry| entry.key().clone()).collect();
        for key in &keys {
            self.remove(key);
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn evict(&self) {
        let mut sweeps = 0;
        let mut evicted = 0;
        while self.size.get() > self.max_size && sweeps < MAX_SWEEPS {
            sweeps += 1;
            evicted += self.sweep();
        }

        if evicted > 0 {
            self.eviction_count.fetch_add(evicted, Ordering::AcqRel);
            debug!(
                evicted,
                sweeps,
                size = self.size.get(),
                max_size = self.max_size,
                "random replacement evicted entries"
            );
        }
    }

    fn take_eviction_count(&self) -> u64 {
        self.eviction_count.swap(0, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn seeded(seed: u64) -> impl RandomSource {
        let rng = Mutex::new(StdRng::seed_from_u64(seed));
        move |n: usize| rng.lock().gen_range(0..n)
    }

    #[test]
    fn it_rejects_a_target_at_or_above_max_size() {
        // when
        let result: Result<RandomReplacementBackend<u32, u32>> =
            RandomReplacementBackend::new(SharedSize::new(), 4, 4, ThreadRandom);

        // then
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn it_counts_fresh_inserts_only() {
        // given
        let size = SharedSize::new();
        let rr: RandomReplacementBackend<u32, u32> =
            RandomReplacementBackend::new(size.clone(), 10, 5, ThreadRandom).unwrap();

        // when
        let first = rr.load_or_store(1, 10);
        let second = rr.load_or_store(1, 11);

        // then
        assert_eq!(first, (10, false));
        assert_eq!(second, (10, true));
        assert_eq!(size.get(), 1);
    }

    #[test]
    fn it_shrinks_to_the_target_when_every_draw_evicts() {
        // given
        let size = SharedSize::new();
        let rr = RandomReplacementBackend::new(size.clone(), 6, 3, |_: usize| 0).unwrap();

        // when
        for key in 0..7u32 {
            rr.load_or_store(key, key);
        }

        // then
        assert_eq!(size.get(), 3);
        assert_eq!(rr.len(), 3);
        assert_eq!(rr.take_eviction_count(), 4);
    }

    #[test]
    fn it_never_evicts_when_draws_miss() {
        // given
        let size = SharedSize::new();
        let rr = RandomReplacementBackend::new(size.clone(), 2, 1, |n: usize| n - 1).unwrap();

        // when
        for key in 0..3u32 {
            rr.load_or_store(key, key);
        }

        // then
        assert_eq!(size.get(), 3);
        assert_eq!(rr.take_eviction_count(), 0);
    }

    #[test]
    fn it_stays_within_max_size_after_each_insert() {
        // given
        let size = SharedSize::new();
        let rr = RandomReplacementBackend::new(size.clone(), 100, 50, seeded(7)).unwrap();

        // when / then
        for key in 0..2_000u32 {
            rr.load_or_store(key, key);
            assert!(size.get() <= 100, "size {} after inserting {}", size.get(), key);
        }
        assert_eq!(size.get(), rr.len());
    }

    #[test]
    fn it_shares_the_counter_between_backends() {
        // given
        let size = SharedSize::new();
        let left = RandomReplacementBackend::new(size.clone(), 4, 2, |_: usize| 0).unwrap();
        let right = RandomReplacementBackend::new(size.clone(), 4, 2, |_: usize| 0).unwrap();

        // when
        left.load_or_store(1u32, 1u32);
        left.load_or_store(2, 2);
        right.load_or_store(3u32, 3u32);
        right.load_or_store(4, 4);

        // then
        assert_eq!(size.get(), 4);

        // when
        right.load_or_store(5, 5);

        // then
        assert!(size.get() <= 4);
        assert_eq!(size.get(), left.len() + right.len());
    }

    #[test]
    fn it_releases_remaining_entries_when_dropped() {
        // given
        let size = SharedSize::new();
        let rr = RandomReplacementBackend::new(size.clone(), 10, 5, ThreadRandom).unwrap();
        rr.load_or_store(1u32, 1u32);
        let sibling = rr.sibling();
        sibling.load_or_store(2u32, 2u32);
        sibling.load_or_store(3, 3);

        // when
        drop(sibling);

        // then
        assert_eq!(size.get(), 1);
    }

    #[test]
    fn it_decrements_the_counter_on_delete() {
        // given
        let size = SharedSize::new();
        let rr = RandomReplacementBackend::new(size.clone(), 10, 5, ThreadRandom).unwrap();
        rr.load_or_store("key1", 1u32);
        rr.load_or_store("key2", 2u32);

        // when
        rr.delete(&"key1");
        rr.delete(&"missing");

        // then
        assert_eq!(size.get(), 1);
        assert_eq!(rr.load(&"key1"), None);
        assert_eq!(rr.load(&"key2"), Some(2));

        // when
        rr.clear();

        // then
        assert_eq!(size.get(), 0);
        assert!(rr.is_empty());
    }
}
