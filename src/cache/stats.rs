use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Stats {
    pub miss_count: u64,
    pub hit_count: u64,
    pub eviction_count: u64,
    pub millis_elapsed: u128,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl Counters {
    pub(crate) fn increment_hit_count(&self) {
        self.hit_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn increment_miss_count(&self) {
        self.miss_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `(hits, misses)` and resets both counters.
    pub(crate) fn take(&self) -> (u64, u64) {
        (
            self.hit_count.swap(0, Ordering::AcqRel),
            self.miss_count.swap(0, Ordering::AcqRel),
        )
    }
}
