//! A thread-safe memoizing cache for values that are expensive to compute or slow to fetch.
//!
//! # Features
//!
//! - Single-flight loads: the value function runs at most once per key, concurrent callers of the
//!   same key wait for that one result, and callers of other keys never wait on it
//! - Multi-level caches addressed by key paths, with pruning of whole subtrees
//! - Pluggable backing stores: an unbounded concurrent map, LRU, or random replacement. LRU and
//!   random replacement can both bound all levels of a tree together
//! - No unsafe code
//!
//! # Examples
//!
//! Basic usage:
//!
//! ```rust
//! use memo_cache::KeyedCache;
//!
//! let cache = KeyedCache::new();
//!
//! assert_eq!(cache.load_or_call(1, || "one"), "one");
//! // The value is cached, the second function is never called.
//! assert_eq!(cache.load_or_call(1, || "not one"), "one");
//!
//! cache.delete(&1);
//! assert_eq!(cache.load_or_call(1, || "maybe not one"), "maybe not one");
//! ```
//!
//! Bounding the cache with an LRU store:
//!
//! ```rust
//! use memo_cache::{KeyedCache, LruBackend};
//!
//! let cache = KeyedCache::with_store(LruBackend::new(2));
//! cache.load_or_call("a", || 1);
//! cache.load_or_call("b", || 2);
//! cache.load_or_call("c", || 3);
//!
//! // "a" was the least recently used entry.
//! assert_eq!(cache.get(&"a"), None);
//! ```
//!
//! Multi-level caches:
//!
//! ```rust
//! use memo_cache::{MultiLevelCache, SharedSize, TreeBackend};
//!
//! let size = SharedSize::new();
//! let cache = MultiLevelCache::with_backend(TreeBackend::RandomReplacement {
//!     size: size.clone(),
//!     max_size: 10_000,
//!     target_num: 5_000,
//! })?;
//!
//! assert_eq!(cache.load_or_call(&["users", "john"], || 1)?, 1);
//! assert_eq!(cache.load_or_call(&["users", "mary"], || 2)?, 2);
//!
//! // Drops every entry below "users".
//! cache.prune(&["users"])?;
//! assert_eq!(cache.load_or_call(&["users", "john"], || 10)?, 10);
//! # Ok::<(), memo_cache::Error>(())
//! ```
//!
//! Sharing a cache between threads:
//!
//! ```rust
//! use memo_cache::KeyedCache;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let cache: Arc<KeyedCache<u32, String>> = Arc::new(KeyedCache::new());
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|_| {
//!         let cache = Arc::clone(&cache);
//!         thread::spawn(move || cache.load_or_call(7, || "seven".to_string()))
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     assert_eq!(handle.join().unwrap(), "seven");
//! }
//! ```

#![forbid(unsafe_code)]
pub mod cache;
pub mod error;

pub use cache::KeyedCache;
pub use cache::cell::SingleFlightCell;
pub use cache::lru::{LruBackend, SharedLruList};
pub use cache::random::{RandomReplacementBackend, RandomSource, SharedSize, ThreadRandom};
pub use cache::stats::Stats;
pub use cache::store::{BackingStore, ConcurrentStore, SharedSlot, Slot, StoreEntry, Subtree};
pub use cache::tree::{Branch, MultiLevelCache, Node, NodeStore, TreeBackend};
pub use error::{Error, NodeKind, Result};
