use crate::KeyedCache;
use crate::cache::cell::SingleFlightCell;
use crate::cache::lru::{LruBackend, SharedLruList};
use crate::cache::random::{RandomReplacementBackend, SharedSize, ThreadRandom};
use crate::cache::store::{BackingStore, ConcurrentStore, SharedSlot};
use crate::error::{Error, NodeKind, Result};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

/// A position in a [`MultiLevelCache`]: either a cached value or a nested level.
pub enum Node<K, V> {
    Leaf(V),
    Branch(Arc<Branch<K, V>>),
}

impl<K, V: Clone> Clone for Node<K, V> {
    fn clone(&self) -> Self {
        match self {
            Node::Leaf(value) => Node::Leaf(value.clone()),
            Node::Branch(branch) => Node::Branch(Arc::clone(branch)),
        }
    }
}

impl<K, V> Node<K, V> {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Leaf(_) => NodeKind::Leaf,
            Node::Branch(_) => NodeKind::Subtree,
        }
    }
}

/// Backing store of one tree level.
pub type NodeStore<K, V> = Box<dyn BackingStore<K, SharedSlot<Node<K, V>>>>;

/// One level of a [`MultiLevelCache`].
pub type Branch<K, V> = KeyedCache<K, Node<K, V>, NodeStore<K, V>>;

type StoreFactory<K, V> = Arc<dyn Fn() -> NodeStore<K, V> + Send + Sync>;

/// Ready-made backing stores for every level of a [`MultiLevelCache`].
#[derive(Debug, Clone)]
pub enum TreeBackend {
    /// Unbounded levels, entries stay until pruned.
    Concurrent,
    /// Every level keeps at most `capacity` entries, evicting the least recently used.
    Lru { capacity: usize },
    /// All levels share one recency order and together keep at most `capacity` entries, nested
    /// level entries included. An insert anywhere evicts the least recently used entry of the
    /// whole tree.
    SharedLru { capacity: usize },
    /// All levels share `size` and together stay around `max_size` entries, shrinking towards
    /// `target_num` by random replacement.
    RandomReplacement {
        size: SharedSize,
        max_size: usize,
        target_num: usize,
    },
}

/// A cache addressed by paths of keys, organized as a tree of [`KeyedCache`] levels.
///
/// All components of a path except the last select nested levels, which are created on first use
/// with the same single-flight guarantee as values. Lookups that only share a prefix never wait on
/// each other; only lookups of the same full path do. A whole subtree can be dropped with
/// [`MultiLevelCache::prune`].
///
/// A path position holds either a value or a nested level, never both. If `("a", "b", "c")` has a
/// value, `("a", "b")` can't have one, and a lookup that disagrees with what's stored fails with
/// [`Error::PathConflict`].
pub struct MultiLevelCache<K, V> {
    root: SingleFlightCell<Arc<Branch<K, V>>>,
    factory: StoreFactory<K, V>,
    shared_lru: Option<SharedLruList<K, SharedSlot<Node<K, V>>>>,
}

impl<K, V> MultiLevelCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_factory(|| -> NodeStore<K, V> {
            Box::new(ConcurrentStore::<K, SharedSlot<Node<K, V>>>::new())
        })
    }

    /// Creates a tree whose levels are backed by stores from `factory`.
    ///
    /// Stores that share state across levels, such as a [`SharedSize`], should capture it in the
    /// factory. Levels joined to a [`SharedLruList`] are owned by the list's entries and own the
    /// list in turn; clear the list once the tree is dropped, or use [`TreeBackend::SharedLru`],
    /// which does so.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> NodeStore<K, V> + Send + Sync + 'static,
    {
        Self {
            root: SingleFlightCell::new(),
            factory: Arc::new(factory),
            shared_lru: None,
        }
    }

    pub fn with_backend(backend: TreeBackend) -> Result<Self> {
        let tree = match backend {
            TreeBackend::Concurrent => Self::new(),
            TreeBackend::Lru { capacity } => Self::with_factory(move || -> NodeStore<K, V> {
                Box::new(LruBackend::<K, SharedSlot<Node<K, V>>>::new(capacity))
            }),
            TreeBackend::SharedLru { capacity } => {
                let list: SharedLruList<K, SharedSlot<Node<K, V>>> = SharedLruList::new();
                let factory_list = list.clone();
                let mut tree = Self::with_factory(move || -> NodeStore<K, V> {
                    Box::new(LruBackend::shared(&factory_list, capacity))
                });
                tree.shared_lru = Some(list);
                tree
            }
            TreeBackend::RandomReplacement {
                size,
                max_size,
                target_num,
            } => {
                let prototype = RandomReplacementBackend::<K, SharedSlot<Node<K, V>>>::new(
                    size,
                    max_size,
                    target_num,
                    ThreadRandom,
                )?;
                Self::with_factory(move || -> NodeStore<K, V> { Box::new(prototype.sibling()) })
            }
        };

        Ok(tree)
    }

    /// Returns the value cached at `path`, calling `compute` to produce it on a miss.
    ///
    /// Missing levels along the path are created. `compute` runs at most once per cached entry;
    /// callers asking for the same path while it runs wait for its result.
    pub fn load_or_call<F>(&self, path: &[K], compute: F) -> Result<V>
    where
        F: FnOnce() -> V,
    {
        let (last, prefix) = path
            .split_last()
            .ok_or(Error::EmptyPath { op: "load_or_call" })?;

        let level = self.find_level(prefix)?;
        let node = level.load_or_call(last.clone(), || Node::Leaf(compute()));

        Self::expect_leaf(node, prefix.len())
    }

    /// Like [`MultiLevelCache::load_or_call`] with a fallible compute function. Errors are
    /// returned to this caller and are not cached.
    pub fn try_load_or_call<F, E>(&self, path: &[K], compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: From<Error>,
    {
        let (last, prefix) = path
            .split_last()
            .ok_or(Error::EmptyPath { op: "try_load_or_call" })?;

        let level = self.find_level(prefix)?;
        let node = level.try_load_or_call(last.clone(), || compute().map(Node::Leaf))?;

        Ok(Self::expect_leaf(node, prefix.len())?)
    }

    /// Removes the value or subtree at `path`. Later lookups under `path` compute again.
    ///
    /// Pruning a path that holds nothing is a no-op, and missing levels are not created. Pruning
    /// the whole tree with an empty path is not supported.
    pub fn prune(&self, path: &[K]) -> Result<()> {
        let (last, prefix) = path.split_last().ok_or(Error::EmptyPath { op: "prune" })?;

        let Some(mut level) = self.root.get() else {
            return Ok(());
        };
        for component in prefix {
            let child = level.load_slot(component).and_then(|slot| slot.cell().get());
            match child {
                Some(Node::Branch(branch)) => level = branch,
                _ => return Ok(()),
            }
        }

        level.delete(last);
        debug!(depth = prefix.len(), "pruned path");

        Ok(())
    }

    fn root(&self) -> Arc<Branch<K, V>> {
        self.root.resolve(|| Arc::new(self.new_level()))
    }

    fn new_level(&self) -> Branch<K, V> {
        KeyedCache::with_store((self.factory)())
    }

    fn find_level(&self, prefix: &[K]) -> Result<Arc<Branch<K, V>>> {
        prefix
            .iter()
            .enumerate()
            .try_fold(self.root(), |level, (depth, component)| {
                self.descend(&level, depth, component.clone())
            })
    }

    fn descend(
        &self,
        level: &Branch<K, V>,
        depth: usize,
        component: K,
    ) -> Result<Arc<Branch<K, V>>> {
        let slot = level.slot(component);
        let node = slot.cell().resolve(|| {
            let branch = Arc::new(self.new_level());
            slot.attach(branch.clone());
            Node::Branch(branch)
        });

        match node {
            Node::Branch(branch) => Ok(branch),
            leaf => Err(Error::PathConflict {
                depth,
                found: leaf.kind(),
            }),
        }
    }

    fn expect_leaf(node: Node<K, V>, depth: usize) -> Result<V> {
        match node {
            Node::Leaf(value) => Ok(value),
            branch => Err(Error::PathConflict {
                depth,
                found: branch.kind(),
            }),
        }
    }
}

impl<K, V> Default for MultiLevelCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for MultiLevelCache<K, V> {
    fn drop(&mut self) {
        if let Some(list) = &self.shared_lru {
            list.clear();
        }
    }
}

impl<K, V> fmt::Debug for MultiLevelCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiLevelCache")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
