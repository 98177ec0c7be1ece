/// A node of the index-linked recency list used by [`LruBackend`](crate::LruBackend).
pub(crate) struct Entry<K, T> {
    key: K,
    value: T,
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
}

impl<K, T> Entry<K, T> {
    pub(crate) fn new(key: K, value: T) -> Self {
        Self {
            key,
            value,
            prev: None,
            next: None,
        }
    }

    pub(crate) fn into_parts(self) -> (K, T) {
        (self.key, self.value)
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    pub(crate) fn value(&self) -> &T {
        &self.value
    }
}

/// Doubly linked list over a slab of entries. Index positions stay stable until the entry is
/// removed, so they can be stored in a hash index.
pub(crate) struct RecencyList<K, T> {
    entries: Vec<Option<Entry<K, T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<K, T> RecencyList<K, T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Entry<K, T>> {
        self.entries.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn tail(&self) -> Option<usize> {
        self.tail
    }

    /// Inserts an entry at the most recently used end and returns its index.
    pub(crate) fn push_front(&mut self, key: K, value: T) -> usize {
        let mut entry = Entry::new(key, value);
        entry.next = self.head;

        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index] = Some(entry);
                index
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };

        match self.head {
            Some(head) => self.link_mut(head).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
        self.len += 1;

        index
    }

    pub(crate) fn move_to_front(&mut self, index: usize) {
        if self.head == Some(index) || self.get(index).is_none() {
            return;
        }

        self.unlink(index);

        let old_head = self.head;
        {
            let entry = self.link_mut(index);
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(head) = old_head {
            self.link_mut(head).prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    pub(crate) fn remove(&mut self, index: usize) -> Option<Entry<K, T>> {
        self.get(index)?;
        self.unlink(index);

        let entry = self.entries[index].take()?;
        self.free.push(index);
        self.len -= 1;

        Some(entry)
    }

    /// Removes every entry and returns the values.
    pub(crate) fn take_values(&mut self) -> Vec<T> {
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
        self.entries
            .drain(..)
            .flatten()
            .map(|entry| entry.value)
            .collect()
    }

    /// Iterates entries from the most to the least recently used.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Entry<K, T>> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let entry = self.get(cursor?)?;
            cursor = entry.next;
            Some(entry)
        })
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match self.get(index) {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };

        match prev {
            Some(prev) => self.link_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.link_mut(next).prev = prev,
            None => self.tail = prev,
        }
    }

    // Linked indices always point at occupied entries.
    fn link_mut(&mut self, index: usize) -> &mut Entry<K, T> {
        match self.entries[index].as_mut() {
            Some(entry) => entry,
            None => unreachable!("recency list links point at occupied entries"),
        }
    }
}
