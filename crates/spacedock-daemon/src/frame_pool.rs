//! Bounded LRU pool for page-level bundle frames.
//!
//! The page keeps at most a handful of live frames; inserting past capacity
//! evicts the least-recently-accessed entry. Eviction is reported to the
//! caller, which must send the evicted frame an unload signal before
//! discarding it.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::Hash;

pub const DEFAULT_FRAME_CAPACITY: usize = 5;

pub struct FramePool<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    /// Keys ordered least-recently-accessed first.
    recency: VecDeque<K>,
}

impl<K, V> FramePool<K, V>
where
    K: Clone + Eq + Hash,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert an entry, returning the evicted (key, value) pair if the pool
    /// was full. Inserting an existing key replaces its value and counts as
    /// an access.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.entries.contains_key(&key) {
            self.touch(&key);
            self.entries.insert(key, value);
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.recency.pop_front().and_then(|old| {
                let value = self.entries.remove(&old)?;
                Some((old, value))
            })
        } else {
            None
        };

        self.recency.push_back(key.clone());
        self.entries.insert(key, value);
        evicted
    }

    /// Look up an entry, promoting it to most-recently-accessed.
    pub fn access(&mut self, key: &K) -> Option<&V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get(key)
    }

    /// Remove an entry without treating it as an eviction.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.recency.retain(|k| k != key);
        self.entries.remove(key)
    }

    /// Keys ordered least-recently-accessed first.
    pub fn recency_order(&self) -> impl Iterator<Item = &K> {
        self.recency.iter()
    }

    fn touch(&mut self, key: &K) {
        self.recency.retain(|k| k != key);
        self.recency.push_back(key.clone());
    }
}

impl<K, V> Default for FramePool<K, V>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixth_insert_evicts_least_recently_accessed() {
        let mut pool = FramePool::default();
        for i in 1..=5 {
            assert!(pool.insert(format!("b{i}"), i).is_none());
        }

        // b1 would be next out, but accessing it promotes it past b2.
        pool.access(&"b1".to_string());

        let evicted = pool.insert("b6".to_string(), 6).expect("pool was full");
        assert_eq!(evicted, ("b2".to_string(), 2));
        assert_eq!(pool.len(), 5);
        assert!(pool.contains(&"b1".to_string()));
        assert!(!pool.contains(&"b2".to_string()));
    }

    #[test]
    fn eviction_order_under_repeated_access() {
        let mut pool = FramePool::new(3);
        pool.insert("a", ());
        pool.insert("b", ());
        pool.insert("c", ());

        pool.access(&"a");
        pool.access(&"b");
        pool.access(&"a");

        let order: Vec<_> = pool.recency_order().copied().collect();
        assert_eq!(order, vec!["c", "b", "a"]);

        assert_eq!(pool.insert("d", ()), Some(("c", ())));
        assert_eq!(pool.insert("e", ()), Some(("b", ())));
    }

    #[test]
    fn reinsert_counts_as_access() {
        let mut pool = FramePool::new(2);
        pool.insert("a", 1);
        pool.insert("b", 1);
        assert!(pool.insert("a", 2).is_none());

        assert_eq!(pool.insert("c", 1), Some(("b", 1)));
        assert_eq!(pool.access(&"a"), Some(&2));
    }

    #[test]
    fn remove_is_not_an_eviction() {
        let mut pool = FramePool::new(2);
        pool.insert("a", 1);
        pool.insert("b", 2);
        assert_eq!(pool.remove(&"a"), Some(1));
        assert!(pool.insert("c", 3).is_none());
    }
}
