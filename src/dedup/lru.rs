// LRU Cache - bounded map with insertion-ordered eviction
//
// Entries live in a HashMap; eviction order lives in a VecDeque of
// (key, sequence) pairs. Removing or re-inserting a key leaves its old order
// slot behind as a tombstone, skipped when it reaches the front. The deque is
// compacted once tombstones pass a threshold.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

struct Entry<V> {
    value: V,
    seq: u64,
}

pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, Entry<V>>,
    order: VecDeque<(K, u64)>,
    next_seq: u64,
    compaction_threshold: usize,
    evictions: u64,
    compactions: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// A capacity of zero is treated as one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            next_seq: 0,
            compaction_threshold: capacity,
            evictions: 0,
            compactions: 0,
        }
    }

    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold.max(1);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stale slots in the order list
    pub fn tombstones(&self) -> usize {
        self.order.len() - self.entries.len()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn compactions(&self) -> u64 {
        self.compactions
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|e| &mut e.value)
    }

    /// Insert or replace. A replaced key moves to the back of the order.
    /// Returns the entry evicted to make room, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.seq = seq;
            self.order.push_back((key, seq));
            self.maybe_compact();
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            let oldest = self.pop_oldest();
            if oldest.is_some() {
                self.evictions += 1;
            }
            oldest
        } else {
            None
        };

        self.entries.insert(key.clone(), Entry { value, seq });
        self.order.push_back((key, seq));
        self.maybe_compact();
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key).map(|e| e.value);
        if removed.is_some() {
            self.maybe_compact();
        }
        removed
    }

    /// Remove and return the least recently inserted live entry
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        while let Some((key, seq)) = self.order.pop_front() {
            let live = self.entries.get(&key).is_some_and(|e| e.seq == seq);
            if live {
                if let Some(entry) = self.entries.remove(&key) {
                    return Some((key, entry.value));
                }
            }
        }
        None
    }

    /// Keep only entries for which `f` returns true
    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.entries.retain(|k, e| f(k, &e.value));
        self.maybe_compact();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Live entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order.iter().filter_map(|(key, seq)| {
            self.entries
                .get_key_value(key)
                .filter(|(_, e)| e.seq == *seq)
                .map(|(k, e)| (k, &e.value))
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    /// Drop every tombstone from the order list
    pub fn compact(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(key, seq)| entries.get(key).is_some_and(|e| e.seq == *seq));
        self.compactions += 1;
    }

    fn maybe_compact(&mut self) {
        if self.tombstones() > self.compaction_threshold {
            self.compact();
        }
    }
}

impl<K, V> std::fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("len", &self.entries.len())
            .field("order_len", &self.order.len())
            .finish()
    }
}
