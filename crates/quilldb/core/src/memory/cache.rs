// QuillDB
// Copyright (C) 2025 QuillDB contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// LRU cache
// Bounded cache backed by a hash map plus a doubly-linked list with sentinel
// head and tail nodes. get and put move the entry to the front; inserting
// past capacity evicts the tail sentinel's predecessor. Every public
// operation takes the single cache mutex.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Statistics about cache usage
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Sentinel slot indices in the node arena
const HEAD: usize = 0;
const TAIL: usize = 1;

struct Node<K, V> {
    key: Option<K>,
    value: Option<V>,
    prev: usize,
    next: usize,
}

struct LruInner<K, V> {
    map: HashMap<K, usize>,
    nodes: Vec<Node<K, V>>,
    free: Vec<usize>,
    stats: CacheStats,
}

impl<K, V> LruInner<K, V>
where
    K: Clone + Eq + Hash,
{
    fn detach(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    fn attach_front(&mut self, slot: usize) {
        let first = self.nodes[HEAD].next;
        self.nodes[slot].prev = HEAD;
        self.nodes[slot].next = first;
        self.nodes[first].prev = slot;
        self.nodes[HEAD].next = slot;
    }

    fn allocate(&mut self, key: K, value: V) -> usize {
        if let Some(slot) = self.free.pop() {
            self.nodes[slot].key = Some(key);
            self.nodes[slot].value = Some(value);
            slot
        } else {
            self.nodes.push(Node {
                key: Some(key),
                value: Some(value),
                prev: 0,
                next: 0,
            });
            self.nodes.len() - 1
        }
    }

    fn release(&mut self, slot: usize) -> (K, V) {
        let key = self.nodes[slot].key.take().expect("released slot has a key");
        let value = self.nodes[slot].value.take().expect("released slot has a value");
        self.free.push(slot);
        (key, value)
    }
}

/// Bounded LRU cache. Values are cloned out on access so no reference into
/// the cache outlives the mutex.
pub struct LruCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    inner: Mutex<LruInner<K, V>>,
    capacity: usize,
}

impl<K, V> LruCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let nodes = vec![
            // Head sentinel
            Node {
                key: None,
                value: None,
                prev: HEAD,
                next: TAIL,
            },
            // Tail sentinel
            Node {
                key: None,
                value: None,
                prev: HEAD,
                next: TAIL,
            },
        ];

        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                nodes,
                free: Vec::new(),
                stats: CacheStats {
                    capacity,
                    ..CacheStats::default()
                },
            }),
            capacity,
        }
    }

    /// Look up `key`, promoting the entry to most-recently-used
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        match inner.map.get(key).copied() {
            Some(slot) => {
                inner.detach(slot);
                inner.attach_front(slot);
                inner.stats.hits += 1;
                inner.nodes[slot].value.clone()
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or update `key`, promoting it to most-recently-used. Returns
    /// the evicted entry when the insert pushed the cache past capacity.
    pub fn put(&self, key: K, value: V) -> Option<(K, V)> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(slot) = inner.map.get(&key).copied() {
            inner.nodes[slot].value = Some(value);
            inner.detach(slot);
            inner.attach_front(slot);
            return None;
        }

        let slot = inner.allocate(key.clone(), value);
        inner.attach_front(slot);
        inner.map.insert(key, slot);
        inner.stats.insertions += 1;
        inner.stats.len = inner.map.len();

        if inner.map.len() > self.capacity {
            let victim = inner.nodes[TAIL].prev;
            inner.detach(victim);
            let (evicted_key, evicted_value) = inner.release(victim);
            inner.map.remove(&evicted_key);
            inner.stats.evictions += 1;
            inner.stats.len = inner.map.len();
            return Some((evicted_key, evicted_value));
        }

        None
    }

    /// Remove `key` from the cache
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.map.remove(key)?;
        inner.detach(slot);
        let (_, value) = inner.release(slot);
        inner.stats.len = inner.map.len();
        Some(value)
    }

    /// Whether `key` is cached, without promoting it
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let slots: Vec<usize> = inner.map.values().copied().collect();
        for slot in slots {
            inner.detach(slot);
            inner.release(slot);
        }
        inner.map.clear();
        inner.stats.len = 0;
    }

    /// Keys in MRU to LRU order
    pub fn keys(&self) -> Vec<K> {
        let inner = self.inner.lock().unwrap();
        let mut keys = Vec::with_capacity(inner.map.len());
        let mut slot = inner.nodes[HEAD].next;
        while slot != TAIL {
            if let Some(key) = &inner.nodes[slot].key {
                keys.push(key.clone());
            }
            slot = inner.nodes[slot].next;
        }
        keys
    }

    /// Entries in MRU to LRU order
    pub fn items(&self) -> Vec<(K, V)> {
        let inner = self.inner.lock().unwrap();
        let mut items = Vec::with_capacity(inner.map.len());
        let mut slot = inner.nodes[HEAD].next;
        while slot != TAIL {
            if let (Some(key), Some(value)) = (&inner.nodes[slot].key, &inner.nodes[slot].value) {
                items.push((key.clone(), value.clone()));
            }
            slot = inner.nodes[slot].next;
        }
        items
    }

    /// Snapshot of the cache statistics
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_put() {
        let cache = LruCache::new(4);
        assert!(cache.put(1, "a").is_none());
        assert!(cache.put(2, "b").is_none());

        assert_eq!(cache.get(&1), Some("a"));
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_eviction_at_capacity_plus_one() {
        let cache = LruCache::new(2);
        cache.put(1, "a");
        cache.put(2, "b");
        // At exactly capacity nothing is evicted
        assert_eq!(cache.len(), 2);

        // capacity + 1 evicts the least recently used entry
        let evicted = cache.put(3, "c");
        assert_eq!(evicted, Some((1, "a")));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some("b"));
        assert_eq!(cache.get(&3), Some("c"));
    }

    #[test]
    fn test_get_promotes_to_front() {
        let cache = LruCache::new(2);
        cache.put(1, "a");
        cache.put(2, "b");

        // Touch 1 so that 2 becomes the eviction victim
        cache.get(&1);
        let evicted = cache.put(3, "c");
        assert_eq!(evicted, Some((2, "b")));
    }

    #[test]
    fn test_put_existing_updates_in_place() {
        let cache = LruCache::new(2);
        cache.put(1, "a");
        cache.put(2, "b");
        assert!(cache.put(1, "a2").is_none());

        assert_eq!(cache.get(&1), Some("a2"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_keys_in_mru_order() {
        let cache = LruCache::new(3);
        cache.put(1, "a");
        cache.put(2, "b");
        cache.put(3, "c");
        cache.get(&1);

        assert_eq!(cache.keys(), vec![1, 3, 2]);
        assert_eq!(cache.items()[0], (1, "a"));
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = LruCache::new(3);
        cache.put(1, "a");
        cache.put(2, "b");

        assert_eq!(cache.remove(&1), Some("a"));
        assert_eq!(cache.remove(&1), None);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&2), None);
    }

    #[test]
    fn test_stats_track_hits_and_evictions() {
        let cache = LruCache::new(1);
        cache.put(1, "a");
        cache.get(&1);
        cache.get(&2);
        cache.put(2, "b");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.insertions, 2);
        assert_eq!(stats.capacity, 1);
    }

    #[test]
    fn test_slot_reuse_after_eviction() {
        let cache = LruCache::new(2);
        for i in 0..100 {
            cache.put(i, i * 10);
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&99), Some(990));
        assert_eq!(cache.get(&98), Some(980));
    }
}
