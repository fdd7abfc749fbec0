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

// Skip list index
// Probabilistic ordered index with up to 32 levels and a promotion
// probability of one half. Nodes live in a slab and link forward per level;
// the whole structure sits behind a reader-writer lock, so many readers or
// one writer.

use std::sync::RwLock;

use rand::Rng;

use crate::indices::lib::{Index, IndexError, IndexKey, IndexResult, IndexType, IndexValue};

/// Maximum number of levels
pub const MAX_LEVEL: usize = 32;
/// Probability of promoting a node one level up
const PROMOTE_PROBABILITY: f64 = 0.5;

struct SkipNode<K, V> {
    key: K,
    value: V,
    forward: Vec<Option<usize>>,
}

struct SkipListInner<K, V> {
    /// Sentinel head's forward pointers, one per level
    head: Vec<Option<usize>>,
    nodes: Vec<Option<SkipNode<K, V>>>,
    free: Vec<usize>,
    /// Highest level currently in use
    level: usize,
    len: usize,
}

impl<K: IndexKey, V: IndexValue> SkipListInner<K, V> {
    fn node(&self, idx: usize) -> &SkipNode<K, V> {
        self.nodes[idx].as_ref().expect("linked slot is occupied")
    }

    fn node_mut(&mut self, idx: usize) -> &mut SkipNode<K, V> {
        self.nodes[idx].as_mut().expect("linked slot is occupied")
    }

    fn next_of(&self, prev: Option<usize>, level: usize) -> Option<usize> {
        match prev {
            None => self.head[level],
            Some(idx) => self.node(idx).forward[level],
        }
    }

    /// For every level, the last node strictly before `key` (None = head)
    fn find_update(&self, key: &K) -> Vec<Option<usize>> {
        let mut update = vec![None; MAX_LEVEL];
        let mut current: Option<usize> = None;

        for level in (0..self.level.max(1)).rev() {
            while let Some(next) = self.next_of(current, level) {
                if self.node(next).key < *key {
                    current = Some(next);
                } else {
                    break;
                }
            }
            update[level] = current;
        }
        update
    }
}

/// SkipList with the ordered-index contract
pub struct SkipList<K, V>
where
    K: IndexKey,
    V: IndexValue,
{
    inner: RwLock<SkipListInner<K, V>>,
}

impl<K, V> SkipList<K, V>
where
    K: IndexKey,
    V: IndexValue,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SkipListInner {
                head: vec![None; MAX_LEVEL],
                nodes: Vec::new(),
                free: Vec::new(),
                level: 1,
                len: 0,
            }),
        }
    }

    fn random_level() -> usize {
        let mut level = 1;
        let mut rng = rand::thread_rng();
        while level < MAX_LEVEL && rng.gen_bool(PROMOTE_PROBABILITY) {
            level += 1;
        }
        level
    }

    /// Look up a key
    pub fn search(&self, key: &K) -> Option<V> {
        let inner = self.inner.read().unwrap();
        let update = inner.find_update(key);
        let candidate = inner.next_of(update[0], 0)?;
        let node = inner.node(candidate);
        if node.key == *key {
            Some(node.value.clone())
        } else {
            None
        }
    }

    /// Insert or update; returns true when the key was newly inserted
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut inner = self.inner.write().unwrap();
        let update = inner.find_update(&key);

        if let Some(existing) = inner.next_of(update[0], 0) {
            if inner.node(existing).key == key {
                inner.node_mut(existing).value = value;
                return false;
            }
        }

        let node_level = Self::random_level();
        if node_level > inner.level {
            inner.level = node_level;
        }

        let mut forward = vec![None; node_level];
        for (level, slot) in forward.iter_mut().enumerate() {
            *slot = inner.next_of(update[level], level);
        }

        let node = SkipNode { key, value, forward };
        let idx = match inner.free.pop() {
            Some(idx) => {
                inner.nodes[idx] = Some(node);
                idx
            }
            None => {
                inner.nodes.push(Some(node));
                inner.nodes.len() - 1
            }
        };

        for level in 0..node_level {
            match update[level] {
                None => inner.head[level] = Some(idx),
                Some(prev) => inner.node_mut(prev).forward[level] = Some(idx),
            }
        }

        inner.len += 1;
        true
    }

    /// Remove a key; returns true when it existed
    pub fn delete(&self, key: &K) -> bool {
        let mut inner = self.inner.write().unwrap();
        let update = inner.find_update(key);

        let Some(target) = inner.next_of(update[0], 0) else {
            return false;
        };
        if inner.node(target).key != *key {
            return false;
        }

        let node_level = inner.node(target).forward.len();
        for level in 0..node_level {
            let next = inner.node(target).forward[level];
            match update[level] {
                None => inner.head[level] = next,
                Some(prev) => inner.node_mut(prev).forward[level] = next,
            }
        }

        inner.nodes[target] = None;
        inner.free.push(target);
        inner.len -= 1;

        // Shrink the active level while the top is empty
        while inner.level > 1 && inner.head[inner.level - 1].is_none() {
            inner.level -= 1;
        }
        true
    }

    /// All entries with `start <= key <= end`, ascending
    pub fn range(&self, start: &K, end: &K) -> IndexResult<Vec<(K, V)>> {
        if start > end {
            return Err(IndexError::InvalidRange);
        }

        let inner = self.inner.read().unwrap();
        let update = inner.find_update(start);
        let mut out = Vec::new();
        let mut cursor = inner.next_of(update[0], 0);

        while let Some(idx) = cursor {
            let node = inner.node(idx);
            if node.key > *end {
                break;
            }
            out.push((node.key.clone(), node.value.clone()));
            cursor = node.forward[0];
        }
        Ok(out)
    }

    /// Smallest key
    pub fn min_key(&self) -> Option<K> {
        let inner = self.inner.read().unwrap();
        inner.head[0].map(|idx| inner.node(idx).key.clone())
    }

    /// Largest key, found by walking right and descending
    pub fn max_key(&self) -> Option<K> {
        let inner = self.inner.read().unwrap();
        if inner.len == 0 {
            return None;
        }

        let mut current: Option<usize> = None;
        for level in (0..inner.level).rev() {
            while let Some(next) = inner.next_of(current, level) {
                current = Some(next);
            }
        }
        current.map(|idx| inner.node(idx).key.clone())
    }

    /// Every entry in ascending order
    pub fn entries(&self) -> Vec<(K, V)> {
        let inner = self.inner.read().unwrap();
        let mut out = Vec::with_capacity(inner.len);
        let mut cursor = inner.head[0];
        while let Some(idx) = cursor {
            let node = inner.node(idx);
            out.push((node.key.clone(), node.value.clone()));
            cursor = node.forward[0];
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.head = vec![None; MAX_LEVEL];
        inner.nodes.clear();
        inner.free.clear();
        inner.level = 1;
        inner.len = 0;
    }
}

impl<K, V> Default for SkipList<K, V>
where
    K: IndexKey,
    V: IndexValue,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Index<K, V> for SkipList<K, V>
where
    K: IndexKey,
    V: IndexValue,
{
    fn get(&self, key: &K) -> Option<V> {
        self.search(key)
    }

    fn put(&mut self, key: K, value: V) -> bool {
        SkipList::insert(self, key, value)
    }

    fn delete(&mut self, key: &K) -> bool {
        SkipList::delete(self, key)
    }

    fn range(&self, start: &K, end: &K) -> IndexResult<Vec<(K, V)>> {
        SkipList::range(self, start, end)
    }

    fn count(&self) -> usize {
        self.len()
    }

    fn clear(&mut self) {
        SkipList::clear(self)
    }

    fn index_type(&self) -> IndexType {
        IndexType::SkipList
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_search_delete() {
        let list = SkipList::new();
        assert!(list.insert(5, "five".to_string()));
        assert!(list.insert(1, "one".to_string()));
        assert!(list.insert(3, "three".to_string()));

        assert_eq!(list.search(&3), Some("three".to_string()));
        assert_eq!(list.search(&4), None);

        assert!(list.delete(&3));
        assert!(!list.delete(&3));
        assert_eq!(list.search(&3), None);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_duplicate_insert_updates() {
        let list = SkipList::new();
        assert!(list.insert(1, "a"));
        assert!(!list.insert(1, "b"));
        assert_eq!(list.search(&1), Some("b"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_entries_are_ordered() {
        let list = SkipList::new();
        for i in [50, 10, 40, 20, 30] {
            list.insert(i, i * 10);
        }

        let keys: Vec<i32> = list.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_range_inclusive() {
        let list = SkipList::new();
        for i in 1..=10 {
            list.insert(i, ());
        }

        let keys: Vec<i32> = list.range(&3, &7).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![3, 4, 5, 6, 7]);

        assert_eq!(list.range(&7, &3).err(), Some(IndexError::InvalidRange));
    }

    #[test]
    fn test_min_max() {
        let list = SkipList::new();
        assert_eq!(list.min_key(), None);
        assert_eq!(list.max_key(), None);

        for i in [7, 2, 9, 4] {
            list.insert(i, ());
        }
        assert_eq!(list.min_key(), Some(2));
        assert_eq!(list.max_key(), Some(9));

        list.delete(&9);
        assert_eq!(list.max_key(), Some(7));
    }

    #[test]
    fn test_large_population_stays_ordered() {
        let list = SkipList::new();
        for i in (0..500).rev() {
            list.insert(i, i);
        }
        assert_eq!(list.len(), 500);

        let keys: Vec<i32> = list.entries().into_iter().map(|(k, _)| k).collect();
        assert!(keys.windows(2).all(|p| p[0] < p[1]));

        for i in (0..500).step_by(2) {
            assert!(list.delete(&i));
        }
        assert_eq!(list.len(), 250);
        assert_eq!(list.search(&0), None);
        assert_eq!(list.search(&1), Some(1));
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let list = Arc::new(SkipList::new());
        for i in 0..100 {
            list.insert(i, i);
        }

        let mut handles = Vec::new();
        for t in 0..4 {
            let list = list.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    if t == 0 {
                        list.insert(100 + i, i);
                    } else {
                        let _ = list.search(&(i % 100));
                        let _ = list.range(&10, &20).unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(list.len(), 200);
    }

    #[test]
    fn test_clear() {
        let list = SkipList::new();
        for i in 0..10 {
            list.insert(i, ());
        }
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.search(&5), None);
    }
}
