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

// Hash index
// Unordered map with the shared index contract. Point lookups are O(1);
// range() sorts the matching keys only at enumeration time.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use crate::indices::lib::{Index, IndexError, IndexKey, IndexResult, IndexType, IndexValue};

/// HashIndex backed by a reader-writer locked map
pub struct HashIndex<K, V>
where
    K: IndexKey + Hash,
    V: IndexValue,
{
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> HashIndex<K, V>
where
    K: IndexKey + Hash,
    V: IndexValue,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn search(&self, key: &K) -> Option<V> {
        self.entries.read().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) -> bool {
        self.entries.write().unwrap().insert(key, value).is_none()
    }

    pub fn remove(&self, key: &K) -> bool {
        self.entries.write().unwrap().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for HashIndex<K, V>
where
    K: IndexKey + Hash,
    V: IndexValue,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Index<K, V> for HashIndex<K, V>
where
    K: IndexKey + Hash,
    V: IndexValue,
{
    fn get(&self, key: &K) -> Option<V> {
        self.search(key)
    }

    fn put(&mut self, key: K, value: V) -> bool {
        self.insert(key, value)
    }

    fn delete(&mut self, key: &K) -> bool {
        self.remove(key)
    }

    fn range(&self, start: &K, end: &K) -> IndexResult<Vec<(K, V)>> {
        if start > end {
            return Err(IndexError::InvalidRange);
        }

        let entries = self.entries.read().unwrap();
        let mut matching: Vec<(K, V)> = entries.iter().filter(|(k, _)| *k >= start && *k <= end).map(|(k, v)| (k.clone(), v.clone())).collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matching)
    }

    fn count(&self) -> usize {
        self.len()
    }

    fn clear(&mut self) {
        self.entries.write().unwrap().clear();
    }

    fn index_type(&self) -> IndexType {
        IndexType::Hash
    }
}
