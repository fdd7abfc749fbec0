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

// Common contract shared by the three index shapes: the ordered B-tree, the
// skip list, and the hash index that only orders its keys on range
// enumeration.

use std::fmt::Debug;

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Keys an index can hold
pub trait IndexKey: Clone + Debug + Ord + Send + Sync {}
impl<T: Clone + Debug + Ord + Send + Sync> IndexKey for T {}

/// Values an index can hold
pub trait IndexValue: Clone + Debug + Send + Sync {}
impl<T: Clone + Debug + Send + Sync> IndexValue for T {}

/// Available index shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// Ordered B-tree for range queries and sorted access
    BTree,
    /// Probabilistic ordered skip list
    SkipList,
    /// Hash index for fast point lookups
    Hash,
}

/// Errors that can occur during index operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("B-tree degree must be at least 3, got {0}")]
    InvalidDegree(usize),

    #[error("invalid range: start must not exceed end")]
    InvalidRange,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<IndexError> for crate::storage_engine::lib::StorageError {
    fn from(e: IndexError) -> Self {
        crate::storage_engine::lib::StorageError::InvalidArgument(e.to_string())
    }
}

/// Operations common to every index shape. Range results come back as a
/// collected, ordered vector so the contract stays object-safe; the B-tree
/// additionally offers a lazy iterator on its own type.
pub trait Index<K, V>: Send + Sync
where
    K: IndexKey,
    V: IndexValue,
{
    /// Look up a key
    fn get(&self, key: &K) -> Option<V>;

    /// Insert or update; returns true when the key was newly inserted
    fn put(&mut self, key: K, value: V) -> bool;

    /// Remove a key; returns true when it existed
    fn delete(&mut self, key: &K) -> bool;

    /// All entries with `start <= key <= end`, ascending
    fn range(&self, start: &K, end: &K) -> IndexResult<Vec<(K, V)>>;

    /// Number of entries
    fn count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Whether the key is present
    fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Drop every entry
    fn clear(&mut self);

    /// The shape of this index
    fn index_type(&self) -> IndexType;
}
