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

// Index structures
// Three shapes behind one contract: the ordered B-tree used as every
// collection's primary index, and the skip list and hash index as alternate
// secondary-index shapes.

pub mod btree;
pub mod hash_index;
pub mod lib;
pub mod skip_list;

pub use btree::{BTree, BTreeRange, DEFAULT_DEGREE, MIN_DEGREE};
pub use hash_index::HashIndex;
pub use lib::{Index, IndexError, IndexKey, IndexResult, IndexType, IndexValue};
pub use skip_list::{SkipList, MAX_LEVEL};
