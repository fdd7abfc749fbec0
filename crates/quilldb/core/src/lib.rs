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

//! QuillDB Core
//!
//! A single-node, embedded document store with ACID transactions: JSON-like
//! documents in named collections, persisted through a paged file and a
//! write-ahead log, with strict two-phase locking and per-key version
//! chains for read visibility.

pub mod document;
pub mod indices;
pub mod memory;
pub mod serialization;
pub mod storage_engine;

pub use document::{Collection, CollectionName, Database, DatabaseOptions, Document, DocumentError, DocumentId, DocumentResult, Value};
pub use storage_engine::{IsolationLevel, StorageConfig, StorageError, StorageResult, Transaction, TransactionState};
