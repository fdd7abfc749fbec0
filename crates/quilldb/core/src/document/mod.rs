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

//! Document Storage Layer
//!
//! Documents organized into named collections, identified by string ids that
//! default to a freshly generated UUID. Collections materialize documents
//! through a primary B-tree index backed by the page store and the WAL.

pub mod collection;
pub mod database;
pub mod value;

pub use collection::*;
pub use database::*;
pub use value::Value;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage_engine::lib::current_millis;

/// Document identifier; any non-empty string, defaulting to a UUID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    /// Generate a new random document id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Collection name for organizing documents
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionName(pub String);

impl CollectionName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CollectionName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// A stored document: identity, version counter, timestamps and fields.
/// Documents are value types inside the engine; clones cross component
/// boundaries so nothing aliases through the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document identity within its collection
    pub id: String,
    /// Monotonically increasing per-document counter
    pub version: u64,
    /// Creation time, UTC milliseconds
    pub created_at: u64,
    /// Last update time, UTC milliseconds
    pub updated_at: u64,
    /// Field values
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    /// Create a document with a generated id
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self::with_id(DocumentId::new().0, fields)
    }

    /// Create a document with a specific id
    pub fn with_id(id: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        let now = current_millis();
        Self {
            id: id.into(),
            version: 1,
            created_at: now,
            updated_at: now,
            fields,
        }
    }

    /// Build a document from a JSON object
    pub fn from_json(id: impl Into<String>, json: serde_json::Value) -> DocumentResult<Self> {
        match Value::from(json) {
            Value::Object(fields) => Ok(Self::with_id(id, fields)),
            other => Err(DocumentError::InvalidDocument(format!("expected a JSON object, found {}", other.type_name()))),
        }
    }

    /// The document's fields as a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(Value::Object(self.fields.clone()))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Bump the version and update timestamp after a mutation
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = current_millis();
    }
}

/// Document storage errors
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error(transparent)]
    Storage(#[from] crate::storage_engine::lib::StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("document already exists: {0}")]
    DocumentAlreadyExists(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid collection name: {0}")]
    InvalidCollectionName(String),
}

/// Type alias for document operation results
pub type DocumentResult<T> = Result<T, DocumentError>;

/// Compose the transaction/version-chain key for a collection entry
pub fn entry_key(collection: &str, id: &str) -> String {
    format!("{collection}/{id}")
}

/// Split an entry key back into (collection, document id)
pub fn split_entry_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_generation_is_unique() {
        let a = DocumentId::new();
        let b = DocumentId::new();
        assert_ne!(a, b);
        // UUID text form
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_document_from_json() {
        let doc = Document::from_json("users/1", serde_json::json!({"v": 1})).unwrap();
        assert_eq!(doc.id, "users/1");
        assert_eq!(doc.version, 1);
        assert_eq!(doc.get("v"), Some(&Value::I64(1)));
    }

    #[test]
    fn test_document_from_non_object_rejected() {
        assert!(Document::from_json("x", serde_json::json!([1, 2])).is_err());
        assert!(Document::from_json("x", serde_json::json!("str")).is_err());
    }

    #[test]
    fn test_touch_bumps_version_and_timestamp() {
        let mut doc = Document::with_id("d", BTreeMap::new());
        let before = doc.updated_at;
        doc.touch();
        assert_eq!(doc.version, 2);
        assert!(doc.updated_at >= before);
    }

    #[test]
    fn test_entry_key_roundtrip() {
        let key = entry_key("users", "42");
        assert_eq!(key, "users/42");
        assert_eq!(split_entry_key(&key), Some(("users", "42")));
    }
}
