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

//! Collections
//!
//! A collection maps document ids to documents through its primary B-tree,
//! persisting every mutation through the WAL and the page store. The
//! collection-level API is auto-committing: each call runs as its own
//! short transaction in the log. Secondary indexes map an encoded field
//! value plus document id to the document's page.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::document::{entry_key, Document, DocumentError, DocumentId, DocumentResult, Value};
use crate::indices::{BTree, HashIndex, Index, IndexType, SkipList};
use crate::serialization::encode_entry;
use crate::storage_engine::file_format::{Page, PageId, PageType};
use crate::storage_engine::lib::{current_ticks, StorageError, StorageResult};
use crate::storage_engine::page_manager::PageManager;
use crate::storage_engine::transaction::format_tx_id;
use crate::storage_engine::version_manager::VersionManager;
use crate::storage_engine::wal::{WalRecord, WriteAheadLog};

/// Separator between the encoded field value and the document id inside a
/// secondary index key
const INDEX_KEY_SEPARATOR: char = '\u{0}';

/// Engine services a collection operates through, shared with the database
pub struct CollectionServices {
    pub wal: Arc<WriteAheadLog>,
    pub pages: Arc<PageManager>,
    pub versions: Arc<VersionManager>,
    /// Allocates ids for the short auto-commit transactions
    pub tx_counter: Arc<AtomicU64>,
    pub btree_degree: usize,
}

impl CollectionServices {
    fn next_tx_id(&self) -> String {
        format_tx_id(self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1, current_ticks())
    }
}

type SecondaryIndex = Box<dyn Index<String, u64>>;

/// A named collection of documents
pub struct Collection {
    name: String,
    primary: RwLock<BTree<String, Document>>,
    /// Document id -> backing page
    doc_pages: RwLock<HashMap<String, u64>>,
    secondary: RwLock<HashMap<String, SecondaryIndex>>,
    /// Serializes structural changes on the collection-level API
    collection_lock: Mutex<()>,
    /// Monotonic count of documents ever inserted
    inserted_total: AtomicU64,
    services: Arc<CollectionServices>,
}

impl Collection {
    pub fn new(name: impl Into<String>, services: Arc<CollectionServices>) -> DocumentResult<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(DocumentError::InvalidCollectionName(name));
        }

        let primary = BTree::new(services.btree_degree).map_err(StorageError::from)?;
        Ok(Self {
            name,
            primary: RwLock::new(primary),
            doc_pages: RwLock::new(HashMap::new()),
            secondary: RwLock::new(HashMap::new()),
            collection_lock: Mutex::new(()),
            inserted_total: AtomicU64::new(0),
            services,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a document; fails when the id already exists.
    ///
    /// Steps:
    /// 1. Take the collection lock and reject duplicates.
    /// 2. Log Begin and the insert image, fsync, write the page.
    /// 3. Log Commit and fsync; only then mutate the in-memory state.
    pub fn insert(&self, document: Document) -> DocumentResult<DocumentId> {
        if document.id.is_empty() {
            return Err(DocumentError::InvalidDocument("document id must not be empty".to_string()));
        }

        let _lock = self.collection_lock.lock().unwrap();

        if self.primary.read().unwrap().contains(&document.id) {
            return Err(DocumentError::DocumentAlreadyExists(document.id));
        }

        let tx_id = self.services.next_tx_id();
        self.services.wal.write(&WalRecord::begin(&tx_id))?;
        let page_id = self.persist_insert(&tx_id, &document)?;
        self.services.wal.write(&WalRecord::commit(&tx_id))?;
        self.services.wal.sync()?;

        let commit_time = self.services.versions.next_timestamp();
        self.install(&document, page_id, &tx_id, commit_time);

        Ok(DocumentId(document.id))
    }

    /// Insert a batch under one log transaction
    pub fn insert_many(&self, documents: Vec<Document>) -> DocumentResult<Vec<DocumentId>> {
        let _lock = self.collection_lock.lock().unwrap();

        {
            let primary = self.primary.read().unwrap();
            for document in &documents {
                if document.id.is_empty() {
                    return Err(DocumentError::InvalidDocument("document id must not be empty".to_string()));
                }
                if primary.contains(&document.id) {
                    return Err(DocumentError::DocumentAlreadyExists(document.id.clone()));
                }
            }
        }

        let tx_id = self.services.next_tx_id();
        self.services.wal.write(&WalRecord::begin(&tx_id))?;

        let mut placed = Vec::with_capacity(documents.len());
        for document in &documents {
            placed.push(self.persist_insert(&tx_id, document)?);
        }

        self.services.wal.write(&WalRecord::commit(&tx_id))?;
        self.services.wal.sync()?;

        let commit_time = self.services.versions.next_timestamp();
        let mut ids = Vec::with_capacity(documents.len());
        for (document, page_id) in documents.into_iter().zip(placed) {
            self.install(&document, page_id, &tx_id, commit_time);
            ids.push(DocumentId(document.id));
        }

        Ok(ids)
    }

    /// Replace a document's fields; false when the id does not exist
    pub fn update(&self, id: &str, fields: BTreeMap<String, Value>) -> DocumentResult<bool> {
        let _lock = self.collection_lock.lock().unwrap();

        let Some(existing) = self.primary.read().unwrap().get(&id.to_string()) else {
            return Ok(false);
        };
        let page_id = self.page_of(id).ok_or_else(|| StorageError::NotFound(format!("page for {}/{id}", self.name)))?;

        let mut updated = existing.clone();
        updated.fields = fields;
        updated.touch();

        let key = entry_key(&self.name, id);
        let tx_id = self.services.next_tx_id();
        self.services.wal.write(&WalRecord::begin(&tx_id))?;
        let lsn = self.services.wal.write(&WalRecord::update(&tx_id, page_id, encode_entry(&key, &existing), encode_entry(&key, &updated)))?;
        self.services.wal.sync()?;
        self.write_entry_page(page_id, &key, &updated, lsn)?;
        self.services.wal.write(&WalRecord::commit(&tx_id))?;
        self.services.wal.sync()?;

        let commit_time = self.services.versions.next_timestamp();
        self.unindex_document(&existing);
        self.install(&updated, page_id, &tx_id, commit_time);

        Ok(true)
    }

    /// Delete a document; false when the id does not exist
    pub fn delete(&self, id: &str) -> DocumentResult<bool> {
        let _lock = self.collection_lock.lock().unwrap();

        let Some(existing) = self.primary.read().unwrap().get(&id.to_string()) else {
            return Ok(false);
        };
        let page_id = self.page_of(id);

        let key = entry_key(&self.name, id);
        let tx_id = self.services.next_tx_id();
        self.services.wal.write(&WalRecord::begin(&tx_id))?;
        self.services.wal.write(&WalRecord::delete(&tx_id, page_id.unwrap_or(0), encode_entry(&key, &existing)))?;
        self.services.wal.sync()?;
        if let Some(page_id) = page_id {
            self.services.pages.free(PageId(page_id))?;
        }
        self.services.wal.write(&WalRecord::commit(&tx_id))?;
        self.services.wal.sync()?;

        let commit_time = self.services.versions.next_timestamp();
        self.primary.write().unwrap().delete(&id.to_string());
        self.doc_pages.write().unwrap().remove(id);
        self.unindex_document(&existing);
        self.services.versions.mark_deleted(&key, &tx_id, commit_time);

        Ok(true)
    }

    /// Look up a document by id
    pub fn find_by_id(&self, id: &str) -> Option<Document> {
        self.primary.read().unwrap().get(&id.to_string())
    }

    /// Every document, ascending by id
    pub fn find_all(&self) -> Vec<Document> {
        self.primary.read().unwrap().iter().map(|(_, d)| d.clone()).collect()
    }

    /// Every document id, ascending
    pub fn list_ids(&self) -> Vec<DocumentId> {
        self.primary.read().unwrap().iter().map(|(id, _)| DocumentId(id.clone())).collect()
    }

    /// Documents whose `field` equals `value`, using a secondary index when
    /// one exists and scanning the primary index otherwise
    pub fn find_by_field(&self, field: &str, value: &Value) -> DocumentResult<Vec<Document>> {
        let value_key = value.index_key();

        let from_index: Option<Vec<String>> = {
            let secondary = self.secondary.read().unwrap();
            match secondary.get(field) {
                Some(index) => {
                    let start = format!("{value_key}{INDEX_KEY_SEPARATOR}");
                    let end = format!("{value_key}{INDEX_KEY_SEPARATOR}\u{10FFFF}");
                    let matches = index.range(&start, &end).map_err(StorageError::from)?;
                    Some(matches.into_iter().filter_map(|(k, _)| k.split_once(INDEX_KEY_SEPARATOR).map(|(_, id)| id.to_string())).collect())
                }
                None => None,
            }
        };

        let primary = self.primary.read().unwrap();
        let documents = match from_index {
            Some(ids) => ids.into_iter().filter_map(|id| primary.get(&id)).collect(),
            None => primary.iter().filter(|(_, d)| d.get(field) == Some(value)).map(|(_, d)| d.clone()).collect(),
        };
        Ok(documents)
    }

    /// Number of documents currently stored
    pub fn count(&self) -> usize {
        self.primary.read().unwrap().len()
    }

    /// Total documents ever inserted
    pub fn inserted_total(&self) -> u64 {
        self.inserted_total.load(Ordering::SeqCst)
    }

    /// Delete every document under a single log transaction
    pub fn clear(&self) -> DocumentResult<()> {
        let _lock = self.collection_lock.lock().unwrap();

        let documents = self.find_all();
        if documents.is_empty() {
            return Ok(());
        }

        let tx_id = self.services.next_tx_id();
        self.services.wal.write(&WalRecord::begin(&tx_id))?;
        for document in &documents {
            let key = entry_key(&self.name, &document.id);
            let page_id = self.page_of(&document.id).unwrap_or(0);
            self.services.wal.write(&WalRecord::delete(&tx_id, page_id, encode_entry(&key, document)))?;
        }
        self.services.wal.sync()?;

        for document in &documents {
            if let Some(page_id) = self.page_of(&document.id) {
                self.services.pages.free(PageId(page_id))?;
            }
        }

        self.services.wal.write(&WalRecord::commit(&tx_id))?;
        self.services.wal.sync()?;

        let commit_time = self.services.versions.next_timestamp();
        for document in &documents {
            self.services.versions.mark_deleted(&entry_key(&self.name, &document.id), &tx_id, commit_time);
        }
        self.primary.write().unwrap().clear();
        self.doc_pages.write().unwrap().clear();
        for index in self.secondary.write().unwrap().values_mut() {
            index.clear();
        }

        Ok(())
    }

    /// Create a secondary index over `field`, B-tree shaped
    pub fn create_index(&self, field: &str) -> DocumentResult<bool> {
        self.create_index_with(field, IndexType::BTree)
    }

    /// Create a secondary index over `field` with an explicit shape.
    /// Returns false when the field is already indexed.
    pub fn create_index_with(&self, field: &str, shape: IndexType) -> DocumentResult<bool> {
        let _lock = self.collection_lock.lock().unwrap();

        let mut secondary = self.secondary.write().unwrap();
        if secondary.contains_key(field) {
            return Ok(false);
        }

        let mut index: SecondaryIndex = match shape {
            IndexType::BTree => Box::new(BTree::new(self.services.btree_degree).map_err(StorageError::from)?),
            IndexType::SkipList => Box::<SkipList<String, u64>>::default(),
            IndexType::Hash => Box::<HashIndex<String, u64>>::default(),
        };

        // Backfill from the existing documents
        let pages = self.doc_pages.read().unwrap();
        for (id, document) in self.primary.read().unwrap().iter() {
            if let Some(value) = document.get(field) {
                let page_id = pages.get(id).copied().unwrap_or(0);
                index.put(Self::secondary_key(value, id), page_id);
            }
        }
        drop(pages);

        secondary.insert(field.to_string(), index);
        tracing::debug!(collection = %self.name, field, ?shape, "secondary index created");
        Ok(true)
    }

    /// Drop the secondary index over `field`; false when none exists
    pub fn drop_index(&self, field: &str) -> bool {
        let _lock = self.collection_lock.lock().unwrap();
        self.secondary.write().unwrap().remove(field).is_some()
    }

    /// Fields with a secondary index
    pub fn indexed_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.secondary.read().unwrap().keys().cloned().collect();
        fields.sort();
        fields
    }

    /// Page currently backing a document id
    pub fn page_of(&self, id: &str) -> Option<u64> {
        self.doc_pages.read().unwrap().get(id).copied()
    }

    // ---- internal appliers shared with the transactional path ----

    /// Write the entry envelope into its page
    pub(crate) fn write_entry_page(&self, page_id: u64, key: &str, document: &Document, lsn: u64) -> StorageResult<()> {
        let mut page = Page::new(PageId(page_id), PageType::Data);
        page.set_data(&encode_entry(key, document))?;
        page.header.lsn = lsn;
        self.services.pages.write(&page)
    }

    /// Log and persist one insert inside an already-begun transaction;
    /// returns the page the document landed on.
    fn persist_insert(&self, tx_id: &str, document: &Document) -> DocumentResult<u64> {
        let key = entry_key(&self.name, &document.id);
        let page = self.services.pages.allocate(PageType::Data)?;
        let lsn = self.services.wal.write(&WalRecord::insert(tx_id, page.id().0, encode_entry(&key, document)))?;
        self.services.wal.sync()?;
        self.write_entry_page(page.id().0, &key, document, lsn)?;
        Ok(page.id().0)
    }

    /// Install a committed document into the in-memory structures
    fn install(&self, document: &Document, page_id: u64, tx_id: &str, commit_time: u64) {
        let newly_inserted = self.primary.write().unwrap().insert(document.id.clone(), document.clone());
        if newly_inserted {
            self.inserted_total.fetch_add(1, Ordering::SeqCst);
        }
        self.doc_pages.write().unwrap().insert(document.id.clone(), page_id);
        self.index_document(document, page_id);
        self.services.versions.add_version(&entry_key(&self.name, &document.id), document.clone(), tx_id, commit_time);
    }

    /// Apply a committed transactional write (page already logged)
    pub(crate) fn apply_committed_write(&self, id: &str, page_id: u64, document: &Document, lsn: u64, tx_id: &str, commit_time: u64) -> StorageResult<()> {
        let key = entry_key(&self.name, id);
        self.write_entry_page(page_id, &key, document, lsn)?;

        if let Some(previous) = self.primary.read().unwrap().get(&id.to_string()) {
            self.unindex_document(&previous);
        }
        self.install(document, page_id, tx_id, commit_time);
        Ok(())
    }

    /// Apply a committed transactional delete
    pub(crate) fn apply_committed_delete(&self, id: &str, page_id: Option<u64>, tx_id: &str, commit_time: u64) -> StorageResult<()> {
        if let Some(page_id) = page_id.or_else(|| self.page_of(id)) {
            match self.services.pages.free(PageId(page_id)) {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(previous) = self.primary.read().unwrap().get(&id.to_string()) {
            self.unindex_document(&previous);
        }
        self.primary.write().unwrap().delete(&id.to_string());
        self.doc_pages.write().unwrap().remove(id);
        self.services.versions.mark_deleted(&entry_key(&self.name, id), tx_id, commit_time);
        Ok(())
    }

    /// Install a document rebuilt from the page store during open; no WAL
    /// traffic and no version-chain entry.
    pub(crate) fn load_recovered(&self, document: Document, page_id: u64) {
        self.doc_pages.write().unwrap().insert(document.id.clone(), page_id);
        self.index_document(&document, page_id);
        if self.primary.write().unwrap().insert(document.id.clone(), document) {
            self.inserted_total.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn secondary_key(value: &Value, id: &str) -> String {
        format!("{}{INDEX_KEY_SEPARATOR}{id}", value.index_key())
    }

    fn index_document(&self, document: &Document, page_id: u64) {
        let mut secondary = self.secondary.write().unwrap();
        for (field, index) in secondary.iter_mut() {
            if let Some(value) = document.get(field) {
                index.put(Self::secondary_key(value, &document.id), page_id);
            }
        }
    }

    fn unindex_document(&self, document: &Document) {
        let mut secondary = self.secondary.write().unwrap();
        for (field, index) in secondary.iter_mut() {
            if let Some(value) = document.get(field) {
                index.delete(&Self::secondary_key(value, &document.id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_engine::storage::StorageEngine;
    use tempfile::tempdir;

    fn services(dir: &tempfile::TempDir) -> Arc<CollectionServices> {
        let wal_engine = Arc::new(StorageEngine::open(dir.path().join("test.wal"), false).unwrap());
        let data_engine = Arc::new(StorageEngine::open(dir.path().join("test.db"), false).unwrap());
        Arc::new(CollectionServices {
            wal: Arc::new(WriteAheadLog::open(wal_engine).unwrap()),
            pages: Arc::new(PageManager::open(data_engine, 64).unwrap()),
            versions: Arc::new(VersionManager::new()),
            tx_counter: Arc::new(AtomicU64::new(0)),
            btree_degree: 4,
        })
    }

    fn doc(id: &str, v: i64) -> Document {
        let mut fields = BTreeMap::new();
        fields.insert("v".to_string(), Value::I64(v));
        Document::with_id(id, fields)
    }

    #[test]
    fn test_insert_and_find() {
        let dir = tempdir().unwrap();
        let collection = Collection::new("users", services(&dir)).unwrap();

        let id = collection.insert(doc("1", 10)).unwrap();
        assert_eq!(id.as_str(), "1");

        let found = collection.find_by_id("1").unwrap();
        assert_eq!(found.get("v"), Some(&Value::I64(10)));
        assert_eq!(collection.count(), 1);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let dir = tempdir().unwrap();
        let collection = Collection::new("users", services(&dir)).unwrap();

        collection.insert(doc("1", 1)).unwrap();
        assert!(matches!(collection.insert(doc("1", 2)), Err(DocumentError::DocumentAlreadyExists(_))));
    }

    #[test]
    fn test_update_bumps_version() {
        let dir = tempdir().unwrap();
        let collection = Collection::new("users", services(&dir)).unwrap();
        collection.insert(doc("1", 1)).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("v".to_string(), Value::I64(99));
        assert!(collection.update("1", fields).unwrap());

        let found = collection.find_by_id("1").unwrap();
        assert_eq!(found.get("v"), Some(&Value::I64(99)));
        assert_eq!(found.version, 2);

        assert!(!collection.update("missing", BTreeMap::new()).unwrap());
    }

    #[test]
    fn test_delete_and_reuse() {
        let dir = tempdir().unwrap();
        let collection = Collection::new("users", services(&dir)).unwrap();
        collection.insert(doc("1", 1)).unwrap();

        assert!(collection.delete("1").unwrap());
        assert!(!collection.delete("1").unwrap());
        assert!(collection.find_by_id("1").is_none());
        assert_eq!(collection.count(), 0);

        // The monotonic counter does not go backwards
        assert_eq!(collection.inserted_total(), 1);
    }

    #[test]
    fn test_insert_many_and_find_all() {
        let dir = tempdir().unwrap();
        let collection = Collection::new("users", services(&dir)).unwrap();

        let ids = collection.insert_many(vec![doc("b", 2), doc("a", 1), doc("c", 3)]).unwrap();
        assert_eq!(ids.len(), 3);

        let all = collection.find_all();
        let order: Vec<&str> = all.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_find_by_field_with_and_without_index() {
        let dir = tempdir().unwrap();
        let collection = Collection::new("users", services(&dir)).unwrap();
        for (id, v) in [("1", 5), ("2", 7), ("3", 5)] {
            collection.insert(doc(id, v)).unwrap();
        }

        // Unindexed: primary scan
        let found = collection.find_by_field("v", &Value::I64(5)).unwrap();
        assert_eq!(found.len(), 2);

        // Indexed: same result through the secondary index
        assert!(collection.create_index("v").unwrap());
        assert!(!collection.create_index("v").unwrap());
        let found = collection.find_by_field("v", &Value::I64(5)).unwrap();
        let mut ids: Vec<&str> = found.iter().map(|d| d.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn test_index_shapes() {
        let dir = tempdir().unwrap();
        let collection = Collection::new("users", services(&dir)).unwrap();
        for (id, v) in [("1", 5), ("2", 7)] {
            collection.insert(doc(id, v)).unwrap();
        }

        assert!(collection.create_index_with("v", IndexType::SkipList).unwrap());
        assert_eq!(collection.find_by_field("v", &Value::I64(7)).unwrap().len(), 1);
        assert!(collection.drop_index("v"));

        assert!(collection.create_index_with("v", IndexType::Hash).unwrap());
        assert_eq!(collection.find_by_field("v", &Value::I64(5)).unwrap().len(), 1);
        assert!(collection.drop_index("v"));
        assert!(!collection.drop_index("v"));
    }

    #[test]
    fn test_index_follows_updates_and_deletes() {
        let dir = tempdir().unwrap();
        let collection = Collection::new("users", services(&dir)).unwrap();
        collection.create_index("v").unwrap();

        collection.insert(doc("1", 5)).unwrap();
        assert_eq!(collection.find_by_field("v", &Value::I64(5)).unwrap().len(), 1);

        let mut fields = BTreeMap::new();
        fields.insert("v".to_string(), Value::I64(6));
        collection.update("1", fields).unwrap();
        assert!(collection.find_by_field("v", &Value::I64(5)).unwrap().is_empty());
        assert_eq!(collection.find_by_field("v", &Value::I64(6)).unwrap().len(), 1);

        collection.delete("1").unwrap();
        assert!(collection.find_by_field("v", &Value::I64(6)).unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let collection = Collection::new("users", services(&dir)).unwrap();
        for i in 0..5 {
            collection.insert(doc(&i.to_string(), i)).unwrap();
        }

        collection.clear().unwrap();
        assert_eq!(collection.count(), 0);
        assert!(collection.find_all().is_empty());
        // Cleared pages are reusable
        collection.insert(doc("fresh", 1)).unwrap();
        assert_eq!(collection.count(), 1);
    }

    #[test]
    fn test_invalid_collection_name() {
        let dir = tempdir().unwrap();
        assert!(matches!(Collection::new("", services(&dir)), Err(DocumentError::InvalidCollectionName(_))));
        assert!(matches!(Collection::new("a/b", services(&dir)), Err(DocumentError::InvalidCollectionName(_))));
    }
}
