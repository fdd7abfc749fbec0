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

// Page management module
// Allocates, reads, writes and frees fixed-size pages through the storage
// engine. Freed pages go on a free list and are reused by later allocations.
// A bounded LRU cache sits in front of the disk; evicting a dirty page
// forces it out to the file first.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::memory::cache::{CacheStats, LruCache};
use crate::storage_engine::file_format::{FileHeader, Page, PageHeader, PageId, PageType, PAGE_SIZE};
use crate::storage_engine::lib::{StorageError, StorageResult};
use crate::storage_engine::storage::StorageEngine;

/// A cached page together with its dirty flag
#[derive(Debug, Clone)]
struct CachedPage {
    page: Page,
    dirty: bool,
}

/// PageManager mediates all page traffic between the engine layers above it
/// and the storage engine below it.
pub struct PageManager {
    engine: Arc<StorageEngine>,
    cache: LruCache<u64, CachedPage>,
    free_list: Mutex<VecDeque<PageId>>,
    /// Total number of pages in the file, including the header page
    page_count: Mutex<u64>,
}

impl PageManager {
    /// Open the page store over `engine`, formatting the header page when the
    /// file is brand new and rebuilding the free list otherwise.
    pub fn open(engine: Arc<StorageEngine>, cache_capacity: usize) -> StorageResult<Self> {
        let manager = Self {
            engine,
            cache: LruCache::new(cache_capacity),
            free_list: Mutex::new(VecDeque::new()),
            page_count: Mutex::new(0),
        };

        if manager.engine.size() == 0 {
            manager.format()?;
        } else {
            manager.load()?;
        }

        Ok(manager)
    }

    /// Write the reserved header page into an empty file
    fn format(&self) -> StorageResult<()> {
        let mut header_page = Page::new(PageId(0), PageType::Header);
        header_page.set_data(&FileHeader::new(PAGE_SIZE as u32).serialize())?;
        self.engine.append(&header_page.serialize()?)?;
        *self.page_count.lock().unwrap() = 1;
        Ok(())
    }

    /// Validate the header page and scan for free pages to reuse
    fn load(&self) -> StorageResult<()> {
        let size = self.engine.size();
        if size % PAGE_SIZE as u64 != 0 {
            return Err(StorageError::CorruptRecord(format!("data file size {size} is not page aligned")));
        }

        let header_page = self.read_page(PageId(0))?;
        FileHeader::deserialize(header_page.data())?;

        let total = size / PAGE_SIZE as u64;
        *self.page_count.lock().unwrap() = total;

        let mut free_list = self.free_list.lock().unwrap();
        for id in 1..total {
            // A page torn by a crash is left for recovery to repair
            if let Ok(page) = self.read_page(PageId(id)) {
                if page.header.page_type == PageType::Free {
                    free_list.push_back(PageId(id));
                }
            }
        }

        Ok(())
    }

    /// Allocates a page of the given type.
    ///
    /// Steps:
    /// 1. Pop the free list; a reused page keeps its id and gets the new type.
    /// 2. Otherwise grow the file by one zeroed page aligned to the page size.
    /// 3. Cache the page as dirty and return it.
    pub fn allocate(&self, page_type: PageType) -> StorageResult<Page> {
        let reused = self.free_list.lock().unwrap().pop_front();

        let page = match reused {
            Some(page_id) => Page::new(page_id, page_type),
            None => {
                let mut count = self.page_count.lock().unwrap();
                let page = Page::new(PageId(*count), page_type);
                let pos = self.engine.append(&page.serialize()?)?;
                if pos != page.id().offset() {
                    return Err(StorageError::CorruptRecord(format!("page {} landed at offset {pos}", page.id())));
                }
                *count += 1;
                page
            }
        };

        self.insert_cached(page.clone(), true)?;
        Ok(page)
    }

    /// Load a page from cache or disk, verifying its checksum
    pub fn get(&self, page_id: PageId) -> StorageResult<Page> {
        if let Some(cached) = self.cache.get(&page_id.0) {
            return Ok(cached.page);
        }

        let page = self.read_page(page_id)?;
        self.insert_cached(page.clone(), false)?;
        Ok(page)
    }

    /// Write a page through to disk, recomputing its checksum first. The
    /// cache entry is left clean.
    pub fn write(&self, page: &Page) -> StorageResult<()> {
        if !self.exists(page.id()) {
            return Err(StorageError::NotFound(format!("page {}", page.id())));
        }

        let mut page = page.clone();
        page.update_checksum();
        self.engine.write_at(page.id().offset(), &page.serialize()?)?;
        self.insert_cached(page, false)?;
        Ok(())
    }

    /// Mark a page free and make its id available for reuse
    pub fn free(&self, page_id: PageId) -> StorageResult<()> {
        if page_id.0 == 0 {
            return Err(StorageError::InvalidArgument("the header page cannot be freed".to_string()));
        }
        if !self.exists(page_id) {
            return Err(StorageError::NotFound(format!("page {page_id}")));
        }

        let blank = Page::new(page_id, PageType::Free);
        self.write(&blank)?;
        self.free_list.lock().unwrap().push_back(page_id);
        Ok(())
    }

    /// Whether `page_id` refers to an allocated slot in the file
    pub fn exists(&self, page_id: PageId) -> bool {
        page_id.0 < *self.page_count.lock().unwrap()
    }

    /// Grow the file with free pages until `page_id` exists. Used by redo
    /// when replaying an allocation the crash wiped out.
    pub fn ensure_allocated(&self, page_id: PageId) -> StorageResult<()> {
        let mut count = self.page_count.lock().unwrap();
        while *count <= page_id.0 {
            let page = Page::new(PageId(*count), PageType::Free);
            self.engine.append(&page.serialize()?)?;
            if *count != page_id.0 {
                self.free_list.lock().unwrap().push_back(PageId(*count));
            }
            *count += 1;
        }
        Ok(())
    }

    /// Write out every dirty cached page and flush the storage engine
    pub fn flush(&self) -> StorageResult<()> {
        for (_, cached) in self.cache.items() {
            if cached.dirty {
                self.write(&cached.page)?;
            }
        }
        self.engine.flush()
    }

    /// Total pages in the file, including the header page
    pub fn page_count(&self) -> u64 {
        *self.page_count.lock().unwrap()
    }

    /// Number of pages currently on the free list
    pub fn free_page_count(&self) -> usize {
        self.free_list.lock().unwrap().len()
    }

    /// Page cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn read_page(&self, page_id: PageId) -> StorageResult<Page> {
        let bytes = self.engine.read(page_id.offset(), PAGE_SIZE)?;
        if bytes.len() < PAGE_SIZE {
            return Err(StorageError::NotFound(format!("page {page_id}")));
        }

        let page = Page::deserialize(&bytes)?;
        if !page.verify_checksum() {
            return Err(StorageError::CorruptPage(page_id.0));
        }
        if page.header.page_id != page_id && page.header.page_type != PageType::Free {
            return Err(StorageError::CorruptPage(page_id.0));
        }
        Ok(page)
    }

    /// Insert into the cache, spilling any evicted dirty page to disk
    fn insert_cached(&self, page: Page, dirty: bool) -> StorageResult<()> {
        let id = page.id().0;
        if let Some((_, evicted)) = self.cache.put(id, CachedPage { page, dirty }) {
            if evicted.dirty {
                let mut spilled = evicted.page;
                spilled.update_checksum();
                self.engine.write_at(spilled.id().offset(), &spilled.serialize()?)?;
            }
        }
        Ok(())
    }
}

impl crate::storage_engine::lib::Flushable for PageManager {
    fn flush(&self) -> StorageResult<()> {
        PageManager::flush(self)
    }
}
