//! Page cache over the durable file.
//!
//! The cache is keyed by page id and sits between the tree and the
//! [`PageFile`](crate::file::PageFile). Reads load through it; writes are
//! buffered as dirty pages until [`flush`](PageCache::flush). When over
//! capacity, the least recently used **clean** page is dropped; dirty pages
//! are never evicted before a flush.

use std::collections::HashMap;

use crate::error::StoreError;
use crate::file::PageFile;
use crate::page::Page;
use crate::types::PageId;

/// Default cache capacity in pages (4MB with 4KB pages).
const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// A cached page with bookkeeping.
struct Slot {
    page: Page,
    dirty: bool,
    /// Logical access time for LRU eviction.
    last_used: u64,
}

/// Page cache with dirty tracking and clean-only LRU eviction.
pub struct PageCache {
    file: Box<dyn PageFile>,
    slots: HashMap<PageId, Slot>,
    capacity: usize,
    clock: u64,
}

impl PageCache {
    /// Creates a cache over the given file.
    pub fn new(file: Box<dyn PageFile>) -> Self {
        Self::with_capacity(file, DEFAULT_CACHE_CAPACITY)
    }

    /// Creates a cache with a custom capacity in pages.
    pub fn with_capacity(file: Box<dyn PageFile>, capacity: usize) -> Self {
        debug_assert!(capacity > 0, "cache capacity must be positive");
        Self {
            file,
            slots: HashMap::new(),
            capacity,
            clock: 0,
        }
    }

    /// Returns the number of whole pages in the underlying file.
    pub fn file_pages(&self) -> u64 {
        self.file.page_count()
    }

    /// Returns the page with the given id, loading from the file on a miss.
    pub fn get(&mut self, id: PageId) -> Result<&Page, StoreError> {
        self.clock += 1;
        let clock = self.clock;

        if !self.slots.contains_key(&id) {
            let page = self.file.read_page(id)?;
            self.evict_if_full();
            self.slots.insert(
                id,
                Slot {
                    page,
                    dirty: false,
                    last_used: clock,
                },
            );
        }

        let slot = self.slots.get_mut(&id).expect("slot just ensured");
        slot.last_used = clock;
        Ok(&slot.page)
    }

    /// Inserts a page as dirty.
    ///
    /// Used by copy-on-write updates: the page is freshly allocated (or a
    /// recycled free page) and will reach the file on the next flush.
    pub fn put(&mut self, page: Page) {
        self.clock += 1;
        let id = page.id;
        self.evict_if_full();
        self.slots.insert(
            id,
            Slot {
                page,
                dirty: true,
                last_used: self.clock,
            },
        );
    }

    /// Drops buffered dirty pages without writing them.
    ///
    /// Called when an operation fails after staging writes; the durable
    /// image is untouched, so the staged pages must not survive to the next
    /// flush.
    pub fn discard_dirty(&mut self) {
        self.slots.retain(|_, slot| !slot.dirty);
    }

    /// Writes all dirty pages to the file and syncs it.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let mut dirty_ids: Vec<PageId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.dirty)
            .map(|(id, _)| *id)
            .collect();
        dirty_ids.sort();

        for id in dirty_ids {
            let slot = self.slots.get_mut(&id).expect("dirty page present");
            self.file.write_page(&slot.page)?;
            slot.dirty = false;
        }

        self.file.sync()
    }

    /// Writes a page straight to the file, bypassing the cache.
    ///
    /// Used for the superblock, which must only reach the file after the
    /// data pages it references are durable.
    pub fn write_direct(&mut self, page: &Page) -> Result<(), StoreError> {
        self.slots.remove(&page.id);
        self.file.write_page(page)?;
        self.file.sync()
    }

    /// Reads a page straight from the file, bypassing cache contents.
    pub fn read_direct(&mut self, id: PageId) -> Result<Page, StoreError> {
        self.file.read_page(id)
    }

    /// Returns the number of dirty pages currently buffered.
    pub fn dirty_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.dirty).count()
    }

    /// Returns the number of cached pages.
    pub fn cached_count(&self) -> usize {
        self.slots.len()
    }

    /// Evicts the least recently used clean page if at capacity.
    fn evict_if_full(&mut self) {
        if self.slots.len() < self.capacity {
            return;
        }

        let victim = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.dirty)
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(id, _)| *id);

        if let Some(id) = victim {
            self.slots.remove(&id);
        }
        // All pages dirty: allow the cache to exceed capacity until flush.
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("cached", &self.slots.len())
            .field("capacity", &self.capacity)
            .field("dirty", &self.dirty_count())
            .finish_non_exhaustive()
    }
}
