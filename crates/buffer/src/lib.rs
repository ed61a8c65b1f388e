//! Fixed-capacity page cache with pinning and LRU eviction.
//!
//! Sits between [`storage::DiskManager`] and the table layer. Frames are
//! keyed by `(table, is_tail, column, page_index)`; eviction only ever
//! removes the least-recently-used *unpinned* frame, writing it back first
//! if dirty.

#[cfg(test)]
mod tests;

use hashbrown::HashMap;
use std::path::Path;

use common::DbResult;
use storage::{DiskManager, Page};

/// Identifies a single page across every table/area/column.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub table: String,
    pub is_tail: bool,
    pub column: usize,
    pub page_index: u64,
}

impl PageKey {
    pub fn new(table: impl Into<String>, is_tail: bool, column: usize, page_index: u64) -> Self {
        Self {
            table: table.into(),
            is_tail,
            column,
            page_index,
        }
    }
}

/// A resident page: its bytes, dirty flag, and pin count.
#[derive(Debug)]
pub struct Frame {
    pub page: Page,
    pub dirty: bool,
    pub pin_count: u32,
}

/// Fixed-capacity cache of page frames backed by a [`DiskManager`].
#[derive(Debug)]
pub struct BufferPool {
    disk: DiskManager,
    page_size: usize,
    capacity: usize,
    frames: HashMap<PageKey, Frame>,
    /// Oldest at the front, most-recently-used at the back.
    lru: Vec<PageKey>,
}

impl BufferPool {
    pub fn new(root: impl AsRef<Path>, capacity: usize, page_size: usize) -> DbResult<Self> {
        assert!(capacity > 0, "buffer pool capacity must be > 0");
        Ok(Self {
            disk: DiskManager::new(root.as_ref())?,
            page_size,
            capacity,
            frames: HashMap::new(),
            lru: Vec::new(),
        })
    }

    pub fn disk_manager(&self) -> &DiskManager {
        &self.disk
    }

    fn touch(&mut self, key: &PageKey) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            let k = self.lru.remove(pos);
            self.lru.push(k);
        } else {
            self.lru.push(key.clone());
        }
    }

    fn load_from_disk(&self, key: &PageKey) -> DbResult<Frame> {
        let raw = self
            .disk
            .read_page(&key.table, key.is_tail, key.column, key.page_index)?;
        let page = match raw {
            Some(bytes) => {
                let count =
                    self.disk
                        .read_page_count(&key.table, key.is_tail, key.column, key.page_index)?;
                Page::from_parts(bytes, count, self.page_size)
            }
            None => Page::new(self.page_size),
        };
        Ok(Frame {
            page,
            dirty: false,
            pin_count: 0,
        })
    }

    fn write_back(&self, key: &PageKey, frame: &Frame) -> DbResult<()> {
        self.disk.write_page(
            &key.table,
            key.is_tail,
            key.column,
            key.page_index,
            frame.page.data(),
            self.page_size,
            frame.page.num_records(),
        )
    }

    /// Evict the oldest unpinned frame if at capacity. Returns `false` if
    /// every resident frame is pinned (caller must treat as out-of-memory).
    fn evict_if_needed(&mut self) -> DbResult<bool> {
        if self.frames.len() < self.capacity {
            return Ok(true);
        }
        let victim_pos = self
            .lru
            .iter()
            .position(|k| self.frames.get(k).is_some_and(|f| f.pin_count == 0));
        let Some(pos) = victim_pos else {
            return Ok(false);
        };
        let key = self.lru.remove(pos);
        if let Some(frame) = self.frames.get(&key)
            && frame.dirty
        {
            self.write_back(&key, frame)?;
        }
        self.frames.remove(&key);
        Ok(true)
    }

    /// Fetch a page, loading it from disk on a miss and evicting the LRU
    /// unpinned frame if the pool is full. Returns `None` only when every
    /// resident frame is pinned and none can be evicted.
    pub fn fetch_page(&mut self, key: &PageKey, pin: bool) -> DbResult<Option<&mut Frame>> {
        if !self.frames.contains_key(key) {
            if !self.evict_if_needed()? {
                return Ok(None);
            }
            let frame = self.load_from_disk(key)?;
            self.frames.insert(key.clone(), frame);
        }
        self.touch(key);
        let frame = self.frames.get_mut(key).unwrap();
        if pin {
            frame.pin_count += 1;
        }
        Ok(Some(frame))
    }

    pub fn pin(&mut self, key: &PageKey) -> bool {
        let Some(frame) = self.frames.get_mut(key) else {
            return false;
        };
        frame.pin_count += 1;
        self.touch(key);
        true
    }

    pub fn unpin(&mut self, key: &PageKey) -> bool {
        let Some(frame) = self.frames.get_mut(key) else {
            return false;
        };
        if frame.pin_count > 0 {
            frame.pin_count -= 1;
        }
        self.touch(key);
        true
    }

    pub fn mark_dirty(&mut self, key: &PageKey) -> bool {
        let Some(frame) = self.frames.get_mut(key) else {
            return false;
        };
        frame.dirty = true;
        self.touch(key);
        true
    }

    /// Write back if dirty (clearing the flag); succeeds for clean or
    /// absent frames too.
    pub fn flush_page(&mut self, key: &PageKey) -> DbResult<bool> {
        let Some(frame) = self.frames.get(key) else {
            return Ok(true);
        };
        if frame.dirty {
            self.write_back(key, frame)?;
            self.frames.get_mut(key).unwrap().dirty = false;
        }
        Ok(true)
    }

    /// Flush every resident frame, optionally restricted to one table.
    pub fn flush_all(&mut self, table: Option<&str>) -> DbResult<()> {
        let keys: Vec<PageKey> = self
            .frames
            .keys()
            .filter(|k| table.is_none_or(|t| k.table == t))
            .cloned()
            .collect();
        for key in keys {
            self.flush_page(&key)?;
        }
        Ok(())
    }

    /// Drop a frame from the cache, optionally flushing first. Used after
    /// merge reclamation to discard superseded base pages without writing
    /// stale bytes back to disk.
    pub fn discard_page(&mut self, key: &PageKey, flush: bool) -> DbResult<()> {
        if flush {
            self.flush_page(key)?;
        }
        self.frames.remove(key);
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
