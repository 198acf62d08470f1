//! Buffer pool manager.

use crate::disk::PageStore;
use crate::frame::{BufferFrame, FrameId};
use crate::hash_table::ExtendibleHashTable;
use crate::replacer::{LruKReplacer, Replacer};
use bramble_common::page::{PageId, PAGE_SIZE};
use bramble_common::{BrambleError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::System;
use tracing::warn;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub pool_size: usize,
    /// K parameter of the LRU-K replacer.
    pub replacer_k: usize,
    /// Bucket capacity of the page table.
    pub bucket_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1024,
            replacer_k: 2,
            bucket_size: 4,
        }
    }
}

/// Buffer pool manager.
///
/// Owns a fixed array of page frames and mediates between callers and the
/// page store:
/// - page id to frame id mapping through an extendible hash table
/// - free frame list for pages entering the pool
/// - LRU-K replacement for eviction
/// - pin counting on every resident frame
///
/// Every public operation runs under a single coarse latch; the page table
/// and replacer take their own latches strictly underneath it. Frame
/// metadata is atomic, so a pinned frame stays readable after the latch is
/// released.
pub struct BufferPoolManager {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page ID to frame ID mapping.
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Page replacement policy.
    replacer: LruKReplacer,
    /// List of free frame IDs.
    free_list: Mutex<Vec<FrameId>>,
    /// The page-addressable secondary store.
    store: Arc<dyn PageStore>,
    /// Coarse latch over every public operation.
    latch: Mutex<()>,
}

impl BufferPoolManager {
    /// Creates a new buffer pool over the given page store.
    pub fn new(config: BufferPoolConfig, store: Arc<dyn PageStore>) -> Self {
        let pool_size = config.pool_size;
        assert!(pool_size > 0, "pool_size must be > 0");

        let frames: Vec<_> = (0..pool_size).map(|_| BufferFrame::new()).collect();

        // All frames start in the free list.
        let free_list: Vec<_> = (0..pool_size).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            replacer: LruKReplacer::new(pool_size, config.replacer_k),
            page_table: ExtendibleHashTable::new(config.bucket_size),
            config,
            frames,
            free_list: Mutex::new(free_list),
            store,
            latch: Mutex::new(()),
        }
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames to ensure useful caching even on low-memory
    /// systems.
    pub fn auto_sized(store: Arc<dyn PageStore>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let pool_size = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(
            BufferPoolConfig {
                pool_size,
                ..Default::default()
            },
            store,
        )
    }

    /// Returns the number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Checks if a page is resident in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.contains(&page_id)
    }

    /// Finds a frame for a new resident page.
    ///
    /// Pops the free list if possible, otherwise asks the replacer for a
    /// victim, writing the victim back first when dirty. The write-back
    /// happens before the page table forgets the victim's page id.
    fn acquire_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Ok(frame_id);
        }

        let Some(victim) = self.replacer.evict() else {
            return Err(BrambleError::BufferPoolFull);
        };
        let frame = &self.frames[victim.0 as usize];

        if frame.is_dirty() {
            if let Some(page_id) = frame.page_id() {
                let data = frame.read_data();
                self.store.write_page(page_id, &data[..])?;
            }
            frame.set_dirty(false);
        }
        if let Some(old_page_id) = frame.page_id() {
            self.page_table.remove(&old_page_id);
        }

        Ok(victim)
    }

    /// Allocates a fresh page and pins it into a frame.
    ///
    /// The frame is zeroed, registered in the page table, recorded with
    /// the replacer, and held non-evictable with pin count 1. Fails with
    /// `BufferPoolFull` when every frame is pinned.
    pub fn new_page(&self) -> Result<(PageId, &BufferFrame)> {
        let _guard = self.latch.lock();

        let frame_id = self.acquire_frame()?;
        let page_id = match self.store.allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                self.frames[frame_id.0 as usize].reset();
                self.free_list.lock().push(frame_id);
                return Err(e);
            }
        };

        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        frame.set_page_id(Some(page_id));
        frame.pin();

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        Ok((page_id, frame))
    }

    /// Fetches a page, pinning it.
    ///
    /// A resident page is pinned in place; otherwise a frame is acquired
    /// and the page's bytes are read from the store. Fails with
    /// `BufferPoolFull` when the page is not resident and every frame is
    /// pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&BufferFrame> {
        let _guard = self.latch.lock();

        if let Some(frame_id) = self.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);
            return Ok(frame);
        }

        let frame_id = self.acquire_frame()?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();

        {
            let mut data = frame.write_data();
            if let Err(e) = self.store.read_page(page_id, &mut data[..]) {
                drop(data);
                frame.reset();
                self.free_list.lock().push(frame_id);
                return Err(e);
            }
        }

        frame.set_page_id(Some(page_id));
        frame.pin();
        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        Ok(frame)
    }

    /// Unpins a page, OR-combining the caller's dirty flag into the frame.
    ///
    /// The dirty flag is sticky: it is cleared only by flush or eviction
    /// write-back, never by `unpin_page(_, false)`. When the pin count
    /// reaches zero the frame becomes evictable. Returns false if the page
    /// is not resident or its pin count is already zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _guard = self.latch.lock();

        let Some(frame_id) = self.page_table.get(&page_id) else {
            warn!(%page_id, "unpin of non-resident page");
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.pin_count() == 0 {
            warn!(%page_id, "unpin of page with zero pin count");
            return false;
        }

        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Writes a resident page back to the store unconditionally and clears
    /// its dirty flag. The pin count is unchanged. Returns `Ok(false)` if
    /// the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let _guard = self.latch.lock();
        self.flush_resident(page_id)
    }

    fn flush_resident(&self, page_id: PageId) -> Result<bool> {
        let Some(frame_id) = self.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[frame_id.0 as usize];
        {
            let data = frame.read_data();
            self.store.write_page(page_id, &data[..])?;
        }
        frame.set_dirty(false);
        Ok(true)
    }

    /// Flushes every resident page.
    pub fn flush_all(&self) -> Result<()> {
        let _guard = self.latch.lock();

        for frame in &self.frames {
            if let Some(page_id) = frame.page_id() {
                self.flush_resident(page_id)?;
            }
        }
        Ok(())
    }

    /// Drops a page from the pool and returns its id to the store's
    /// freelist.
    ///
    /// A non-resident page deletes trivially; a pinned page cannot be
    /// deleted. Dirty content is discarded, not written back: a caller
    /// that wants the bytes durable must flush before deleting.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let _guard = self.latch.lock();

        let Some(frame_id) = self.page_table.get(&page_id) else {
            return true;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.is_pinned() {
            return false;
        }

        self.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        frame.reset();
        self.free_list.lock().push(frame_id);
        self.store.deallocate_page(page_id);
        true
    }

    /// Returns a read guard for a page; the page stays pinned until the
    /// guard drops.
    pub fn read_page(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(PageReadGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Returns a write guard for a page; the page stays pinned until the
    /// guard drops.
    pub fn write_page(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(PageWriteGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut used_frames = 0;
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;

        for frame in &self.frames {
            if frame.page_id().is_some() {
                used_frames += 1;
                if frame.is_pinned() {
                    pinned_frames += 1;
                }
                if frame.is_dirty() {
                    dirty_frames += 1;
                }
            }
        }

        BufferPoolStats {
            total_frames: self.config.pool_size,
            free_frames: self.free_count(),
            used_frames,
            pinned_frames,
            dirty_frames,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

/// RAII guard for reading a page.
pub struct PageReadGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageReadGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, [u8; PAGE_SIZE]> {
        self.frame.read_data()
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, false);
    }
}

/// RAII guard for writing a page.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageWriteGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns mutable access to page data.
    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'_, [u8; PAGE_SIZE]> {
        self.frame.write_data()
    }

    /// Marks the page as dirty.
    pub fn set_dirty(&self) {
        self.frame.set_dirty(true);
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.frame.is_dirty());
    }
}
