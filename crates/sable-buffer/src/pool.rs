//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::guard::{BasicPageGuard, ReadPageGuard, WritePageGuard};
use crate::page_table::PageTable;
use crate::replacer::ClockReplacer;
use parking_lot::Mutex;
use sable_common::page::{PageId, PAGE_SIZE};
use sable_common::{Result, SableError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use sysinfo::System;

/// Information about a dirty page that was evicted from the buffer pool.
/// The storage layer must write this to disk to prevent data loss.
#[derive(Debug)]
pub struct EvictedPage {
    pub page_id: PageId,
    pub data: Box<[u8; PAGE_SIZE]>,
}

/// Configuration for the buffer pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping (lock-free page table)
/// - Monotone page id allocation and a free frame list
/// - Clock replacement for eviction
/// - Pin counting for concurrent access
/// - Latched guard hand-out (`fetch_read` / `fetch_write` / `fetch_basic`)
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page ID to frame ID mapping (lock-free reads).
    page_table: PageTable,
    /// List of free frame IDs.
    free_list: Mutex<Vec<FrameId>>,
    /// Page replacement policy.
    replacer: ClockReplacer,
    /// Next page id to hand out. Ids are never reused, so a stale id held
    /// by a scan after a merge misses the page table instead of aliasing
    /// a new page.
    next_page_id: AtomicU32,
    /// Dirty pages evicted to make room, awaiting flush by the caller.
    evicted: Mutex<Vec<EvictedPage>>,
}

impl BufferPool {
    /// Creates a new buffer pool.
    pub fn new(config: BufferPoolConfig) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        // All frames start in the free list
        let free_list: Vec<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            page_table: PageTable::new(num_frames),
            free_list: Mutex::new(free_list),
            replacer: ClockReplacer::new(num_frames),
            next_page_id: AtomicU32::new(0),
            evicted: Mutex::new(Vec::new()),
        }
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames to ensure useful caching even on low-memory
    /// systems.
    pub fn auto_sized() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4; // 25% of available RAM
        let num_frames = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(BufferPoolConfig { num_frames })
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Checks if a page is in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.contains(page_id)
    }

    /// Looks up and pins the frame holding `page_id`.
    ///
    /// The pin is only provisional: the frame may be evicted and reused
    /// between the table lookup and the pin landing, so callers must
    /// re-validate `frame.page_id()` (under the data latch for latched
    /// guards) and back out on a mismatch.
    #[inline(always)]
    fn fetch_frame(&self, page_id: PageId) -> Result<&BufferFrame> {
        if !page_id.is_valid() {
            return Err(SableError::PageNotFound { page_id });
        }
        let frame_id = self
            .page_table
            .get(page_id)
            .ok_or(SableError::PageNotFound { page_id })?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.pin();
        self.replacer.record_access(frame_id);
        Ok(frame)
    }

    /// Pins `page_id` and acquires its latch in shared mode.
    ///
    /// The returned guard releases the latch and the pin on drop.
    pub fn fetch_read(&self, page_id: PageId) -> Result<ReadPageGuard<'_>> {
        let frame = self.fetch_frame(page_id)?;
        let data = frame.read_data();
        if frame.page_id() != Some(page_id) {
            drop(data);
            frame.unpin();
            return Err(SableError::PageNotFound { page_id });
        }
        Ok(ReadPageGuard {
            frame,
            page_id,
            data,
        })
    }

    /// Pins `page_id` and acquires its latch in exclusive mode.
    pub fn fetch_write(&self, page_id: PageId) -> Result<WritePageGuard<'_>> {
        let frame = self.fetch_frame(page_id)?;
        let data = frame.write_data();
        if frame.page_id() != Some(page_id) {
            drop(data);
            frame.unpin();
            return Err(SableError::PageNotFound { page_id });
        }
        Ok(WritePageGuard {
            frame,
            page_id,
            data,
        })
    }

    /// Pins `page_id` without latching it.
    pub fn fetch_basic(&self, page_id: PageId) -> Result<BasicPageGuard<'_>> {
        let frame = self.fetch_frame(page_id)?;
        if frame.page_id() != Some(page_id) {
            frame.unpin();
            return Err(SableError::PageNotFound { page_id });
        }
        Ok(BasicPageGuard {
            pool: self,
            frame,
            page_id,
        })
    }

    /// Allocates a frame for a new page and pins it.
    ///
    /// Tries the free list first, then evicts. Eviction claims the victim
    /// atomically (pin 0 -> 1), so no fetcher or second allocator can
    /// walk away with the same frame; a dirty victim's bytes are captured
    /// into the evicted queue for the caller to flush. Either way the
    /// returned frame is empty, zeroed, and pinned once.
    fn allocate_frame(&self) -> Result<&BufferFrame> {
        {
            let mut free_list = self.free_list.lock();
            if let Some(frame_id) = free_list.pop() {
                // Free frames are already reset; empty frames are invisible
                // to eviction, so pinning here cannot race a claim.
                let frame = &self.frames[frame_id.0 as usize];
                frame.pin();
                return Ok(frame);
            }
        }

        let victim_id = self
            .replacer
            .evict(|fid| self.frames[fid.0 as usize].try_claim());

        if let Some(victim_id) = victim_id {
            let frame = &self.frames[victim_id.0 as usize];

            // Capture evicted page data if dirty
            if frame.is_dirty() {
                if let Some(page_id) = frame.page_id() {
                    let data_guard = frame.read_data();
                    let mut data = Box::new([0u8; PAGE_SIZE]);
                    data.copy_from_slice(&**data_guard);
                    drop(data_guard);
                    self.evicted.lock().push(EvictedPage { page_id, data });
                }
            }

            // Remove old page from page table, then wipe. The wipe waits
            // out any reader that validated the old page under its latch.
            if let Some(old_page_id) = frame.page_id() {
                self.page_table.remove(old_page_id);
            }
            frame.reset();

            return Ok(frame);
        }

        Err(SableError::BufferPoolFull)
    }

    /// Allocates a fresh page and returns a pin-only guard over it.
    ///
    /// The page bytes are zeroed. Upgrade to a write guard before
    /// initializing the page contents.
    pub fn allocate_page(&self) -> Result<BasicPageGuard<'_>> {
        let page_id = PageId(self.next_page_id.fetch_add(1, Ordering::AcqRel));
        let frame = self.allocate_frame()?;

        frame.set_page_id(Some(page_id));
        self.page_table.insert(page_id, frame.frame_id());

        // The allocation pin is handed to the guard.
        Ok(BasicPageGuard {
            pool: self,
            frame,
            page_id,
        })
    }

    /// Returns a page's frame to the free list.
    ///
    /// Returns false and leaves the page cached if it is still pinned
    /// (for example by a scan that raced the structural change); such a
    /// page will eventually fall out through normal eviction. The page id
    /// itself is never reused.
    pub fn deallocate_page(&self, page_id: PageId) -> bool {
        let Some(frame_id) = self.page_table.get(page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];

        if !frame.try_claim() {
            return false;
        }
        if frame.page_id() != Some(page_id) {
            // The frame was recycled under us; the claim hit its new page.
            frame.unpin();
            return false;
        }

        self.page_table.remove(page_id);
        self.replacer.remove(frame_id);
        frame.reset();
        frame.unpin();
        self.free_list.lock().push(frame_id);
        true
    }

    /// Drains the queue of dirty pages evicted since the last call.
    ///
    /// The storage layer is responsible for writing these out.
    pub fn drain_evicted(&self) -> Vec<EvictedPage> {
        std::mem::take(&mut *self.evicted.lock())
    }

    /// Flushes a page to the provided callback.
    ///
    /// The callback receives the page data if the page is dirty.
    /// Returns true if the page was flushed.
    pub fn flush_page<F>(&self, page_id: PageId, mut flush_fn: F) -> Result<bool>
    where
        F: FnMut(PageId, &[u8]) -> Result<()>,
    {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            if frame.is_dirty() {
                let data = frame.read_data();
                flush_fn(page_id, &**data)?;
                frame.set_dirty(false);
                return Ok(true);
            }
            return Ok(false);
        }
        Ok(false)
    }

    /// Flushes all dirty pages.
    ///
    /// Returns the number of pages flushed.
    pub fn flush_all<F>(&self, mut flush_fn: F) -> Result<usize>
    where
        F: FnMut(PageId, &[u8]) -> Result<()>,
    {
        let mut flushed = 0;
        let mut flush_error: Option<SableError> = None;

        // Collect dirty pages first to avoid holding guards during flush
        let mut dirty_pages = Vec::new();
        self.page_table.for_each(|page_id, frame_id| {
            dirty_pages.push((page_id, frame_id));
            true
        });

        for (page_id, frame_id) in dirty_pages {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                let data = frame.read_data();
                if let Err(e) = flush_fn(page_id, &**data) {
                    flush_error = Some(e);
                    break;
                }
                frame.set_dirty(false);
                flushed += 1;
            }
        }

        match flush_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned_count = 0;
        let mut dirty_count = 0;

        self.page_table.for_each(|_, frame_id| {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_count += 1;
            }
            if frame.is_dirty() {
                dirty_count += 1;
            }
            true
        });

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            used_frames: self.page_table.len(),
            pinned_frames: pinned_count,
            dirty_frames: dirty_count,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_pool(num_frames: usize) -> BufferPool {
        BufferPool::new(BufferPoolConfig { num_frames })
    }

    #[test]
    fn test_buffer_pool_new() {
        let pool = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn test_buffer_pool_allocate_page() {
        let pool = create_test_pool(10);

        let guard = pool.allocate_page().unwrap();
        let page_id = guard.page_id();
        drop(guard);

        assert_eq!(pool.free_count(), 9);
        assert_eq!(pool.page_count(), 1);
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_allocates_distinct_ids() {
        let pool = create_test_pool(10);

        let a = pool.allocate_page().unwrap().page_id();
        let b = pool.allocate_page().unwrap().page_id();
        let c = pool.allocate_page().unwrap().page_id();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_buffer_pool_fetch_nonexistent() {
        let pool = create_test_pool(10);

        let result = pool.fetch_read(PageId::new(12345));
        assert!(matches!(result, Err(SableError::PageNotFound { .. })));
    }

    #[test]
    fn test_buffer_pool_fetch_invalid() {
        let pool = create_test_pool(10);

        let result = pool.fetch_read(PageId::INVALID);
        assert!(matches!(result, Err(SableError::PageNotFound { .. })));
    }

    #[test]
    fn test_buffer_pool_read_after_write() {
        let pool = create_test_pool(10);
        let page_id = pool.allocate_page().unwrap().page_id();

        {
            let mut guard = pool.fetch_write(page_id).unwrap();
            guard.data_mut()[0] = 0xFF;
        }

        let guard = pool.fetch_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 0xFF);
    }

    #[test]
    fn test_buffer_pool_eviction() {
        let pool = create_test_pool(3);

        // Fill the pool with unpinned pages
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(pool.allocate_page().unwrap().page_id());
        }

        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.page_count(), 3);

        // Allocating one more evicts a clean page
        let new_id = pool.allocate_page().unwrap().page_id();

        assert_eq!(pool.page_count(), 3);
        assert!(pool.contains(new_id));
        assert!(pool.drain_evicted().is_empty());
    }

    #[test]
    fn test_buffer_pool_eviction_dirty() {
        let pool = create_test_pool(1);

        let first = pool.allocate_page().unwrap().page_id();
        {
            let mut guard = pool.fetch_write(first).unwrap();
            guard.data_mut()[0] = 0xAB;
        }

        // Allocating another page must evict the dirty one
        let _second = pool.allocate_page().unwrap().page_id();

        let evicted = pool.drain_evicted();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].page_id, first);
        assert_eq!(evicted[0].data[0], 0xAB);
    }

    #[test]
    fn test_buffer_pool_full_all_pinned() {
        let pool = create_test_pool(2);

        // Keep both pages pinned through their guards
        let _g1 = pool.allocate_page().unwrap();
        let _g2 = pool.allocate_page().unwrap();

        let result = pool.allocate_page();
        assert!(matches!(result, Err(SableError::BufferPoolFull)));
    }

    #[test]
    fn test_buffer_pool_deallocate_page() {
        let pool = create_test_pool(10);
        let page_id = pool.allocate_page().unwrap().page_id();

        assert!(pool.contains(page_id));
        assert!(pool.deallocate_page(page_id));
        assert!(!pool.contains(page_id));
        assert_eq!(pool.free_count(), 10);

        // The id is gone for good
        assert!(pool.fetch_read(page_id).is_err());
    }

    #[test]
    fn test_buffer_pool_deallocate_pinned_page() {
        let pool = create_test_pool(10);
        let guard = pool.allocate_page().unwrap();
        let page_id = guard.page_id();

        assert!(!pool.deallocate_page(page_id));
        assert!(pool.contains(page_id));

        drop(guard);
        assert!(pool.deallocate_page(page_id));
    }

    #[test]
    fn test_buffer_pool_flush_page() {
        let pool = create_test_pool(10);
        let page_id = pool.allocate_page().unwrap().page_id();

        {
            let mut guard = pool.fetch_write(page_id).unwrap();
            guard.data_mut()[0] = 1;
        }

        let mut flushed_pages = vec![];
        let result = pool.flush_page(page_id, |pid, _data| {
            flushed_pages.push(pid);
            Ok(())
        });

        assert!(result.unwrap());
        assert_eq!(flushed_pages, vec![page_id]);

        // Page should no longer be dirty
        let result = pool.flush_page(page_id, |_, _| Ok(())).unwrap();
        assert!(!result);
    }

    #[test]
    fn test_buffer_pool_flush_all() {
        let pool = create_test_pool(10);

        for _ in 0..5 {
            let page_id = pool.allocate_page().unwrap().page_id();
            let mut guard = pool.fetch_write(page_id).unwrap();
            guard.data_mut()[0] = 1;
        }

        let mut flushed_count = 0;
        let result = pool.flush_all(|_pid, _data| {
            flushed_count += 1;
            Ok(())
        });

        assert_eq!(result.unwrap(), 5);
        assert_eq!(flushed_count, 5);
    }

    #[test]
    fn test_buffer_pool_stats() {
        let pool = create_test_pool(10);

        let pinned = pool.allocate_page().unwrap();
        let dirty_id = pool.allocate_page().unwrap().page_id();
        {
            let mut guard = pool.fetch_write(dirty_id).unwrap();
            guard.data_mut()[0] = 1;
        }

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.free_frames, 8);
        assert_eq!(stats.used_frames, 2);
        assert_eq!(stats.pinned_frames, 1);
        assert_eq!(stats.dirty_frames, 1);

        drop(pinned);
    }

    #[test]
    fn test_buffer_pool_fresh_page_is_zeroed() {
        let pool = create_test_pool(2);

        // Dirty a page, drop it, force eviction, then verify the reused
        // frame comes back zeroed for the new page.
        let first = pool.allocate_page().unwrap().page_id();
        {
            let mut guard = pool.fetch_write(first).unwrap();
            guard.data_mut().fill(0xEE);
        }
        let _second = pool.allocate_page().unwrap().page_id();
        let third = pool.allocate_page().unwrap().page_id();

        let guard = pool.fetch_read(third).unwrap();
        assert!(guard.data().iter().all(|&b| b == 0));
    }
}
