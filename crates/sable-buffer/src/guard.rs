//! Latched page guards.
//!
//! A guard is a scoped capability over one buffer-pool page: constructing it
//! pins the page (and, for read/write guards, acquires the page latch);
//! dropping it releases both, on every exit path. Index operations hold
//! guards on the descent path and rely on drop order alone for correctness.

use crate::frame::BufferFrame;
use crate::pool::BufferPool;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use sable_common::page::{PageId, PAGE_SIZE};

/// RAII guard holding a pin and a shared latch on one page.
pub struct ReadPageGuard<'a> {
    pub(crate) frame: &'a BufferFrame,
    pub(crate) page_id: PageId,
    pub(crate) data: RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>,
}

impl<'a> ReadPageGuard<'a> {
    /// Returns the guarded page's ID.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page bytes.
    #[inline]
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }
}

impl Drop for ReadPageGuard<'_> {
    fn drop(&mut self) {
        // The latch (the RwLock guard field) is released after this runs.
        self.frame.unpin();
    }
}

/// RAII guard holding a pin and an exclusive latch on one page.
///
/// Mutable access marks the frame dirty.
pub struct WritePageGuard<'a> {
    pub(crate) frame: &'a BufferFrame,
    pub(crate) page_id: PageId,
    pub(crate) data: RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>,
}

impl<'a> WritePageGuard<'a> {
    /// Returns the guarded page's ID.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page bytes.
    #[inline]
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Returns the page bytes mutably and marks the page dirty.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.frame.set_dirty(true);
        &mut self.data
    }
}

impl Drop for WritePageGuard<'_> {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

/// RAII guard holding only a pin on one page, no latch.
///
/// Used for freshly allocated pages (upgrade to a write guard before
/// initializing them) and by debug walkers that snapshot page bytes.
pub struct BasicPageGuard<'a> {
    pub(crate) pool: &'a BufferPool,
    pub(crate) frame: &'a BufferFrame,
    pub(crate) page_id: PageId,
}

impl<'a> BasicPageGuard<'a> {
    /// Returns the guarded page's ID.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Acquires a transient shared latch and returns the page bytes.
    #[inline]
    pub fn read_data(&self) -> RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.read_data()
    }

    /// Upgrades this guard to a read guard, keeping the pin.
    pub fn upgrade_read(self) -> ReadPageGuard<'a> {
        let frame = self.frame;
        let page_id = self.page_id;
        std::mem::forget(self); // pin carries over to the new guard
        let data = frame.read_data();
        ReadPageGuard {
            frame,
            page_id,
            data,
        }
    }

    /// Upgrades this guard to a write guard, keeping the pin.
    pub fn upgrade_write(self) -> WritePageGuard<'a> {
        let frame = self.frame;
        let page_id = self.page_id;
        std::mem::forget(self); // pin carries over to the new guard
        let data = frame.write_data();
        WritePageGuard {
            frame,
            page_id,
            data,
        }
    }

    /// Returns the owning buffer pool.
    #[inline]
    pub fn pool(&self) -> &'a BufferPool {
        self.pool
    }
}

impl Drop for BasicPageGuard<'_> {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::{BufferPool, BufferPoolConfig};

    fn pool(frames: usize) -> BufferPool {
        BufferPool::new(BufferPoolConfig { num_frames: frames })
    }

    #[test]
    fn test_read_guard_releases_pin_on_drop() {
        let pool = pool(4);
        let pid = pool.allocate_page().unwrap().page_id();

        {
            let guard = pool.fetch_read(pid).unwrap();
            assert_eq!(guard.page_id(), pid);
        }

        // Only the allocation-era pin has been released; fetch pins again.
        let guard = pool.fetch_read(pid).unwrap();
        drop(guard);
        assert!(pool.contains(pid));
    }

    #[test]
    fn test_write_guard_marks_dirty() {
        let pool = pool(4);
        let pid = pool.allocate_page().unwrap().page_id();

        {
            let mut guard = pool.fetch_write(pid).unwrap();
            guard.data_mut()[0] = 0xAB;
        }

        let guard = pool.fetch_read(pid).unwrap();
        assert_eq!(guard.data()[0], 0xAB);
    }

    #[test]
    fn test_multiple_read_guards_coexist() {
        let pool = pool(4);
        let pid = pool.allocate_page().unwrap().page_id();

        let g1 = pool.fetch_read(pid).unwrap();
        let g2 = pool.fetch_read(pid).unwrap();
        assert_eq!(g1.data()[0], g2.data()[0]);
    }

    #[test]
    fn test_basic_guard_upgrade_write() {
        let pool = pool(4);
        let basic = pool.allocate_page().unwrap();
        let pid = basic.page_id();

        let mut write = basic.upgrade_write();
        write.data_mut()[7] = 9;
        drop(write);

        let read = pool.fetch_read(pid).unwrap();
        assert_eq!(read.data()[7], 9);
    }

    #[test]
    fn test_basic_guard_upgrade_read() {
        let pool = pool(4);
        let basic = pool.allocate_page().unwrap();
        let pid = basic.page_id();

        let read = basic.upgrade_read();
        assert_eq!(read.page_id(), pid);
    }

    #[test]
    fn test_write_guard_blocks_writer_on_other_thread() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let pool = Arc::new(pool(4));
        let pid = pool.allocate_page().unwrap().page_id();

        let guard = pool.fetch_write(pid).unwrap();
        let entered = Arc::new(AtomicBool::new(false));

        let handle = {
            let pool = Arc::clone(&pool);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                let _guard = pool.fetch_write(pid).unwrap();
                entered.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        drop(guard);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
