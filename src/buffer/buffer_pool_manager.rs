use std::collections::{HashMap, LinkedList};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{FrameId, KarstError, PageId, Result, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::page_guard::ReleaseCallback;
use super::{BasicPageGuard, FrameHeader, LruKReplacer, ReadPageGuard, WritePageGuard};

/// Bookkeeping serialized by the pool mutex
struct PoolInner {
    /// Page table: maps page IDs to frame IDs
    page_table: HashMap<PageId, FrameId>,
    /// Free list: frames that are not currently in use
    free_list: LinkedList<FrameId>,
}

/// State shared between the manager and its page guards
struct BufferPoolState {
    /// The buffer pool frames
    frames: Vec<Arc<FrameHeader>>,
    /// Page table and free list under one mutex; every public pool
    /// operation holds it end to end, disk I/O included, so a frame can
    /// never be pinned and evicted at the same time
    inner: Mutex<PoolInner>,
    /// LRU-K replacer for eviction decisions, consulted only under the
    /// pool mutex
    replacer: LruKReplacer,
}

impl BufferPoolState {
    /// Shared unpin path used by guard release callbacks and the public
    /// API. ORs the dirty flag into the frame; a pin count reaching zero
    /// makes the frame evictable. Returns false if the page is not
    /// resident or was already unpinned.
    fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.as_usize()];
            if is_dirty {
                frame.set_dirty(true);
            }
            match frame.unpin() {
                Some(0) => {
                    self.replacer.set_evictable(frame_id, true);
                    true
                }
                Some(_) => true,
                None => false,
            }
        } else {
            false
        }
    }
}

/// BufferPoolManager hands out pinned, latchable views of database pages,
/// reading them from disk and writing them back as frames are recycled.
/// It manages a fixed number of frames and uses the LRU-K replacement
/// policy to decide which pages to evict.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    /// Shared state
    state: Arc<BufferPoolState>,
    /// Disk scheduler for page I/O
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given pool size, k value
    /// for LRU-K, and disk manager.
    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = LinkedList::new();

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let state = Arc::new(BufferPoolState {
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list,
            }),
            replacer: LruKReplacer::new(replacer_k, pool_size),
        });

        Self {
            pool_size,
            state,
            disk_scheduler: DiskScheduler::new(disk_manager),
        }
    }

    /// Allocates a fresh page id and binds a zeroed frame to it with pin
    /// count 1, non-evictable. The caller releases the pin with
    /// `unpin_page` (guards taken in between stack further pins on top).
    pub fn new_page(&self) -> Result<PageId> {
        let mut inner = self.state.inner.lock();
        let frame_id = self.acquire_frame(&mut inner)?;
        let frame = &self.state.frames[frame_id.as_usize()];

        let page_id = self.disk_scheduler.disk_manager().allocate_page()?;

        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();

        inner.page_table.insert(page_id, frame_id);

        self.state.replacer.record_access(frame_id);

        Ok(page_id)
    }

    /// Allocates a fresh page and returns it pinned (pin count 1,
    /// non-evictable), without a latch. Upgrade the guard for data access.
    pub fn new_page_guarded(&self) -> Result<BasicPageGuard> {
        let mut inner = self.state.inner.lock();
        let frame_id = self.acquire_frame(&mut inner)?;
        let frame = &self.state.frames[frame_id.as_usize()];

        let page_id = self.disk_scheduler.disk_manager().allocate_page()?;

        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();

        inner.page_table.insert(page_id, frame_id);

        self.state.replacer.record_access(frame_id);

        Ok(BasicPageGuard::new(
            page_id,
            Arc::clone(frame),
            self.release_callback(),
        ))
    }

    /// Fetches a page and returns it pinned without a latch.
    pub fn fetch_page_basic(&self, page_id: PageId) -> Result<BasicPageGuard> {
        let frame_id = self.pin_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(BasicPageGuard::new(page_id, frame, self.release_callback()))
    }

    /// Fetches a page for shared access. Blocks until the page's read
    /// latch is available.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        let frame_id = self.pin_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        let guard = unsafe { ReadPageGuard::new(page_id, frame, self.release_callback()) };
        Ok(guard)
    }

    /// Fetches a page for exclusive access. Blocks until the page's write
    /// latch is available.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        let frame_id = self.pin_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        let guard = unsafe { WritePageGuard::new(page_id, frame, self.release_callback()) };
        Ok(guard)
    }

    /// Decrements a page's pin count, ORing in the dirty flag. Returns
    /// false if the page is not resident or was already unpinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.state.unpin_page(page_id, is_dirty)
    }

    /// Flushes a specific page to disk and clears its dirty flag.
    /// Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(KarstError::InvalidPageId(page_id));
        }

        let inner = self.state.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];

            // The snapshot takes the frame's shared data latch, so a
            // concurrent writer finishes before the bytes are captured
            let mut data = [0u8; PAGE_SIZE];
            frame.snapshot(&mut data);

            self.disk_scheduler.schedule_write_sync(page_id, &data)?;

            frame.set_dirty(false);

            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Flushes every dirty resident page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let inner = self.state.inner.lock();

        for (&page_id, &frame_id) in inner.page_table.iter() {
            let frame = &self.state.frames[frame_id.as_usize()];

            if frame.is_dirty() {
                let mut data = [0u8; PAGE_SIZE];
                frame.snapshot(&mut data);

                self.disk_scheduler.schedule_write_sync(page_id, &data)?;
                frame.set_dirty(false);
            }
        }

        Ok(())
    }

    /// Drops a page from the buffer pool. Returns true if the page was
    /// deleted or was not resident to begin with; false if it is still
    /// pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.state.inner.lock();

        if let Some(frame_id) = inner.page_table.remove(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];

            if frame.pin_count() > 0 {
                inner.page_table.insert(page_id, frame_id);
                return Ok(false);
            }

            frame.reset();
            self.state.replacer.remove(frame_id);
            inner.free_list.push_back(frame_id);

            self.disk_scheduler
                .disk_manager()
                .deallocate_page(page_id)?;
        }

        Ok(true)
    }

    /// Returns the pin count for a resident page.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.state.inner.lock();

        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    /// Returns the pool size.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.state.inner.lock().free_list.len()
    }

    /// Returns the underlying disk manager.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.disk_scheduler.disk_manager()
    }

    fn release_callback(&self) -> ReleaseCallback {
        let state = Arc::clone(&self.state);
        Box::new(move |page_id, is_dirty| {
            state.unpin_page(page_id, is_dirty);
        })
    }

    /// Pins the page into a frame, reading it from disk if it is not
    /// already resident, and returns the frame ID.
    fn pin_page(&self, page_id: PageId) -> Result<FrameId> {
        if page_id == INVALID_PAGE_ID {
            return Err(KarstError::InvalidPageId(page_id));
        }

        let mut inner = self.state.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];
            frame.pin();
            self.state.replacer.record_access(frame_id);
            self.state.replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.acquire_frame(&mut inner)?;
        let frame = &self.state.frames[frame_id.as_usize()];

        let mut data = [0u8; PAGE_SIZE];
        self.disk_scheduler.schedule_read_sync(page_id, &mut data)?;

        frame.load(page_id, &data);
        frame.pin();

        inner.page_table.insert(page_id, frame_id);

        self.state.replacer.record_access(frame_id);

        Ok(frame_id)
    }

    /// Gets a frame to bind, either from the free list or by evicting a
    /// victim. A dirty victim is written back before the frame is reused.
    /// Caller holds the pool mutex.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        if let Some(frame_id) = self.state.replacer.evict() {
            let frame = &self.state.frames[frame_id.as_usize()];
            let old_page_id = frame.page_id();

            if frame.is_dirty() {
                let mut data = [0u8; PAGE_SIZE];
                frame.snapshot(&mut data);
                self.disk_scheduler
                    .schedule_write_sync(old_page_id, &data)?;
            }

            inner.page_table.remove(&old_page_id);

            frame.reset();

            Ok(frame_id)
        } else {
            Err(KarstError::BufferPoolFull)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = BufferPoolManager::new(pool_size, 2, dm);
        (bpm, temp_file)
    }

    #[test]
    fn test_buffer_pool_manager_new() {
        let (bpm, _temp) = create_bpm(10);
        assert_eq!(bpm.pool_size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_buffer_pool_manager_new_page() {
        let (bpm, _temp) = create_bpm(10);

        // A fresh page comes back already pinned
        let page_id = bpm.new_page().unwrap();
        assert_eq!(page_id, PageId::new(0));
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);

        assert!(bpm.unpin_page(page_id, false));
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
    }

    #[test]
    fn test_buffer_pool_manager_new_page_guarded() {
        let (bpm, _temp) = create_bpm(10);

        let guard = bpm.new_page_guarded().unwrap();
        let page_id = guard.page_id();
        assert_eq!(bpm.get_pin_count(page_id), Some(1));

        drop(guard);
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
    }

    #[test]
    fn test_buffer_pool_manager_read_write() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();
        bpm.unpin_page(page_id, false);

        {
            let mut guard = bpm.fetch_page_write(page_id).unwrap();
            guard.data_mut()[0] = 42;
            guard.data_mut()[100] = 255;
        }

        assert_eq!(bpm.get_pin_count(page_id), Some(0));

        {
            let guard = bpm.fetch_page_read(page_id).unwrap();
            assert_eq!(guard.data()[0], 42);
            assert_eq!(guard.data()[100], 255);
        }
    }

    #[test]
    fn test_buffer_pool_manager_unpin_page() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();
        assert_eq!(bpm.get_pin_count(page_id), Some(1));

        assert!(bpm.unpin_page(page_id, false));
        // Already unpinned
        assert!(!bpm.unpin_page(page_id, false));

        let guard = bpm.fetch_page_basic(page_id).unwrap();
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
        drop(guard);
        assert_eq!(bpm.get_pin_count(page_id), Some(0));

        // Unknown page
        assert!(!bpm.unpin_page(PageId::new(999), false));
    }

    #[test]
    fn test_buffer_pool_manager_flush() {
        let (bpm, temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();
        bpm.unpin_page(page_id, false);

        {
            let mut guard = bpm.fetch_page_write(page_id).unwrap();
            guard.data_mut()[0] = 42;
        }

        bpm.flush_page(page_id).unwrap();

        drop(bpm);

        let dm = Arc::new(DiskManager::new(temp.path()).unwrap());
        let bpm2 = BufferPoolManager::new(10, 2, dm);

        let guard = bpm2.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
    }

    #[test]
    fn test_buffer_pool_manager_eviction_writes_back() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = BufferPoolManager::new(1, 1, Arc::clone(&dm));

        let p0 = bpm.new_page().unwrap();
        {
            let mut guard = bpm.fetch_page_write(p0).unwrap();
            guard.data_mut()[0] = 0xAB;
        }
        bpm.unpin_page(p0, true);

        // Single frame: allocating the next page must evict p0, and the
        // dirty contents must hit the disk before the frame is reused
        let p1 = bpm.new_page().unwrap();
        assert_ne!(p0, p1);

        let mut data = [0u8; PAGE_SIZE];
        dm.read_page(p0, &mut data).unwrap();
        assert_eq!(data[0], 0xAB);
    }

    #[test]
    fn test_buffer_pool_manager_buffer_pool_full() {
        let (bpm, _temp) = create_bpm(2);

        // Both frames hold their allocation pin
        let _page_id1 = bpm.new_page().unwrap();
        let _page_id2 = bpm.new_page().unwrap();

        assert!(matches!(bpm.new_page(), Err(KarstError::BufferPoolFull)));
        assert!(matches!(
            bpm.fetch_page_read(PageId::new(99)),
            Err(KarstError::BufferPoolFull)
        ));
    }

    #[test]
    fn test_buffer_pool_manager_delete_page() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();

        // The allocation pin alone blocks deletion
        assert!(!bpm.delete_page(page_id).unwrap());
        assert!(bpm.unpin_page(page_id, false));

        {
            let _guard = bpm.fetch_page_read(page_id).unwrap();
            assert!(!bpm.delete_page(page_id).unwrap());
        }

        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.get_pin_count(page_id), None);

        // Deleting an absent page is idempotent
        assert!(bpm.delete_page(page_id).unwrap());
    }
}
