use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::FrameHeader;

/// Callback type for releasing a page guard
pub(crate) type ReleaseCallback = Box<dyn FnOnce(PageId, bool) + Send + Sync>;

/// Base page guard that manages the pin and release bookkeeping shared by
/// all guard flavors.
struct PageGuardBase {
    /// The page ID being guarded
    page_id: PageId,
    /// Reference to the frame header (kept alive for the guard's lifetime)
    frame: Arc<FrameHeader>,
    /// Callback to release the guard
    release_callback: Option<ReleaseCallback>,
    /// Whether the page was written through this guard
    is_dirty: bool,
}

impl PageGuardBase {
    fn new(page_id: PageId, frame: Arc<FrameHeader>, release_callback: ReleaseCallback) -> Self {
        Self {
            page_id,
            frame,
            release_callback: Some(release_callback),
            is_dirty: false,
        }
    }

    fn release(&mut self) {
        if let Some(callback) = self.release_callback.take() {
            callback(self.page_id, self.is_dirty);
        }
    }

    /// Takes the parts out of the guard, disarming its release callback.
    fn take_parts(&mut self) -> (PageId, Arc<FrameHeader>, ReleaseCallback) {
        let callback = self
            .release_callback
            .take()
            .expect("guard released twice");
        (self.page_id, Arc::clone(&self.frame), callback)
    }
}

/// RAII guard that holds a pin on a page without latching it. Useful for
/// pages no other thread can reach yet; upgrade to a read or write guard
/// for data access.
pub struct BasicPageGuard {
    base: PageGuardBase,
}

impl BasicPageGuard {
    pub(crate) fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        Self {
            base: PageGuardBase::new(page_id, frame, release_callback),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.base.page_id
    }

    /// Acquires the page's shared latch, converting this guard. The pin is
    /// carried over, not re-taken.
    pub fn upgrade_read(mut self) -> ReadPageGuard {
        let (page_id, frame, callback) = self.base.take_parts();
        unsafe { ReadPageGuard::new(page_id, frame, callback) }
    }

    /// Acquires the page's exclusive latch, converting this guard.
    pub fn upgrade_write(mut self) -> WritePageGuard {
        let (page_id, frame, callback) = self.base.take_parts();
        unsafe { WritePageGuard::new(page_id, frame, callback) }
    }

    /// Drops this guard, releasing the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Drop for BasicPageGuard {
    fn drop(&mut self) {
        self.base.release();
    }
}

/// RAII guard for read-only access to a page.
/// Holds the page's shared latch and unpins the page when dropped.
pub struct ReadPageGuard {
    base: PageGuardBase,
    /// Read lock on the page data
    _data_guard: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>,
}

impl ReadPageGuard {
    /// Creates a new ReadPageGuard, blocking until the shared latch is
    /// available.
    /// # Safety
    /// The caller must ensure the frame outlives this guard; the Arc held
    /// in the base makes the 'static transmute of the lock guard sound.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        let data_guard = frame.data.read();
        let data_guard: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            base: PageGuardBase::new(page_id, frame, release_callback),
            _data_guard: data_guard,
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.base.page_id
    }

    /// Returns a reference to the page data.
    pub fn data(&self) -> &[u8] {
        &self._data_guard[..]
    }

    /// Drops this guard, releasing the latch and the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        self.base.release();
    }
}

/// RAII guard for read-write access to a page.
/// Holds the page's exclusive latch; marks the page dirty when written
/// through and unpins it when dropped.
pub struct WritePageGuard {
    base: PageGuardBase,
    /// Write lock on the page data
    data_guard: Option<RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl WritePageGuard {
    /// Creates a new WritePageGuard, blocking until the exclusive latch is
    /// available.
    /// # Safety
    /// The caller must ensure the frame outlives this guard; the Arc held
    /// in the base makes the 'static transmute of the lock guard sound.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        let data_guard = frame.data.write();
        let data_guard: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            base: PageGuardBase::new(page_id, frame, release_callback),
            data_guard: Some(data_guard),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.base.page_id
    }

    /// Returns a reference to the page data.
    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    /// Returns a mutable reference to the page data and marks the page
    /// dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.base.is_dirty = true;
        &mut self.data_guard.as_mut().unwrap()[..]
    }

    /// Drops this guard, releasing the latch and the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // Release the latch before unpinning
        self.data_guard.take();
        self.base.release();
    }
}
