use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::common::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};

/// Identity and dirty state of whichever page currently occupies a frame.
/// Kept under one mutex so a frame can never be observed bound to a page
/// with the previous occupant's dirty flag.
#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    page_id: PageId,
    is_dirty: bool,
}

/// A slot in the buffer pool: the bytes of one resident page plus the
/// bookkeeping the pool needs to pin, dirty-track, and recycle it.
/// The data RwLock doubles as the page latch.
pub struct FrameHeader {
    /// The frame ID (index in the buffer pool)
    frame_id: FrameId,
    /// Which page occupies the frame, and whether it has unwritten changes
    meta: Mutex<FrameMeta>,
    /// Pin count - number of guards currently holding this frame
    pin_count: AtomicU32,
    /// The actual page data (pub(crate) for page guard access)
    pub(crate) data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl FrameHeader {
    /// Creates an empty frame for the given pool slot.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            meta: Mutex::new(FrameMeta {
                page_id: INVALID_PAGE_ID,
                is_dirty: false,
            }),
            pin_count: AtomicU32::new(0),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    /// Returns the frame ID.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID stored in this frame.
    pub fn page_id(&self) -> PageId {
        self.meta.lock().page_id
    }

    /// Sets the page ID stored in this frame.
    pub fn set_page_id(&self, page_id: PageId) {
        self.meta.lock().page_id = page_id;
    }

    /// True while no page occupies this frame.
    pub fn is_free(&self) -> bool {
        self.page_id() == INVALID_PAGE_ID
    }

    /// Returns the current pin count.
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the new value.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value.
    /// Returns None if the frame was not pinned.
    pub fn unpin(&self) -> Option<u32> {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    /// Returns whether the page has changes not yet written to disk.
    pub fn is_dirty(&self) -> bool {
        self.meta.lock().is_dirty
    }

    /// Sets the dirty flag.
    pub fn set_dirty(&self, dirty: bool) {
        self.meta.lock().is_dirty = dirty;
    }

    /// Binds the frame to a page and fills it with that page's bytes,
    /// leaving the frame clean.
    pub fn load(&self, page_id: PageId, bytes: &[u8]) {
        assert_eq!(bytes.len(), PAGE_SIZE);
        self.data.write().copy_from_slice(bytes);
        let mut meta = self.meta.lock();
        meta.page_id = page_id;
        meta.is_dirty = false;
    }

    /// Copies the frame's bytes out under the shared data latch, so a
    /// concurrent writer finishes before the snapshot is taken.
    pub fn snapshot(&self, out: &mut [u8]) {
        assert_eq!(out.len(), PAGE_SIZE);
        let guard = self.data.read();
        out.copy_from_slice(&**guard);
    }

    /// Returns the frame to its pristine state: unbound, unpinned, clean,
    /// zeroed.
    pub fn reset(&self) {
        {
            let mut meta = self.meta.lock();
            meta.page_id = INVALID_PAGE_ID;
            meta.is_dirty = false;
        }
        self.pin_count.store(0, Ordering::Release);
        self.data.write().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_new_is_free() {
        let frame = FrameHeader::new(FrameId::new(0));
        assert_eq!(frame.frame_id(), FrameId::new(0));
        assert!(frame.is_free());
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_frame_header_pin_unpin() {
        let frame = FrameHeader::new(FrameId::new(0));

        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.pin(), 2);
        assert_eq!(frame.pin_count(), 2);

        assert_eq!(frame.unpin(), Some(1));
        assert_eq!(frame.unpin(), Some(0));
        assert_eq!(frame.unpin(), None);
    }

    #[test]
    fn test_frame_header_dirty() {
        let frame = FrameHeader::new(FrameId::new(0));

        assert!(!frame.is_dirty());
        frame.set_dirty(true);
        assert!(frame.is_dirty());
        frame.set_dirty(false);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_frame_header_load_binds_clean() {
        let frame = FrameHeader::new(FrameId::new(0));
        frame.set_dirty(true);

        let mut bytes = [0u8; PAGE_SIZE];
        bytes[0] = 42;
        bytes[100] = 255;
        frame.load(PageId::new(7), &bytes);

        assert_eq!(frame.page_id(), PageId::new(7));
        assert!(!frame.is_free());
        assert!(!frame.is_dirty());

        let mut out = [0u8; PAGE_SIZE];
        frame.snapshot(&mut out);
        assert_eq!(out[0], 42);
        assert_eq!(out[100], 255);
    }

    #[test]
    fn test_frame_header_reset() {
        let frame = FrameHeader::new(FrameId::new(0));

        let mut bytes = [1u8; PAGE_SIZE];
        frame.load(PageId::new(5), &bytes);
        frame.pin();
        frame.set_dirty(true);

        frame.reset();

        assert!(frame.is_free());
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());

        frame.snapshot(&mut bytes);
        assert_eq!(bytes[0], 0);
    }
}
