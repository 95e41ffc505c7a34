use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{RecordId, Result, INVALID_PAGE_ID};

use super::btree_page::LeafNodeRef;

/// Forward iterator over the tree's leaf chain in ascending key order.
///
/// Holds a read latch (and pin) on the current leaf. Crossing to the next
/// leaf releases the current latch before acquiring the next one, so an
/// iterator never holds two leaf latches at once. The crossing happens
/// eagerly, as soon as a leaf's last slot is consumed: whenever the
/// iterator is live (`!is_end()`), its slot points at a real entry, so
/// `get()` always has a pair to return.
pub struct BPlusTreeIterator {
    bpm: Arc<BufferPoolManager>,
    guard: Option<ReadPageGuard>,
    slot: usize,
}

impl BPlusTreeIterator {
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        guard: ReadPageGuard,
        slot: usize,
    ) -> Result<Self> {
        let mut iter = Self {
            bpm,
            guard: Some(guard),
            slot,
        };
        iter.settle()?;
        Ok(iter)
    }

    pub(crate) fn exhausted(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            guard: None,
            slot: 0,
        }
    }

    /// True once the iterator has run off the end of the last leaf.
    pub fn is_end(&self) -> bool {
        self.guard.is_none()
    }

    /// Returns the current pair without advancing, or None at the end.
    pub fn get(&self) -> Option<(u32, RecordId)> {
        let guard = self.guard.as_ref()?;
        let leaf = LeafNodeRef::new(guard.data());
        Some((leaf.key_at(self.slot), leaf.record_at(self.slot)))
    }

    /// Returns the next pair, following the leaf chain as needed.
    pub fn next(&mut self) -> Result<Option<(u32, RecordId)>> {
        let Some(guard) = &self.guard else {
            return Ok(None);
        };
        let leaf = LeafNodeRef::new(guard.data());
        let pair = (leaf.key_at(self.slot), leaf.record_at(self.slot));
        self.slot += 1;
        self.settle()?;
        Ok(Some(pair))
    }

    /// Moves the cursor onto a real entry, or to the true end. Afterwards
    /// either the guard is gone or `slot` indexes a live slot of the held
    /// leaf.
    fn settle(&mut self) -> Result<()> {
        loop {
            let Some(guard) = &self.guard else {
                return Ok(());
            };
            let (size, next_page_id) = {
                let leaf = LeafNodeRef::new(guard.data());
                (leaf.size(), leaf.next_page_id())
            };
            if self.slot < size {
                return Ok(());
            }

            // Release the current leaf before latching the next one
            self.guard = None;
            if next_page_id == INVALID_PAGE_ID {
                return Ok(());
            }
            self.guard = Some(self.bpm.fetch_page_read(next_page_id)?);
            self.slot = 0;
        }
    }
}

impl Iterator for BPlusTreeIterator {
    type Item = Result<(u32, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        match BPlusTreeIterator::next(self) {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
