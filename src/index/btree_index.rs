use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::{BasicPageGuard, BufferPoolManager, WritePageGuard};
use crate::common::{PageId, RecordId, Result, INVALID_PAGE_ID};

use super::btree_iterator::BPlusTreeIterator;
use super::btree_page::{
    BTreePage, BTreePageRef, HeaderNode, HeaderNodeRef, InternalNode, InternalNodeRef, LeafNode,
    LeafNodeRef, INTERNAL_PAGE_CAPACITY, LEAF_PAGE_CAPACITY,
};

/// One level of the write-latch chain held during a mutating descent.
/// `child_index` records which child slot the descent took out of this
/// node, so rebalancing can find siblings without re-searching keys.
struct LatchEntry {
    guard: WritePageGuard,
    child_index: usize,
}

/// The chain of write latches held from the header page toward the leaf.
/// Entries are released front-first as soon as a node proves it cannot
/// split or merge under the current operation.
struct Context {
    entries: VecDeque<LatchEntry>,
}

impl Context {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, guard: WritePageGuard) {
        self.entries.push_back(LatchEntry {
            guard,
            child_index: 0,
        });
    }

    fn pop_back(&mut self) -> LatchEntry {
        self.entries.pop_back().expect("latch chain is empty")
    }

    fn back(&self) -> &LatchEntry {
        self.entries.back().expect("latch chain is empty")
    }

    fn back_mut(&mut self) -> &mut LatchEntry {
        self.entries.back_mut().expect("latch chain is empty")
    }

    /// Drops every latch above the current node. Latches are only ever
    /// acquired top-down, so releasing from the front is safe.
    fn release_ancestors(&mut self) {
        while self.entries.len() > 1 {
            self.entries.pop_front();
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn front_page_id(&self) -> PageId {
        self.entries.front().expect("latch chain is empty").guard.page_id()
    }
}

/// A persistent, concurrent, unique-key B+tree mapping u32 keys to record
/// ids, stored entirely as buffer-pool pages.
///
/// Every operation enters through the header page, which holds the root
/// pointer. Mutating operations descend with write-latch crabbing: each
/// node's latch is taken before the parent's is released, and ancestors
/// are dropped as soon as the current node is guaranteed not to split
/// (insert) or underflow (remove). Lookups use read latches with
/// hand-over-hand release.
pub struct BPlusTree {
    bpm: Arc<BufferPoolManager>,
    header_page_id: PageId,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl BPlusTree {
    /// Creates a new empty tree, allocating its header page.
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 2 && leaf_max_size < LEAF_PAGE_CAPACITY);
        assert!(internal_max_size >= 3 && internal_max_size < INTERNAL_PAGE_CAPACITY);

        let header_page_id = {
            let guard = bpm.new_page_guarded()?;
            let mut guard = guard.upgrade_write();
            HeaderNode::new(guard.data_mut()).init();
            guard.page_id()
        };

        Ok(Self {
            bpm,
            header_page_id,
            leaf_max_size,
            internal_max_size,
        })
    }

    /// Re-attaches to an existing tree whose header page is already on
    /// disk.
    pub fn open(
        header_page_id: PageId,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        Self {
            bpm,
            header_page_id,
            leaf_max_size,
            internal_max_size,
        }
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    /// Reads the current root page id from the header page.
    pub fn root_page_id(&self) -> Result<PageId> {
        let guard = self.bpm.fetch_page_read(self.header_page_id)?;
        Ok(HeaderNodeRef::new(guard.data()).root_page_id())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.root_page_id()? == INVALID_PAGE_ID)
    }

    fn leaf_min_size(&self) -> usize {
        self.leaf_max_size / 2
    }

    fn internal_min_size(&self) -> usize {
        (self.internal_max_size + 1) / 2
    }

    /// Point lookup. Takes read latches hand-over-hand from the header to
    /// the leaf.
    pub fn get_value(&self, key: u32) -> Result<Option<RecordId>> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = HeaderNodeRef::new(header_guard.data()).root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut guard = self.bpm.fetch_page_read(root_page_id)?;
        drop(header_guard);

        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                let leaf = LeafNodeRef::new(guard.data());
                let index = leaf.lower_bound(key);
                if index < leaf.size() && leaf.key_at(index) == key {
                    return Ok(Some(leaf.record_at(index)));
                }
                return Ok(None);
            }
            let child_page_id = {
                let node = InternalNodeRef::new(guard.data());
                node.child_at(node.child_slot_for(key))
            };
            // Child latched before the parent guard is dropped
            guard = self.bpm.fetch_page_read(child_page_id)?;
        }
    }

    /// Inserts a key-value pair. Returns false if the key already exists.
    pub fn insert(&self, key: u32, record: RecordId) -> Result<bool> {
        let mut ctx = Context::new();
        let mut header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let mut root_page_id = HeaderNodeRef::new(header_guard.data()).root_page_id();

        if root_page_id == INVALID_PAGE_ID {
            let basic = self.bpm.new_page_guarded()?;
            root_page_id = basic.page_id();
            {
                let mut root_guard = basic.upgrade_write();
                LeafNode::new(root_guard.data_mut()).init(self.leaf_max_size);
            }
            HeaderNode::new(header_guard.data_mut()).set_root_page_id(root_page_id);
        }
        ctx.push(header_guard);

        let mut pos_page_id = root_page_id;
        loop {
            let guard = self.bpm.fetch_page_write(pos_page_id)?;
            ctx.push(guard);
            let (is_leaf, safe) = {
                let page = BTreePageRef::new(ctx.back().guard.data());
                (page.is_leaf(), page.size() < page.max_size())
            };
            if safe {
                ctx.release_ancestors();
            }
            if is_leaf {
                break;
            }
            let child_index = {
                InternalNodeRef::new(ctx.back().guard.data()).child_slot_for(key)
            };
            ctx.back_mut().child_index = child_index;
            pos_page_id = { InternalNodeRef::new(ctx.back().guard.data()).child_at(child_index) };
        }

        let (duplicate, insert_index, leaf_size) = {
            let leaf = LeafNodeRef::new(ctx.back().guard.data());
            let index = leaf.lower_bound(key);
            (
                index < leaf.size() && leaf.key_at(index) == key,
                index,
                leaf.size(),
            )
        };
        if duplicate {
            return Ok(false);
        }

        if leaf_size < self.leaf_max_size {
            let mut leaf = LeafNode::new(ctx.back_mut().guard.data_mut());
            leaf.insert_at(insert_index, key, record);
            return Ok(true);
        }

        // The leaf splits. Every retained node above it (all of which are
        // full, by the release rule) will split too, so the whole chain of
        // fresh pages is allocated up front: a pool-exhausted error
        // surfaces here, before any page has been modified.
        let root_will_split = ctx.front_page_id() == self.header_page_id;
        let pages_needed = if root_will_split {
            ctx.len()
        } else {
            ctx.len() - 1
        };
        let mut fresh_pages = Vec::with_capacity(pages_needed);
        for _ in 0..pages_needed {
            fresh_pages.push(self.bpm.new_page_guarded()?);
        }

        let mut leaf_entry = ctx.pop_back();
        let left_page_id = leaf_entry.guard.page_id();
        let basic = fresh_pages.pop().expect("preallocated split page missing");
        let right_page_id = basic.page_id();
        let mut right_guard = basic.upgrade_write();

        let separator_key;
        {
            let mut leaf = LeafNode::new(leaf_entry.guard.data_mut());
            leaf.insert_at(insert_index, key, record);
            let mut right = LeafNode::new(right_guard.data_mut());
            right.init(self.leaf_max_size);
            let split_index = (self.leaf_max_size + 1) / 2;
            leaf.move_upper_half_to(&mut right, split_index);
            right.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(right_page_id);
            right.set_parent_page_id(leaf.parent_page_id());
            separator_key = right.key_at(0);
        }
        drop(right_guard);
        drop(leaf_entry);

        self.insert_into_internal(
            separator_key,
            left_page_id,
            right_page_id,
            &mut ctx,
            &mut fresh_pages,
        )?;
        debug_assert!(fresh_pages.is_empty());
        Ok(true)
    }

    /// Propagates a split upward: installs `(key, right)` into the node at
    /// the top of the latch chain, splitting it in turn if it overflows.
    /// When the chain has been consumed down to the header page, the split
    /// reached the root and a new root is created.
    fn insert_into_internal(
        &self,
        key: u32,
        left_page_id: PageId,
        right_page_id: PageId,
        ctx: &mut Context,
        fresh_pages: &mut Vec<BasicPageGuard>,
    ) -> Result<()> {
        if ctx.back().guard.page_id() == self.header_page_id {
            let basic = fresh_pages.pop().expect("preallocated split page missing");
            let new_root_id = basic.page_id();
            {
                let mut root_guard = basic.upgrade_write();
                let mut root = InternalNode::new(root_guard.data_mut());
                root.init(self.internal_max_size);
                root.init_root(key, left_page_id, right_page_id);
            }
            HeaderNode::new(ctx.back_mut().guard.data_mut()).set_root_page_id(new_root_id);
            for child_id in [left_page_id, right_page_id] {
                let mut child_guard = self.bpm.fetch_page_write(child_id)?;
                BTreePage::new(child_guard.data_mut()).set_parent_page_id(new_root_id);
            }
            return Ok(());
        }

        let parent_page_id = ctx.back().guard.page_id();
        {
            let mut parent = InternalNode::new(ctx.back_mut().guard.data_mut());
            let index = parent.child_slot_for(key) + 1;
            parent.insert_at(index, key, right_page_id);
        }
        {
            let mut child_guard = self.bpm.fetch_page_write(right_page_id)?;
            BTreePage::new(child_guard.data_mut()).set_parent_page_id(parent_page_id);
        }

        let overflow =
            { InternalNodeRef::new(ctx.back().guard.data()).size() > self.internal_max_size };
        if !overflow {
            return Ok(());
        }

        let mut node_entry = ctx.pop_back();
        let basic = fresh_pages.pop().expect("preallocated split page missing");
        let new_right_id = basic.page_id();
        let mut right_guard = basic.upgrade_write();

        let pivot;
        let moved_children;
        {
            let mut node = InternalNode::new(node_entry.guard.data_mut());
            let mut right = InternalNode::new(right_guard.data_mut());
            right.init(self.internal_max_size);
            let split_index = self.internal_max_size / 2 + 1;
            pivot = node.key_at(split_index);
            moved_children = node.move_upper_half_to(&mut right, split_index);
            right.set_parent_page_id(node.parent_page_id());
        }
        drop(right_guard);
        for child_id in moved_children {
            let mut child_guard = self.bpm.fetch_page_write(child_id)?;
            BTreePage::new(child_guard.data_mut()).set_parent_page_id(new_right_id);
        }
        drop(node_entry);

        self.insert_into_internal(pivot, parent_page_id, new_right_id, ctx, fresh_pages)
    }

    /// Removes a key. No-op if the key is absent.
    pub fn remove(&self, key: u32) -> Result<()> {
        let mut ctx = Context::new();
        let header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let root_page_id = HeaderNodeRef::new(header_guard.data()).root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }
        ctx.push(header_guard);

        let mut pos_page_id = root_page_id;
        loop {
            let guard = self.bpm.fetch_page_write(pos_page_id)?;
            ctx.push(guard);
            let (is_leaf, safe) = {
                let page = BTreePageRef::new(ctx.back().guard.data());
                let is_root = page.parent_page_id() == INVALID_PAGE_ID;
                let min_size = match (page.is_leaf(), is_root) {
                    (true, true) => 1,
                    (true, false) => self.leaf_min_size(),
                    (false, true) => 2,
                    (false, false) => self.internal_min_size(),
                };
                (page.is_leaf(), page.size() > min_size)
            };
            if safe {
                ctx.release_ancestors();
            }
            if is_leaf {
                break;
            }
            let child_index = {
                InternalNodeRef::new(ctx.back().guard.data()).child_slot_for(key)
            };
            ctx.back_mut().child_index = child_index;
            pos_page_id = { InternalNodeRef::new(ctx.back().guard.data()).child_at(child_index) };
        }

        let removed = {
            let mut leaf = LeafNode::new(ctx.back_mut().guard.data_mut());
            let index = leaf.lower_bound(key);
            if index < leaf.size() && leaf.key_at(index) == key {
                leaf.remove_at(index);
                true
            } else {
                false
            }
        };
        if !removed {
            return Ok(());
        }

        let (leaf_size, is_root) = {
            let page = BTreePageRef::new(ctx.back().guard.data());
            (page.size(), page.parent_page_id() == INVALID_PAGE_ID)
        };

        if is_root {
            if leaf_size == 0 {
                // The last key is gone; the tree becomes empty
                let leaf_entry = ctx.pop_back();
                let leaf_page_id = leaf_entry.guard.page_id();
                HeaderNode::new(ctx.back_mut().guard.data_mut())
                    .set_root_page_id(INVALID_PAGE_ID);
                drop(leaf_entry);
                self.bpm.delete_page(leaf_page_id)?;
            }
            return Ok(());
        }
        if leaf_size >= self.leaf_min_size() {
            return Ok(());
        }

        self.rebalance_leaf(&mut ctx)
    }

    /// Restores the fill bound of the underflowed leaf at the top of the
    /// latch chain, by borrowing from a sibling when possible and merging
    /// otherwise. Siblings are fetched under the parent's write latch.
    fn rebalance_leaf(&self, ctx: &mut Context) -> Result<()> {
        let mut leaf_entry = ctx.pop_back();
        let leaf_page_id = leaf_entry.guard.page_id();
        let index = ctx.back().child_index;

        let (left_id, right_id) = {
            let parent = InternalNodeRef::new(ctx.back().guard.data());
            debug_assert_eq!(parent.child_at(index), leaf_page_id);
            let left = (index > 0).then(|| parent.child_at(index - 1));
            let right = (index + 1 < parent.size()).then(|| parent.child_at(index + 1));
            (left, right)
        };

        if let Some(left_id) = left_id {
            let mut left_guard = self.bpm.fetch_page_write(left_id)?;
            if LeafNodeRef::new(left_guard.data()).size() > self.leaf_min_size() {
                let moved_key;
                {
                    let mut left = LeafNode::new(left_guard.data_mut());
                    let mut leaf = LeafNode::new(leaf_entry.guard.data_mut());
                    let last = left.size() - 1;
                    moved_key = left.key_at(last);
                    let moved_record = left.record_at(last);
                    left.remove_at(last);
                    leaf.insert_at(0, moved_key, moved_record);
                }
                let mut parent = InternalNode::new(ctx.back_mut().guard.data_mut());
                parent.set_key_at(index, moved_key);
                return Ok(());
            }
        }

        if let Some(right_id) = right_id {
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            if LeafNodeRef::new(right_guard.data()).size() > self.leaf_min_size() {
                let new_separator;
                {
                    let mut right = LeafNode::new(right_guard.data_mut());
                    let mut leaf = LeafNode::new(leaf_entry.guard.data_mut());
                    let moved_key = right.key_at(0);
                    let moved_record = right.record_at(0);
                    right.remove_at(0);
                    let size = leaf.size();
                    leaf.insert_at(size, moved_key, moved_record);
                    new_separator = right.key_at(0);
                }
                let mut parent = InternalNode::new(ctx.back_mut().guard.data_mut());
                parent.set_key_at(index + 1, new_separator);
                return Ok(());
            }
        }

        if let Some(left_id) = left_id {
            {
                let mut left_guard = self.bpm.fetch_page_write(left_id)?;
                let mut left = LeafNode::new(left_guard.data_mut());
                let mut leaf = LeafNode::new(leaf_entry.guard.data_mut());
                left.absorb(&mut leaf);
            }
            drop(leaf_entry);
            self.bpm.delete_page(leaf_page_id)?;
            return self.remove_from_internal(ctx, index);
        }

        let right_id = right_id.expect("non-root leaf must have a sibling");
        {
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            let mut right = LeafNode::new(right_guard.data_mut());
            let mut leaf = LeafNode::new(leaf_entry.guard.data_mut());
            leaf.absorb(&mut right);
        }
        drop(leaf_entry);
        self.bpm.delete_page(right_id)?;
        self.remove_from_internal(ctx, index + 1)
    }

    /// Removes the separator pair at `removed_index` from the internal
    /// node at the top of the latch chain, then repairs any underflow the
    /// removal causes: root demotion, sibling borrow, or merge (which
    /// recurses into the parent).
    fn remove_from_internal(&self, ctx: &mut Context, removed_index: usize) -> Result<()> {
        {
            let mut node = InternalNode::new(ctx.back_mut().guard.data_mut());
            node.remove_at(removed_index);
        }

        let (size, is_root) = {
            let page = BTreePageRef::new(ctx.back().guard.data());
            (page.size(), page.parent_page_id() == INVALID_PAGE_ID)
        };

        if is_root {
            if size == 1 {
                // A root with one child is redundant; promote the child
                let node_entry = ctx.pop_back();
                let old_root_id = node_entry.guard.page_id();
                let new_root_id = { InternalNodeRef::new(node_entry.guard.data()).child_at(0) };
                HeaderNode::new(ctx.back_mut().guard.data_mut()).set_root_page_id(new_root_id);
                {
                    let mut child_guard = self.bpm.fetch_page_write(new_root_id)?;
                    BTreePage::new(child_guard.data_mut()).set_parent_page_id(INVALID_PAGE_ID);
                }
                drop(node_entry);
                self.bpm.delete_page(old_root_id)?;
            }
            return Ok(());
        }
        if size >= self.internal_min_size() {
            return Ok(());
        }

        let mut node_entry = ctx.pop_back();
        let node_page_id = node_entry.guard.page_id();
        let index = ctx.back().child_index;

        let (left_id, right_id) = {
            let parent = InternalNodeRef::new(ctx.back().guard.data());
            debug_assert_eq!(parent.child_at(index), node_page_id);
            let left = (index > 0).then(|| parent.child_at(index - 1));
            let right = (index + 1 < parent.size()).then(|| parent.child_at(index + 1));
            (left, right)
        };

        if let Some(left_id) = left_id {
            let mut left_guard = self.bpm.fetch_page_write(left_id)?;
            if InternalNodeRef::new(left_guard.data()).size() > self.internal_min_size() {
                let moved_child;
                {
                    let mut left = InternalNode::new(left_guard.data_mut());
                    let mut node = InternalNode::new(node_entry.guard.data_mut());
                    let mut parent = InternalNode::new(ctx.back_mut().guard.data_mut());
                    let last = left.size() - 1;
                    let borrowed_key = left.key_at(last);
                    moved_child = left.child_at(last);
                    left.set_size(last);
                    // The separator rotates down into the node; the left
                    // sibling's last key rotates up into the parent
                    node.shift_right_one();
                    node.set_child_at(0, moved_child);
                    node.set_key_at(1, parent.key_at(index));
                    parent.set_key_at(index, borrowed_key);
                }
                let mut child_guard = self.bpm.fetch_page_write(moved_child)?;
                BTreePage::new(child_guard.data_mut()).set_parent_page_id(node_page_id);
                return Ok(());
            }
        }

        if let Some(right_id) = right_id {
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            if InternalNodeRef::new(right_guard.data()).size() > self.internal_min_size() {
                let moved_child;
                {
                    let mut right = InternalNode::new(right_guard.data_mut());
                    let mut node = InternalNode::new(node_entry.guard.data_mut());
                    let mut parent = InternalNode::new(ctx.back_mut().guard.data_mut());
                    moved_child = right.child_at(0);
                    node.push_pair(parent.key_at(index + 1), moved_child);
                    parent.set_key_at(index + 1, right.key_at(1));
                    right.remove_front();
                }
                let mut child_guard = self.bpm.fetch_page_write(moved_child)?;
                BTreePage::new(child_guard.data_mut()).set_parent_page_id(node_page_id);
                return Ok(());
            }
        }

        if let Some(left_id) = left_id {
            let moved_children;
            {
                let mut left_guard = self.bpm.fetch_page_write(left_id)?;
                let mut left = InternalNode::new(left_guard.data_mut());
                let mut node = InternalNode::new(node_entry.guard.data_mut());
                let separator = {
                    let parent = InternalNodeRef::new(ctx.back().guard.data());
                    parent.key_at(index)
                };
                moved_children = left.absorb(separator, &mut node);
            }
            for child_id in moved_children {
                let mut child_guard = self.bpm.fetch_page_write(child_id)?;
                BTreePage::new(child_guard.data_mut()).set_parent_page_id(left_id);
            }
            drop(node_entry);
            self.bpm.delete_page(node_page_id)?;
            return self.remove_from_internal(ctx, index);
        }

        let right_id = right_id.expect("non-root internal must have a sibling");
        let moved_children;
        {
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            let mut right = InternalNode::new(right_guard.data_mut());
            let mut node = InternalNode::new(node_entry.guard.data_mut());
            let separator = {
                let parent = InternalNodeRef::new(ctx.back().guard.data());
                parent.key_at(index + 1)
            };
            moved_children = node.absorb(separator, &mut right);
        }
        for child_id in moved_children {
            let mut child_guard = self.bpm.fetch_page_write(child_id)?;
            BTreePage::new(child_guard.data_mut()).set_parent_page_id(node_page_id);
        }
        drop(node_entry);
        self.bpm.delete_page(right_id)?;
        self.remove_from_internal(ctx, index + 1)
    }

    /// Iterator positioned at the leftmost entry.
    pub fn iter(&self) -> Result<BPlusTreeIterator> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = HeaderNodeRef::new(header_guard.data()).root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(BPlusTreeIterator::exhausted(Arc::clone(&self.bpm)));
        }

        let mut guard = self.bpm.fetch_page_read(root_page_id)?;
        drop(header_guard);

        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                return BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, 0);
            }
            let child_page_id = { InternalNodeRef::new(guard.data()).child_at(0) };
            guard = self.bpm.fetch_page_read(child_page_id)?;
        }
    }

    /// Iterator positioned at the first entry whose key is >= `key`.
    pub fn iter_from(&self, key: u32) -> Result<BPlusTreeIterator> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = HeaderNodeRef::new(header_guard.data()).root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(BPlusTreeIterator::exhausted(Arc::clone(&self.bpm)));
        }

        let mut guard = self.bpm.fetch_page_read(root_page_id)?;
        drop(header_guard);

        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                let slot = LeafNodeRef::new(guard.data()).lower_bound(key);
                return BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, slot);
            }
            let child_page_id = {
                let node = InternalNodeRef::new(guard.data());
                node.child_at(node.child_slot_for(key))
            };
            guard = self.bpm.fetch_page_read(child_page_id)?;
        }
    }
}
