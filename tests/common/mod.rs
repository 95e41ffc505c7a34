//! Shared helpers for the integration tests.

use std::sync::Arc;

use karst::buffer::BufferPoolManager;
use karst::common::{PageId, INVALID_PAGE_ID};
use karst::index::btree_page::{BTreePageRef, InternalNodeRef, LeafNodeRef};
use karst::index::BPlusTree;
use karst::storage::disk::DiskManager;

use tempfile::NamedTempFile;

pub fn create_bpm(pool_size: usize) -> (Arc<BufferPoolManager>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(pool_size, 2, dm));
    (bpm, temp_file)
}

/// Walks the whole tree, asserting the structural invariants (equal leaf
/// depth, strictly ascending keys, fill bounds, parent pointers, and a
/// complete leaf chain), and returns every key in ascending order.
pub fn check_tree(bpm: &Arc<BufferPoolManager>, tree: &BPlusTree) -> Vec<u32> {
    let root = tree.root_page_id().unwrap();
    if root == INVALID_PAGE_ID {
        return Vec::new();
    }

    let mut leaves = Vec::new();
    let mut leaf_depth = None;
    validate_node(
        bpm,
        root,
        INVALID_PAGE_ID,
        None,
        None,
        0,
        &mut leaf_depth,
        &mut leaves,
        true,
    );

    // The leaf chain must enumerate exactly the in-order leaves
    let mut chained = Vec::new();
    let mut keys = Vec::new();
    let mut next = leaves[0];
    while next != INVALID_PAGE_ID {
        let guard = bpm.fetch_page_read(next).unwrap();
        let leaf = LeafNodeRef::new(guard.data());
        chained.push(next);
        for i in 0..leaf.size() {
            keys.push(leaf.key_at(i));
        }
        next = leaf.next_page_id();
    }
    assert_eq!(chained, leaves, "leaf chain does not match tree order");
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1], "keys not strictly ascending");
    }
    keys
}

#[allow(clippy::too_many_arguments)]
fn validate_node(
    bpm: &Arc<BufferPoolManager>,
    page_id: PageId,
    expected_parent: PageId,
    low: Option<u32>,
    high: Option<u32>,
    depth: usize,
    leaf_depth: &mut Option<usize>,
    leaves: &mut Vec<PageId>,
    is_root: bool,
) {
    let guard = bpm.fetch_page_read(page_id).unwrap();
    let page = BTreePageRef::new(guard.data());
    assert_eq!(
        page.parent_page_id(),
        expected_parent,
        "bad parent pointer on {}",
        page_id
    );

    if page.is_leaf() {
        let leaf = LeafNodeRef::new(guard.data());
        let min = if is_root { 1 } else { leaf.max_size() / 2 };
        assert!(
            leaf.size() >= min && leaf.size() <= leaf.max_size(),
            "leaf {} fill out of bounds: size {}",
            page_id,
            leaf.size()
        );
        for i in 0..leaf.size() {
            let key = leaf.key_at(i);
            if i > 0 {
                assert!(leaf.key_at(i - 1) < key, "leaf keys not ascending");
            }
            if let Some(low) = low {
                assert!(key >= low, "leaf key {} below separator {}", key, low);
            }
            if let Some(high) = high {
                assert!(key < high, "leaf key {} at or above separator {}", key, high);
            }
        }
        match leaf_depth {
            Some(d) => assert_eq!(*d, depth, "leaves at unequal depth"),
            None => *leaf_depth = Some(depth),
        }
        leaves.push(page_id);
        return;
    }

    let node = InternalNodeRef::new(guard.data());
    let min = if is_root { 2 } else { (node.max_size() + 1) / 2 };
    assert!(
        node.size() >= min && node.size() <= node.max_size(),
        "internal {} fill out of bounds: size {}",
        page_id,
        node.size()
    );
    for i in 2..node.size() {
        assert!(node.key_at(i - 1) < node.key_at(i), "separators not ascending");
    }

    let size = node.size();
    let children: Vec<PageId> = (0..size).map(|i| node.child_at(i)).collect();
    let separators: Vec<u32> = (1..size).map(|i| node.key_at(i)).collect();
    drop(guard);

    for (i, child) in children.iter().enumerate() {
        let child_low = if i == 0 { low } else { Some(separators[i - 1]) };
        let child_high = if i == size - 1 { high } else { Some(separators[i]) };
        validate_node(
            bpm,
            *child,
            page_id,
            child_low,
            child_high,
            depth + 1,
            leaf_depth,
            leaves,
            false,
        );
    }
}
