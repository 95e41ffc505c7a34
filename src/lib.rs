//! Karst - the storage engine core of a disk-oriented DBMS
//!
//! This crate provides the three subsystems at the heart of a disk-oriented
//! database: a buffer pool that caches fixed-size pages in memory, an LRU-K
//! replacement policy that picks eviction victims, and a concurrent B+tree
//! index stored entirely through the buffer pool.
//!
//! # Architecture
//!
//! - **Storage Layer** (`storage`): disk I/O over page-numbered frames
//!   - `DiskManager`: reads and writes pages to/from a single database file
//!   - `DiskScheduler`: background worker thread for disk requests
//!
//! - **Buffer Pool** (`buffer`): memory management for database pages
//!   - `BufferPoolManager`: pins pages into frames, evicting as needed
//!   - `LruKReplacer`: LRU-K page replacement policy
//!   - `FrameHeader`: per-frame metadata, data, and the page latch
//!   - `BasicPageGuard`/`ReadPageGuard`/`WritePageGuard`: RAII guards that
//!     release their pin (and latch) on every exit path
//!
//! - **Index** (`index`): ordered secondary storage
//!   - `BPlusTree`: unique-key B+tree with latch-crabbing concurrency
//!   - `BPlusTreeIterator`: in-order scan over the leaf chain
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use karst::buffer::BufferPoolManager;
//! use karst::common::{PageId, RecordId, SlotId};
//! use karst::index::BPlusTree;
//! use karst::storage::disk::DiskManager;
//!
//! // Create a disk manager for a database file
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//!
//! // Create a buffer pool with 100 frames and LRU-2 replacement
//! let bpm = Arc::new(BufferPoolManager::new(100, 2, disk_manager));
//!
//! // Build a B+tree index and use it
//! let tree = BPlusTree::new(Arc::clone(&bpm), 64, 64).unwrap();
//! tree.insert(42, RecordId::new(PageId::new(7), SlotId::new(0))).unwrap();
//! assert!(tree.get_value(42).unwrap().is_some());
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{KarstError, PageId, RecordId, Result, SlotId};
