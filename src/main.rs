use std::sync::Arc;

use karst::buffer::BufferPoolManager;
use karst::common::{PageId, RecordId, SlotId, DEFAULT_BUFFER_POOL_SIZE, DEFAULT_LRUK_K};
use karst::index::BPlusTree;
use karst::storage::disk::DiskManager;

fn main() {
    println!("Karst - a disk-oriented storage engine core");
    println!("===========================================\n");

    let db_path = "demo.db";

    let disk_manager = Arc::new(DiskManager::new(db_path).expect("Failed to create disk manager"));
    println!("Created disk manager for: {}", db_path);

    let bpm = Arc::new(BufferPoolManager::new(
        DEFAULT_BUFFER_POOL_SIZE,
        DEFAULT_LRUK_K,
        Arc::clone(&disk_manager),
    ));
    println!(
        "Created buffer pool manager with {} frames\n",
        DEFAULT_BUFFER_POOL_SIZE
    );

    let tree = BPlusTree::new(Arc::clone(&bpm), 4, 4).expect("Failed to create index");
    println!("Created B+tree index, header page {}", tree.header_page_id());

    for key in [17u32, 3, 25, 8, 42, 1, 30, 12, 21, 5] {
        let record = RecordId::new(PageId::new(100 + key), SlotId::new(0));
        tree.insert(key, record).expect("insert failed");
        println!("Inserted key {}", key);
    }

    println!("\nPoint lookups:");
    for key in [8u32, 21, 99] {
        match tree.get_value(key).expect("lookup failed") {
            Some(record) => println!("  key {} -> {:?}", key, record),
            None => println!("  key {} -> absent", key),
        }
    }

    println!("\nOrdered scan:");
    let mut iter = tree.iter().expect("iterator failed");
    while let Some((key, record)) = iter.next().expect("scan failed") {
        println!("  {} -> {:?}", key, record);
    }

    tree.remove(17).expect("remove failed");
    tree.remove(1).expect("remove failed");
    println!("\nRemoved keys 17 and 1; scan from 5:");
    let mut iter = tree.iter_from(5).expect("iterator failed");
    while let Some((key, _)) = iter.next().expect("scan failed") {
        print!("{} ", key);
    }
    println!();

    bpm.flush_all_pages().expect("flush failed");
    println!(
        "\nDisk stats: {} pages, {} reads, {} writes",
        disk_manager.get_num_pages(),
        disk_manager.get_num_reads(),
        disk_manager.get_num_writes()
    );

    std::fs::remove_file(db_path).ok();
    println!("Demo completed successfully!");
}
