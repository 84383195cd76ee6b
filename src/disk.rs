//! Stand-in for the `disk_rw(buf, write?)` block-device collaborator.
//!
//! The real driver lives below the filesystem layer and is out of scope here;
//! this crate only needs something that honors the contract so `BufferCache`
//! is runnable and testable without hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Synchronous block I/O, as consumed by [`crate::BufferCache`].
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, dev: u32, block_no: u64, buf: &mut [u8]);
    fn write_block(&self, dev: u32, block_no: u64, buf: &[u8]);
}

/// In-memory block device. Blocks that were never written read back as
/// zeroes. Tracks read/write counts so tests can assert on how many times
/// the cache actually went to "disk."
pub struct MemoryDisk {
    blocks: Mutex<HashMap<(u32, u64), Vec<u8>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryDisk {
    pub fn new() -> Self {
        MemoryDisk {
            blocks: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Seeds a block's contents without going through `write_block` (and so
    /// without bumping `write_count`), for setting up test fixtures.
    pub fn seed(&self, dev: u32, block_no: u64, data: Vec<u8>) {
        self.blocks.lock().unwrap().insert((dev, block_no), data);
    }
}

impl Default for MemoryDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for MemoryDisk {
    fn read_block(&self, dev: u32, block_no: u64, buf: &mut [u8]) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        log::trace!("disk read dev={dev} block={block_no}");
        let blocks = self.blocks.lock().unwrap();
        match blocks.get(&(dev, block_no)) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
    }

    fn write_block(&self, dev: u32, block_no: u64, buf: &[u8]) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        log::trace!("disk write dev={dev} block={block_no}");
        self.blocks
            .lock()
            .unwrap()
            .insert((dev, block_no), buf.to_vec());
    }
}
