//! Compile-time constants in the source this crate grew from become runtime
//! fields here, so a test harness can build independent, differently-sized
//! instances instead of reaching into a single process-wide singleton.

/// Tunables for both [`crate::PageAllocator`] and [`crate::BufferCache`].
///
/// Field names and [`Default`] values mirror `param.rs`'s `NCPU`, `NBUF` and
/// `fs.rs`'s `BSIZE` in the source tree this crate grew from; `heap_bytes`
/// mirrors `PHYSTOP - KERNBASE` from `memlayout.rs`.
#[derive(Debug, Clone, Copy)]
pub struct Params {
    /// Number of per-CPU free-list shards in the page allocator.
    pub ncpu: usize,
    /// Bytes per page frame. Must be a power of two.
    pub page_size: usize,
    /// Total bytes of physical memory the allocator owns.
    pub heap_bytes: usize,
    /// Number of buffer slots in the buffer cache pool.
    pub nbuf: usize,
    /// Number of hash buckets the buffer cache shards its pool across.
    pub nbucket: usize,
    /// Bytes per cached disk block.
    pub block_size: usize,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            ncpu: 8,
            page_size: 4096,
            heap_bytes: 128 * 1024 * 1024,
            nbuf: 30,
            nbucket: 13,
            block_size: 1024,
        }
    }
}
