//! Concurrency-sensitive core of a teaching-grade kernel: a per-CPU physical
//! page allocator with cross-CPU work-stealing, and a bucketed buffer cache
//! with a double-checked lookup and an approximate-LRU eviction policy.
//!
//! Both subsystems solve the same problem in different clothes: reduce lock
//! contention on a shared pool while keeping a global invariant intact (every
//! free page owned by exactly one CPU's free list; every cached disk block
//! present in at most one buffer across all buckets).

pub mod cpu;
pub mod disk;
pub mod params;
pub mod sleeplock;
pub mod spinlock;
pub mod tick;

mod bio;
mod kalloc;

pub use bio::{BufferCache, BufferHandle};
pub use kalloc::{Frame, PageAllocator};
pub use params::Params;
