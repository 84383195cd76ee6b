//! Bucketed buffer cache.
//!
//! Caches fixed-size disk blocks in memory, sharded across `NBUCKET` hash
//! buckets so a cache hit only ever contends with other lookups hashing to
//! the same bucket. A miss is a double-checked lookup bracketed by one
//! global lock, used only to serialize eviction: the global lock plus a
//! re-verify of the victim's refcount under its own bucket lock keeps two
//! CPUs from ever picking the same victim.
//!
//! Interface:
//! * [`BufferCache::read`] returns a sleep-locked buffer.
//! * After changing its data, call [`BufferCache::write`] to flush it.
//! * When done, call [`BufferCache::release`] (it consumes the handle, so
//!   the compiler rejects any further use of it).
//! * [`BufferCache::pin`]/[`BufferCache::unpin`] adjust the refcount alone,
//!   for callers (e.g. a write-ahead log) that need a buffer to outlive their
//!   own hold on it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::disk::BlockDevice;
use crate::params::Params;
use crate::sleeplock::SleepLock;
use crate::spinlock::SpinLock;
use crate::tick::TickSource;

/// Sentinel `last_used_tick` meaning "never released, evict first" (an
/// `Option<u64>` represented as a sentinel so it can live in an `AtomicU64`;
/// see the eviction scan in `scan_victim`, which reads it outside any lock
/// and needs an always-defined load).
const NEVER_USED: u64 = u64::MAX;

/// A handle to a sleep-locked buffer, returned by [`BufferCache::read`].
///
/// Holds no sleep-lock guard of its own (the lock lives in the cache's pool),
/// but its move-only, non-`Copy` shape means a caller cannot use a buffer
/// after handing it to [`BufferCache::release`].
#[derive(Debug)]
pub struct BufferHandle {
    index: usize,
}

struct BufferMeta {
    dev: u32,
    block_no: u64,
    valid: bool,
}

struct BufferSlot {
    sleep: SleepLock,
    // Scanned across the whole pool without holding any bucket lock during
    // eviction (see `scan_victim`), so these two fields must be atomics
    // rather than plain fields behind the bucket lock: the scan's reads are
    // genuinely racing with `pin`/`unpin`/`release` writes, and only an
    // atomic load is well-defined under that race. The bucket lock is still
    // what makes the *protocol* correct (see `get`'s re-verify step); the
    // atomics only make the unsynchronized scan itself sound.
    refcount: AtomicU32,
    last_used_tick: AtomicU64,
    // Guarded by the lock of this buffer's *current* bucket (`block_no %
    // nbucket`): readers and writers of `dev`/`block_no`/`valid` always hold
    // that bucket's lock, except for the brief unlinked window during
    // eviction (see `get`) when the buffer is provably unreachable from any
    // bucket.
    meta: UnsafeCell<BufferMeta>,
    // Guarded by `sleep` once a caller has come through `get`.
    data: UnsafeCell<Vec<u8>>,
}

// SAFETY: every field of `BufferSlot` documents the lock that guards it;
// `BufferCache` never exposes a `BufferSlot` directly, only through methods
// that uphold that discipline.
unsafe impl Sync for BufferSlot {}

struct BucketList {
    members: Vec<usize>,
}

/// Maps `(device, block_no)` to a fixed-size in-memory buffer.
pub struct BufferCache {
    buckets: Box<[SpinLock<BucketList>]>,
    global: SpinLock<()>,
    pool: Box<[BufferSlot]>,
    nbucket: usize,
    block_size: usize,
    disk: Arc<dyn BlockDevice>,
    ticks: Arc<dyn TickSource>,
}

impl BufferCache {
    /// Builds a pool of `params.nbuf` buffers, all initially in bucket 0 with
    /// `last_used_tick` set to the "never used, evict first" sentinel.
    pub fn new(params: &Params, disk: Arc<dyn BlockDevice>, ticks: Arc<dyn TickSource>) -> Self {
        assert!(params.nbucket >= 1, "nbucket must be at least 1");
        assert!(params.nbuf >= 1, "nbuf must be at least 1");

        let pool: Vec<BufferSlot> = (0..params.nbuf)
            .map(|_| BufferSlot {
                sleep: SleepLock::new("buffer"),
                refcount: AtomicU32::new(0),
                last_used_tick: AtomicU64::new(NEVER_USED),
                meta: UnsafeCell::new(BufferMeta {
                    dev: 0,
                    block_no: 0,
                    valid: false,
                }),
                data: UnsafeCell::new(vec![0u8; params.block_size]),
            })
            .collect();

        let buckets: Vec<SpinLock<BucketList>> = (0..params.nbucket)
            .map(|i| {
                let members = if i == 0 { (0..params.nbuf).collect() } else { Vec::new() };
                SpinLock::new("bcache.bucket", BucketList { members })
            })
            .collect();

        BufferCache {
            buckets: buckets.into_boxed_slice(),
            global: SpinLock::new("bcache", ()),
            pool: pool.into_boxed_slice(),
            nbucket: params.nbucket,
            block_size: params.block_size,
            disk,
            ticks,
        }
    }

    fn bucket_of(&self, block_no: u64) -> usize {
        (block_no % self.nbucket as u64) as usize
    }

    /// Scans `bucket.members` for `(dev, block_no)`; on a hit, bumps the
    /// refcount while still holding the bucket's lock (the caller passes the
    /// guard in) and returns the slot index.
    fn find_and_claim(&self, bucket: &BucketList, dev: u32, block_no: u64) -> Option<usize> {
        for &idx in &bucket.members {
            // SAFETY: `idx` is a member of `bucket`, and `bucket`'s lock is
            // held by the caller, which is exactly the discipline `meta`
            // requires.
            let meta = unsafe { &*self.pool[idx].meta.get() };
            if meta.dev == dev && meta.block_no == block_no {
                self.pool[idx].refcount.fetch_add(1, Ordering::AcqRel);
                return Some(idx);
            }
        }
        None
    }

    /// Full-pool scan for the buffer with `refcount == 0` and the smallest
    /// `last_used_tick`, treating the "never used" sentinel as older than any
    /// real tick (resolving the signed/unsigned sentinel ambiguity the
    /// design notes call out: never-used buffers are evicted first, not
    /// last). Deliberately unsynchronized; see the note on `BufferSlot`.
    fn scan_victim(&self) -> Option<usize> {
        let mut best: Option<(usize, Option<u64>)> = None;
        for (idx, slot) in self.pool.iter().enumerate() {
            if slot.refcount.load(Ordering::Acquire) != 0 {
                continue;
            }
            let raw = slot.last_used_tick.load(Ordering::Acquire);
            let tick = if raw == NEVER_USED { None } else { Some(raw) };
            let better = match best {
                None => true,
                Some((_, Some(best_tick))) => matches!(tick, None) || tick.unwrap() < best_tick,
                Some((_, None)) => false,
            };
            if better {
                best = Some((idx, tick));
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// The double-checked lookup. Bucket `h` is acquired once and held for
    /// the fast-path miss case through the end of eviction; a second bucket
    /// `h'` is acquired only transiently, while `h' != h`, to unlink the
    /// chosen victim, matching the lock-acquisition order required throughout
    /// (global, then `h`, then `h'`).
    fn get(&self, dev: u32, block_no: u64) -> usize {
        let h = self.bucket_of(block_no);

        // Fast path: cache hit needs only bucket h's lock.
        {
            let bucket = self.buckets[h].acquire();
            if let Some(idx) = self.find_and_claim(&bucket, dev, block_no) {
                drop(bucket);
                log::trace!("bcache hit dev={dev} block={block_no}");
                self.pool[idx].sleep.acquire();
                return idx;
            }
        }

        // Miss: global lock, then re-acquire h and re-scan (another CPU may
        // have inserted the same block while we held neither lock).
        let _global = self.global.acquire();
        let mut bucket = self.buckets[h].acquire();
        if let Some(idx) = self.find_and_claim(&bucket, dev, block_no) {
            drop(bucket);
            drop(_global);
            log::trace!("bcache miss-then-hit dev={dev} block={block_no}");
            self.pool[idx].sleep.acquire();
            return idx;
        }

        loop {
            let idx = match self.scan_victim() {
                Some(idx) => idx,
                None => {
                    log::error!("buffer cache exhausted: no buffer with refcount == 0");
                    panic!("no buffers");
                }
            };

            // SAFETY: reading block_no to compute the victim's current
            // bucket; this buffer's bucket lock is not held here, but the
            // value is only used to pick which lock to take next and is
            // re-verified once that lock is held.
            let victim_block_no = unsafe { (*self.pool[idx].meta.get()).block_no };
            let hp = self.bucket_of(victim_block_no);

            if hp != h {
                let mut bucket_p = self.buckets[hp].acquire();
                if self.pool[idx].refcount.load(Ordering::Acquire) != 0 {
                    continue;
                }
                bucket_p.members.retain(|&x| x != idx);
                // bucket_p's lock is released here, before dev/block_no are
                // rewritten under h below; the buffer is unreachable from any
                // bucket in between, so no lock is needed for that window.
            } else {
                if self.pool[idx].refcount.load(Ordering::Acquire) != 0 {
                    continue;
                }
                bucket.members.retain(|&x| x != idx);
            }

            log::debug!(
                "bcache evicting slot {idx} (was dev={victim_block_no}) for dev={dev} block={block_no}"
            );

            // SAFETY: `idx` is unlinked from every bucket at this point and
            // its refcount is 0, so no other call can observe it.
            unsafe {
                let meta = &mut *self.pool[idx].meta.get();
                meta.dev = dev;
                meta.block_no = block_no;
                meta.valid = false;
            }
            self.pool[idx].refcount.store(1, Ordering::Release);
            bucket.members.push(idx);

            drop(bucket);
            drop(_global);
            self.pool[idx].sleep.acquire();
            return idx;
        }
    }

    /// Returns a sleep-locked buffer whose contents match the on-disk block,
    /// reading through the block device collaborator on a cold (`!valid`)
    /// buffer.
    pub fn read(&self, dev: u32, block_no: u64) -> BufferHandle {
        let idx = self.get(dev, block_no);
        let slot = &self.pool[idx];
        // SAFETY: we hold `slot.sleep`, acquired at the end of `get`, which
        // is exactly what guards `meta.valid` and `data` from here on.
        let needs_fill = unsafe { !(*slot.meta.get()).valid };
        if needs_fill {
            let mut buf = vec![0u8; self.block_size];
            self.disk.read_block(dev, block_no, &mut buf);
            unsafe {
                (*slot.data.get()).copy_from_slice(&buf);
                (*slot.meta.get()).valid = true;
            }
        }
        BufferHandle { index: idx }
    }

    /// Flushes a held buffer's contents to disk.
    ///
    /// # Panics
    /// If the calling thread does not hold `handle`'s sleep lock.
    pub fn write(&self, handle: &BufferHandle) {
        let slot = &self.pool[handle.index];
        if !slot.sleep.is_held_by_current() {
            panic!("write: caller does not hold the buffer's sleep lock");
        }
        // SAFETY: sleep lock held by the calling thread.
        let (dev, block_no) = unsafe {
            let meta = &*slot.meta.get();
            (meta.dev, meta.block_no)
        };
        let data = unsafe { &*slot.data.get() };
        self.disk.write_block(dev, block_no, data);
    }

    /// Releases the sleep lock, then decrements the refcount and stamps
    /// `last_used_tick` under the owning bucket's lock. Consumes the handle:
    /// using it afterward is a compile error, not a runtime bug.
    pub fn release(&self, handle: BufferHandle) {
        let idx = handle.index;
        let slot = &self.pool[idx];
        if !slot.sleep.is_held_by_current() {
            panic!("release: caller does not hold the buffer's sleep lock");
        }
        slot.sleep.release();

        // SAFETY: block_no only changes while the buffer is unlinked from
        // every bucket (see `get`), which cannot be happening concurrently
        // with a live handle's release.
        let block_no = unsafe { (*slot.meta.get()).block_no };
        let h = self.bucket_of(block_no);
        let _bucket = self.buckets[h].acquire();
        let prev = slot.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "refcount underflow on release");
        slot.last_used_tick.store(self.ticks.now(), Ordering::Release);
    }

    /// Increments a buffer's refcount without touching its sleep lock.
    pub fn pin(&self, handle: &BufferHandle) {
        let slot = &self.pool[handle.index];
        // SAFETY: caller holds a live handle, so refcount >= 1 already and
        // block_no cannot be rewritten out from under us.
        let block_no = unsafe { (*slot.meta.get()).block_no };
        let h = self.bucket_of(block_no);
        let _bucket = self.buckets[h].acquire();
        slot.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements a buffer's refcount without touching its sleep lock.
    pub fn unpin(&self, handle: &BufferHandle) {
        let slot = &self.pool[handle.index];
        let block_no = unsafe { (*slot.meta.get()).block_no };
        let h = self.bucket_of(block_no);
        let _bucket = self.buckets[h].acquire();
        let prev = slot.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "refcount underflow on unpin");
    }

    /// The held buffer's data. Requires the calling thread to hold its sleep
    /// lock, i.e. to be the thread that called `read` (or has not yet
    /// released a handle it owns).
    pub fn data(&self, handle: &BufferHandle) -> &[u8] {
        let slot = &self.pool[handle.index];
        assert!(slot.sleep.is_held_by_current(), "data: sleep lock not held");
        unsafe { &*slot.data.get() }
    }

    /// Mutable access to the held buffer's data; see [`Self::data`].
    pub fn data_mut(&self, handle: &BufferHandle) -> &mut [u8] {
        let slot = &self.pool[handle.index];
        assert!(slot.sleep.is_held_by_current(), "data_mut: sleep lock not held");
        unsafe { &mut *slot.data.get() }
    }

    pub fn dev(&self, handle: &BufferHandle) -> u32 {
        unsafe { (*self.pool[handle.index].meta.get()).dev }
    }

    pub fn block_no(&self, handle: &BufferHandle) -> u64 {
        unsafe { (*self.pool[handle.index].meta.get()).block_no }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::set_current_cpu;
    use crate::disk::MemoryDisk;
    use crate::tick::AtomicTickSource;
    use std::sync::Arc;
    use std::thread;

    fn small_cache(nbuf: usize, nbucket: usize) -> (BufferCache, Arc<MemoryDisk>, Arc<AtomicTickSource>) {
        let params = Params {
            nbuf,
            nbucket,
            block_size: 64,
            ..Params::default()
        };
        let disk = Arc::new(MemoryDisk::new());
        let ticks = Arc::new(AtomicTickSource::new());
        let cache = BufferCache::new(&params, disk.clone(), ticks.clone());
        (cache, disk, ticks)
    }

    #[test]
    fn cache_hit_skips_the_disk() {
        let (cache, disk, _ticks) = small_cache(4, 3);
        let h1 = cache.read(1, 7);
        assert_eq!(disk.read_count(), 1);
        assert!(cache.data(&h1).iter().all(|&b| b == 0));
        cache.release(h1);

        let h2 = cache.read(1, 7);
        assert_eq!(disk.read_count(), 1, "second read of the same block must not touch disk");
        cache.release(h2);
    }

    #[test]
    fn miss_then_eviction_reads_disk_exactly_once() {
        let (cache, disk, _ticks) = small_cache(4, 3);
        for b in 0..4u64 {
            let h = cache.read(1, b);
            cache.release(h);
        }
        assert_eq!(disk.read_count(), 4);

        let h = cache.read(1, 4);
        assert_eq!(disk.read_count(), 5, "exactly one disk read for the new block");
        assert_eq!(cache.block_no(&h), 4);
        cache.release(h);
    }

    #[test]
    fn lru_tie_break_evicts_the_older_release() {
        let (cache, disk, ticks) = small_cache(3, 3);
        // Fill the pool with three distinct blocks, releasing each at a
        // distinct, increasing tick so there are no ties.
        for b in 0..3u64 {
            let h = cache.read(1, b);
            cache.release(h);
            ticks.advance();
        }
        assert_eq!(disk.read_count(), 3);

        // A fourth distinct block forces an eviction: block 0 was released
        // at the lowest tick, so it must be the one evicted.
        let reads_before = disk.read_count();
        let d = cache.read(1, 3);
        cache.release(d);
        assert_eq!(disk.read_count(), reads_before + 1);

        let reads_before_refetch = disk.read_count();
        let refetch_0 = cache.read(1, 0);
        assert_eq!(disk.read_count(), reads_before_refetch + 1, "block 0 should have been evicted");
        cache.release(refetch_0);

        let reads_before_1 = disk.read_count();
        let refetch_1 = cache.read(1, 1);
        assert_eq!(disk.read_count(), reads_before_1, "block 1 should have survived eviction");
        cache.release(refetch_1);
    }

    #[test]
    fn pin_blocks_eviction_even_with_minimal_tick() {
        let (cache, disk, ticks) = small_cache(2, 3);
        let a = cache.read(1, 0);
        cache.pin(&a);
        cache.release(a);
        ticks.advance();

        let b = cache.read(1, 1);
        cache.release(b);
        ticks.advance();

        // Force an eviction: block 2 needs a slot, but block 0 is pinned, so
        // block 1 (the only unpinned, released buffer) must be chosen.
        let before = disk.read_count();
        let c = cache.read(1, 2);
        assert_eq!(disk.read_count(), before + 1);
        cache.release(c);

        // Block 0 must still be resident: re-reading it should not hit disk.
        let reads_before_refetch = disk.read_count();
        let a2 = cache.read(1, 0);
        assert_eq!(disk.read_count(), reads_before_refetch, "pinned block 0 must have survived eviction");
        cache.unpin(&a2);
        cache.release(a2);
    }

    #[test]
    fn concurrent_miss_on_same_block_reads_disk_once() {
        let (cache, disk, _ticks) = small_cache(4, 3);
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..4)
            .map(|cpu| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    set_current_cpu(cpu);
                    let h = cache.read(9, 100);
                    thread::yield_now();
                    cache.release(h);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(disk.read_count(), 1, "only one of the racing readers should hit disk");
    }

    #[test]
    #[should_panic(expected = "does not hold the buffer's sleep lock")]
    fn write_without_lock_panics() {
        let (cache, _disk, _ticks) = small_cache(2, 3);
        let h = cache.read(1, 0);
        cache.release(h);
        // `release` dropped the sleep lock; reconstruct a handle over the
        // same slot without reacquiring it, the way a stray raw index would
        // in the source this crate grew from, and confirm `write` still
        // refuses to touch disk on a buffer nobody holds.
        let unlocked = BufferHandle { index: 0 };
        cache.write(&unlocked);
    }

    #[test]
    fn exhausted_pool_panics_no_buffers() {
        let (cache, _disk, _ticks) = small_cache(1, 1);
        let h = cache.read(1, 0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.read(2, 0)
        }));
        assert!(result.is_err());
        cache.release(h);
    }
}
