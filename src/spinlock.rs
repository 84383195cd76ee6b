//! Mutual-exclusion spin lock.
//!
//! Non-yielding: a spin lock must never be held across anything that could
//! park the thread (in particular, never across a [`crate::sleeplock::SleepLock`]
//! acquire). Built on `spin::Mutex`, the busy-wait primitive already in this
//! tree's dependency list, with a thin layer on top that records which
//! logical CPU is holding the lock so callers can assert ownership the way
//! `holding()` did in the source this crate grew from.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::cpu::current_cpu_id;

const NO_OWNER: usize = usize::MAX;

/// A spin lock guarding a `T`.
pub struct SpinLock<T> {
    name: &'static str,
    owner: AtomicUsize,
    inner: Mutex<T>,
}

// SAFETY: `Mutex<T>` is already `Sync` for `T: Send`; `owner`/`name` add no
// further requirement.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        SpinLock {
            name,
            owner: AtomicUsize::new(NO_OWNER),
            inner: Mutex::new(value),
        }
    }

    /// Spins until the lock is free, then returns a guard. Never yields the
    /// scheduler; do not hold the guard across a sleep-lock acquire.
    pub fn acquire(&self) -> SpinLockGuard<'_, T> {
        let guard = self.inner.lock();
        self.owner.store(current_cpu_id(), Ordering::Release);
        SpinLockGuard {
            lock: self,
            guard: Some(guard),
        }
    }

    /// Whether the calling CPU currently holds this lock.
    pub fn holding(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_cpu_id()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    // Always `Some` until `Drop` runs; wrapped so `Drop` can release the
    // underlying mutex guard before clearing `owner`.
    guard: Option<MutexGuard<'a, T>>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.guard.take();
        self.lock.owner.store(NO_OWNER, Ordering::Release);
    }
}
