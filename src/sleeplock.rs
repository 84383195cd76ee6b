//! Long-term lock: may park the calling thread, so it is safe to hold across
//! a disk round trip. Never acquire one while holding a [`crate::spinlock::SpinLock`].
//!
//! On bare metal this parks the owning process via `sleep()`/`wakeup()` on a
//! scheduler queue; hosted, `std::sync::Condvar` is the same idea against the
//! OS scheduler instead, so a contended acquire really does yield the thread
//! rather than spin.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

struct State {
    locked: bool,
    holder: Option<ThreadId>,
}

pub struct SleepLock {
    name: &'static str,
    state: Mutex<State>,
    cond: Condvar,
}

impl SleepLock {
    pub fn new(name: &'static str) -> Self {
        SleepLock {
            name,
            state: Mutex::new(State {
                locked: false,
                holder: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the lock is free, then takes it.
    pub fn acquire(&self) {
        let mut state = self.state.lock().unwrap();
        while state.locked {
            state = self.cond.wait(state).unwrap();
        }
        state.locked = true;
        state.holder = Some(thread::current().id());
    }

    /// Releases the lock and wakes one waiter, if any.
    ///
    /// # Panics
    /// If the calling thread does not hold the lock.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.locked || state.holder != Some(thread::current().id()) {
            panic!("sleeplock release by a thread that does not hold {}", self.name);
        }
        state.locked = false;
        state.holder = None;
        self.cond.notify_one();
    }

    /// Whether the calling thread currently holds the lock.
    pub fn is_held_by_current(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.locked && state.holder == Some(thread::current().id())
    }
}
