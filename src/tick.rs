//! Stand-in for the monotonic `current_tick()` collaborator used to stamp
//! `last_used_tick` for the buffer cache's LRU approximation.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic counter. Real hardware advances it from a timer interrupt;
/// here it only advances when something calls `advance()`, which keeps LRU
/// ordering deterministic in tests.
pub trait TickSource: Send + Sync {
    fn now(&self) -> u64;
}

pub struct AtomicTickSource(AtomicU64);

impl AtomicTickSource {
    pub fn new() -> Self {
        AtomicTickSource(AtomicU64::new(0))
    }

    /// Advances the counter by one and returns the new value.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for AtomicTickSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for AtomicTickSource {
    fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
