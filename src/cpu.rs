//! Stand-ins for `current_cpu_id()` / `push_off()` / `pop_off()`.
//!
//! On bare metal these read a hardware register (`tp` on RISC-V) and mask
//! interrupts. There is neither here: a "CPU" is whichever logical id the
//! calling OS thread has been pinned to, defaulting to 0, so a test can drive
//! a multi-CPU interleaving from plain `std::thread::spawn` callers.

use std::cell::Cell;

thread_local! {
    static CURRENT_CPU: Cell<usize> = Cell::new(0);
}

/// Returns the logical CPU id of the calling thread.
pub fn current_cpu_id() -> usize {
    CURRENT_CPU.with(|c| c.get())
}

/// Pins the calling thread to logical CPU `id` for the rest of its lifetime
/// (or until the next call). Test-only seam: real hardware has no such knob,
/// `current_cpu_id()` just reads it.
pub fn set_current_cpu(id: usize) {
    CURRENT_CPU.with(|c| c.set(id));
}

/// RAII stand-in for `push_off()`/`pop_off()`. Holding one means "preemption
/// disabled, `current_cpu_id()` is stable for the duration."
///
/// On a hosted target there is no interrupt controller to mask, so this is
/// bookkeeping only, but every caller that would disable interrupts on bare
/// metal acquires one here, so the call shape survives a future bare-metal
/// backend.
#[must_use]
pub struct PreemptGuard {
    _private: (),
}

/// Disables preemption for the returned guard's lifetime.
pub fn preempt_disable() -> PreemptGuard {
    PreemptGuard { _private: () }
}
