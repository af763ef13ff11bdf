//! Host-target architecture simulation.
//!
//! Lets the core's unit tests run under the standard test harness: a single
//! simulated hart (id 0), software interrupt-enable state, a tick counter
//! that advances on every query, and IPI delivery that is recorded instead
//! of performed. Context switching is deliberately unavailable; host tests
//! exercise everything up to (but not through) the low-level switch.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::config::MAX_CPUS;

static INTR_ENABLED: AtomicBool = AtomicBool::new(true);

static TICK: AtomicU64 = AtomicU64::new(1);

static IPI_SENT: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];

/// Simulated hart id; the host is always hart 0.
#[inline]
pub fn cpu_id() -> usize {
    0
}

#[inline]
pub fn intr_on() {
    INTR_ENABLED.store(true, Ordering::Release);
}

#[inline]
pub fn intr_off() {
    INTR_ENABLED.store(false, Ordering::Release);
}

#[inline]
pub fn intr_get() -> bool {
    INTR_ENABLED.load(Ordering::Acquire)
}

/// Simulated monotonic clock. Each query advances the timebase by one tick,
/// so successive samples are strictly increasing.
#[inline]
pub fn monotonic_tick() -> u64 {
    TICK.fetch_add(1, Ordering::Relaxed)
}

/// Advance the simulated clock by `n` ticks (test helper).
pub fn advance_ticks(n: u64) {
    TICK.fetch_add(n, Ordering::Relaxed);
}

pub fn wait_for_interrupt() {
    std::thread::yield_now();
}

/// Record an IPI instead of sending one; tests assert on [`ipi_count`].
pub fn send_resched_ipi(cpu: usize) {
    IPI_SENT[cpu].fetch_add(1, Ordering::Relaxed);
}

/// Number of reschedule IPIs "sent" to `cpu` since process start.
pub fn ipi_count(cpu: usize) -> usize {
    IPI_SENT[cpu].load(Ordering::Relaxed)
}

/// Saved-register record; empty on the host.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context;

impl Context {
    pub const fn zeroed() -> Self {
        Self
    }

    pub fn prepare(&mut self, _entry: usize, _stack_top: usize) {}
}

/// Context switching never happens in the host simulation.
///
/// # Safety
/// Never returns; callable from any context.
pub unsafe fn switch_context(_old: *mut Context, _new: *const Context) {
    unreachable!("context switching is not available on the host simulator");
}
