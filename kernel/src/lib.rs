//! HartOS kernel library.
//!
//! The concurrent object-lifecycle core of a small RISC-V SMP kernel:
//! epoch-based deferred reclamation ([`sync::rcu`]), per-CPU multi-priority
//! run queues with a lock-free cross-CPU wake list ([`sched`]), the
//! sleeping-thread queues every blocking operation is built on
//! ([`sched::waitqueue`]), and the RCU-protected device registry
//! ([`devices`]).
//!
//! Bare-metal behavior is selected with `target_os = "none"`; on any other
//! target the crate builds against `std` with a simulated single-hart
//! architecture layer so the unit tests run under the standard harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: link std so tests can use the system allocator and threads.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod devices;
pub mod error;
pub mod klog;
pub mod mm;
pub mod process;
pub mod sched;
pub mod sync;

pub use error::{KernelError, KernelResult};
pub use sched::{Priority, Thread, ThreadPtr, ThreadState, Tid};

/// One-time core initialization: logging and the scheduler classes.
/// Idempotent; each CPU additionally runs [`sched::bootstrap_this_cpu`] on
/// itself before scheduling.
pub fn init_core() {
    klog::init(log::LevelFilter::Info);
    sched::init();
}

/// Serializes unit tests that touch the global scheduler/RCU/registry
/// state; the host simulator maps every test thread to CPU 0, so tests
/// must not interleave.
#[cfg(all(test, not(target_os = "none")))]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static LOCK: Mutex<()> = Mutex::new(());

    pub fn lock() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
