//! Thread lifecycle above the scheduler: the thread table, exit/reap, and
//! the seams to external subsystems.

pub mod exit;
pub mod hooks;
pub mod table;

pub use exit::{exit_thread, vfork_wait, wait_for_child};
pub use table::{dump_threads, init_thread, lookup, thread_count};
