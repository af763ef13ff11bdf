//! Architecture abstraction layer.
//!
//! The lifecycle core consumes a narrow surface: hart identity, interrupt
//! gating, a monotonic tick counter, the context-switch primitive, and the
//! reschedule IPI. On `riscv64` bare metal these are real; everywhere else
//! (notably the host target the unit tests run on) they come from the
//! simulation in [`host`], which is single-hart and never context-switches.

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod riscv64;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use riscv64::{
    cpu_id, intr_get, intr_off, intr_on, monotonic_tick, send_resched_ipi, switch_context,
    wait_for_interrupt, Context,
};

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub mod host;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub use host::{
    cpu_id, intr_get, intr_off, intr_on, monotonic_tick, send_resched_ipi, switch_context,
    wait_for_interrupt, Context,
};
