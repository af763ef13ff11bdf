//! RISC-V 64 (RV64GC, S-mode, SBI environment) architecture support.

pub mod context;
pub mod sbi;

pub use context::{switch_context, Context};

/// Current hart id.
///
/// By kernel convention `tp` holds the hart id while in supervisor mode;
/// boot code on each hart stores it there before entering Rust.
#[inline]
pub fn cpu_id() -> usize {
    let id: usize;
    // SAFETY: reading tp has no side effects.
    unsafe {
        core::arch::asm!("mv {}, tp", out(reg) id, options(nomem, nostack));
    }
    id
}

/// Enable supervisor interrupts on this hart.
#[inline]
pub fn intr_on() {
    // SAFETY: flipping SSTATUS.SIE only affects interrupt delivery on the
    // local hart.
    unsafe { riscv::register::sstatus::set_sie() }
}

/// Disable supervisor interrupts on this hart.
#[inline]
pub fn intr_off() {
    // SAFETY: see `intr_on`.
    unsafe { riscv::register::sstatus::clear_sie() }
}

/// Are supervisor interrupts currently enabled?
#[inline]
pub fn intr_get() -> bool {
    riscv::register::sstatus::read().sie()
}

/// Monotonic 64-bit tick counter.
///
/// Reads the `time` CSR, which the platform timer drives; it never moves
/// backwards and advances across timer interrupts.
#[inline]
pub fn monotonic_tick() -> u64 {
    riscv::register::time::read64()
}

/// Park the hart until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    riscv::asm::wfi();
}

/// Send a reschedule IPI to a single hart.
///
/// Delivery latency is a hint only; nothing in the scheduler depends on the
/// IPI arriving promptly.
pub fn send_resched_ipi(cpu: usize) {
    sbi::send_ipi(1 << cpu, 0);
}
