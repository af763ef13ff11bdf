//! Kernel context switching.
//!
//! A [`Context`] holds only the callee-saved register file plus `ra`/`sp`;
//! everything caller-saved is already on the stack when [`switch_context`]
//! is reached, because it is an ordinary `extern "C"` call.

/// Saved registers for kernel context switches.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    /// Return address: where the thread resumes.
    pub ra: usize,
    /// Kernel stack pointer.
    pub sp: usize,
    /// Callee-saved s0..s11.
    pub s: [usize; 12],
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }

    /// Aim a fresh context at `entry` with the given stack top. The first
    /// switch into it "returns" to `entry`.
    pub fn prepare(&mut self, entry: usize, stack_top: usize) {
        *self = Self::zeroed();
        self.ra = entry;
        self.sp = stack_top;
    }
}

core::arch::global_asm!(
    r#"
.section .text
.globl __hartos_swtch
.align 4
# __hartos_swtch(a0: *mut Context, a1: *const Context)
# Save the current callee-saved register file into *a0, load *a1, return
# on the new stack.
__hartos_swtch:
    sd ra,   0(a0)
    sd sp,   8(a0)
    sd s0,  16(a0)
    sd s1,  24(a0)
    sd s2,  32(a0)
    sd s3,  40(a0)
    sd s4,  48(a0)
    sd s5,  56(a0)
    sd s6,  64(a0)
    sd s7,  72(a0)
    sd s8,  80(a0)
    sd s9,  88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)

    ld ra,   0(a1)
    ld sp,   8(a1)
    ld s0,  16(a1)
    ld s1,  24(a1)
    ld s2,  32(a1)
    ld s3,  40(a1)
    ld s4,  48(a1)
    ld s5,  56(a1)
    ld s6,  64(a1)
    ld s7,  72(a1)
    ld s8,  80(a1)
    ld s9,  88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)
    ret
"#
);

extern "C" {
    fn __hartos_swtch(old: *mut Context, new: *const Context);
}

/// Switch from the current context to `new`, saving into `old`.
///
/// # Safety
/// `old` and `new` must point to valid, distinct contexts; `new` must have
/// been prepared by [`Context::prepare`] or filled by a previous switch.
/// Interrupts must be disabled and the owning run-queue lock held, per the
/// scheduler's switch protocol.
pub unsafe fn switch_context(old: *mut Context, new: *const Context) {
    // SAFETY: delegated to the caller's contract above.
    unsafe { __hartos_swtch(old, new) }
}
