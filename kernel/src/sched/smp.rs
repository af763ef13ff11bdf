//! Per-CPU state and CPU bookkeeping.
//!
//! Each CPU owns one [`PerCpu`] slot. Remote CPUs may only touch the fields
//! documented as cross-CPU (`online`, `current` loads); everything else is
//! local-CPU-only or protected elsewhere. The run queues themselves live in
//! [`super::runqueue`].

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::{arch, config::MAX_CPUS, sched::task::Thread, sched::task::ThreadPtr};

/// Per-CPU state block.
pub struct PerCpu {
    /// CPU participates in scheduling and RCU.
    pub online: AtomicBool,
    /// Spinlock nesting depth (`push_off` count).
    pub noff: AtomicU32,
    /// Were interrupts enabled before the outermost `push_off`?
    pub intena: AtomicBool,
    /// Interrupt handler nesting depth.
    pub irq_depth: AtomicU32,
    /// Preemption-disable depth (RCU readers, short critical windows).
    pub preempt_count: AtomicU32,
    /// A reschedule was requested (timer tick, wakeup IPI).
    pub need_resched: AtomicBool,
    /// Thread currently executing on this CPU.
    pub current: AtomicPtr<Thread>,
    /// This CPU's idle thread.
    pub idle: AtomicPtr<Thread>,
    /// RCU nesting before `current` exists (early boot only).
    pub boot_rcu_nesting: AtomicU32,
}

impl PerCpu {
    const fn new() -> Self {
        Self {
            online: AtomicBool::new(false),
            noff: AtomicU32::new(0),
            intena: AtomicBool::new(false),
            irq_depth: AtomicU32::new(0),
            preempt_count: AtomicU32::new(0),
            need_resched: AtomicBool::new(false),
            current: AtomicPtr::new(core::ptr::null_mut()),
            idle: AtomicPtr::new(core::ptr::null_mut()),
            boot_rcu_nesting: AtomicU32::new(0),
        }
    }
}

static PER_CPU: [PerCpu; MAX_CPUS] = [const { PerCpu::new() }; MAX_CPUS];

/// Mask of online CPUs, mirrored from the per-CPU flags for cheap reads.
static ONLINE_MASK: AtomicU64 = AtomicU64::new(0);

/// Per-CPU slot for `cpu`.
pub fn per_cpu(cpu: usize) -> &'static PerCpu {
    &PER_CPU[cpu]
}

/// This CPU's slot.
pub fn this_cpu() -> &'static PerCpu {
    &PER_CPU[arch::cpu_id()]
}

/// Mark a CPU as participating in scheduling and RCU.
pub fn set_online(cpu: usize) {
    PER_CPU[cpu].online.store(true, Ordering::Release);
    ONLINE_MASK.fetch_or(1 << cpu, Ordering::AcqRel);
}

/// Remove a CPU from the active set (tests and hot-unplug only).
pub fn set_offline(cpu: usize) {
    PER_CPU[cpu].online.store(false, Ordering::Release);
    ONLINE_MASK.fetch_and(!(1 << cpu), Ordering::AcqRel);
}

pub fn cpu_online(cpu: usize) -> bool {
    cpu < MAX_CPUS && PER_CPU[cpu].online.load(Ordering::Acquire)
}

/// Bitmask of online CPUs.
pub fn online_mask() -> u64 {
    ONLINE_MASK.load(Ordering::Acquire)
}

/// Thread currently running on this CPU, if the scheduler is up.
pub fn current_thread() -> Option<ThreadPtr> {
    ThreadPtr::from_raw(this_cpu().current.load(Ordering::Acquire))
}

/// Thread currently running on `cpu`, if any.
pub fn current_thread_on(cpu: usize) -> Option<ThreadPtr> {
    ThreadPtr::from_raw(per_cpu(cpu).current.load(Ordering::Acquire))
}

pub(crate) fn set_current(t: ThreadPtr) {
    this_cpu().current.store(t.as_raw(), Ordering::Release);
}

/// Disable preemption on this CPU (nesting-counted).
pub fn preempt_disable() {
    this_cpu().preempt_count.fetch_add(1, Ordering::Relaxed);
}

/// Re-enable preemption.
pub fn preempt_enable() {
    let prev = this_cpu().preempt_count.fetch_sub(1, Ordering::Relaxed);
    assert!(prev >= 1, "unbalanced preempt_enable");
}

pub fn preempt_depth() -> u32 {
    this_cpu().preempt_count.load(Ordering::Relaxed)
}

/// Called by the trap layer on interrupt entry/exit.
pub fn irq_enter() {
    this_cpu().irq_depth.fetch_add(1, Ordering::Relaxed);
}

pub fn irq_exit() {
    let prev = this_cpu().irq_depth.fetch_sub(1, Ordering::Relaxed);
    assert!(prev >= 1, "unbalanced irq_exit");
}

/// Are we in interrupt context on this CPU?
pub fn in_interrupt() -> bool {
    this_cpu().irq_depth.load(Ordering::Relaxed) > 0
}

/// Request a reschedule on this CPU at the next opportunity.
pub fn set_need_resched(cpu: usize) {
    per_cpu(cpu).need_resched.store(true, Ordering::Release);
}

/// Consume the reschedule request flag.
pub fn take_need_resched() -> bool {
    this_cpu().need_resched.swap(false, Ordering::AcqRel)
}
