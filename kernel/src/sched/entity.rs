//! Scheduling entity: the per-thread scheduling metadata block.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::{
    config::{DEFAULT_TIME_SLICE, NR_SCHED_CLASSES},
    sched::{runqueue::RunQueue, task::Thread},
    sync::RawSpinLock,
};

/// Thread priority. Lower numbers run first. The high 6 bits select the
/// priority class (the run-queue slot); the low 2 bits only break ties
/// inside a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub u8);

impl Priority {
    /// Default kernel-thread priority, middle of the range.
    pub const DEFAULT: Priority = Priority(0x80);
    /// Idle-class priority; class 63 is reserved for the idle class.
    pub const IDLE: Priority = Priority(0xFF);

    /// Priority-class slot this priority maps to.
    #[inline]
    pub fn class(self) -> usize {
        (self.0 >> 2) as usize
    }
}

/// CPU affinity mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSet {
    mask: u64,
}

impl CpuSet {
    /// All CPUs allowed.
    pub const fn all() -> Self {
        Self { mask: !0u64 }
    }

    /// Single CPU.
    pub const fn single(cpu: usize) -> Self {
        Self { mask: 1 << cpu }
    }

    pub const fn from_mask(mask: u64) -> Self {
        Self { mask }
    }

    pub const fn mask(self) -> u64 {
        self.mask
    }

    pub fn contains(self, cpu: usize) -> bool {
        cpu < 64 && (self.mask & (1 << cpu)) != 0
    }

    pub fn add(&mut self, cpu: usize) {
        self.mask |= 1 << cpu;
    }

    pub fn remove(&mut self, cpu: usize) {
        self.mask &= !(1 << cpu);
    }

    pub fn is_empty(self) -> bool {
        self.mask == 0
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Per-thread scheduling metadata.
///
/// `on_rq`/`on_cpu`/`cpu`/`rq` transitions are serialized by the owning
/// run queue's lock; `pi_lock` serializes racing wakers. A thread that is
/// running keeps `on_rq = 1` ("logically queued") even though its class
/// queue no longer links it; only the dequeue in `context_switch_finish`
/// clears it.
pub struct SchedEntity {
    /// Scheduling priority.
    prio: AtomicU8,
    /// Allowed CPUs.
    affinity: AtomicU64,
    /// Run queue this entity belongs to; null when not enqueued.
    pub rq: AtomicPtr<RunQueue>,
    /// CPU the entity last ran (or is queued) on.
    pub cpu: AtomicU32,
    /// Logically queued on a run queue.
    pub on_rq: AtomicBool,
    /// Physically executing on `cpu` (set until the context switch that
    /// schedules it out completes).
    pub on_cpu: AtomicBool,
    /// Link in a per-CPU wake list.
    pub wake_next: AtomicPtr<Thread>,
    /// Intrusive links in a class run list (run-queue lock held).
    pub run_next: AtomicPtr<Thread>,
    pub run_prev: AtomicPtr<Thread>,
    /// Serializes concurrent wakers of this thread; ordered before any
    /// run-queue lock.
    pub pi_lock: RawSpinLock,
    /// Timer-tick budget for the FIFO class.
    pub time_slice: AtomicU32,
}

impl SchedEntity {
    pub const fn new(prio: Priority, affinity: CpuSet) -> Self {
        Self {
            prio: AtomicU8::new(prio.0),
            affinity: AtomicU64::new(affinity.mask()),
            rq: AtomicPtr::new(core::ptr::null_mut()),
            cpu: AtomicU32::new(0),
            on_rq: AtomicBool::new(false),
            on_cpu: AtomicBool::new(false),
            wake_next: AtomicPtr::new(core::ptr::null_mut()),
            run_next: AtomicPtr::new(core::ptr::null_mut()),
            run_prev: AtomicPtr::new(core::ptr::null_mut()),
            pi_lock: RawSpinLock::new("se_pi"),
            time_slice: AtomicU32::new(DEFAULT_TIME_SLICE),
        }
    }

    pub fn priority(&self) -> Priority {
        Priority(self.prio.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, prio: Priority) {
        assert!(prio.class() < NR_SCHED_CLASSES);
        self.prio.store(prio.0, Ordering::Relaxed);
    }

    pub fn affinity(&self) -> CpuSet {
        CpuSet::from_mask(self.affinity.load(Ordering::Relaxed))
    }

    pub fn set_affinity(&self, set: CpuSet) {
        self.affinity.store(set.mask(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_class_split() {
        assert_eq!(Priority(0).class(), 0);
        assert_eq!(Priority(3).class(), 0);
        assert_eq!(Priority(4).class(), 1);
        assert_eq!(Priority(5).class(), 1);
        assert_eq!(Priority::IDLE.class(), 63);
        assert_eq!(Priority::DEFAULT.class(), 32);
    }

    #[test]
    fn test_cpuset_ops() {
        let mut set = CpuSet::single(2);
        assert!(set.contains(2));
        assert!(!set.contains(3));
        set.add(3);
        assert!(set.contains(3));
        set.remove(2);
        assert!(!set.contains(2));
        assert!(CpuSet::all().contains(63));
    }
}
