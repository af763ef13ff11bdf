//! Per-CPU run queues.
//!
//! Each CPU owns one [`RunQueue`]: a spinlock-guarded array of 64
//! priority-class slots with a two-layer ready bitmask (8-bit top mask over
//! eight 8-bit groups of the 64-bit secondary mask), plus a lock-free wake
//! list for threads woken while still mid-context-switch on this CPU.
//!
//! Invariant: top bit `g` is set iff any bit of secondary group `g` is set
//! iff at least one class queue in that group is non-empty.

use core::{cell::UnsafeCell, ptr, sync::atomic::Ordering};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64};

use crate::{
    arch,
    config::{MAX_CPUS, NR_SCHED_CLASSES},
    sched::{
        class::{self},
        entity::SchedEntity,
        smp,
        task::{Thread, ThreadPtr},
    },
    sync::RawSpinLock,
};

/// Intrusive FIFO of threads linked through their run-list links.
pub struct RunList {
    head: *mut Thread,
    tail: *mut Thread,
    len: u32,
}

impl RunList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn push_back(&mut self, t: ThreadPtr) {
        let se = &t.get().se;
        debug_assert!(
            se.run_next.load(Ordering::Relaxed).is_null()
                && se.run_prev.load(Ordering::Relaxed).is_null(),
            "thread already on a run list"
        );
        se.run_prev.store(self.tail, Ordering::Relaxed);
        se.run_next.store(ptr::null_mut(), Ordering::Relaxed);
        if self.tail.is_null() {
            self.head = t.as_raw();
        } else {
            // SAFETY: tail is a valid linked thread (run-queue lock held).
            unsafe { (*self.tail).se.run_next.store(t.as_raw(), Ordering::Relaxed) };
        }
        self.tail = t.as_raw();
        self.len += 1;
    }

    /// Reinstate `t` as the next pick (front of the FIFO).
    pub fn push_front(&mut self, t: ThreadPtr) {
        let se = &t.get().se;
        debug_assert!(
            se.run_next.load(Ordering::Relaxed).is_null()
                && se.run_prev.load(Ordering::Relaxed).is_null(),
            "thread already on a run list"
        );
        se.run_next.store(self.head, Ordering::Relaxed);
        se.run_prev.store(ptr::null_mut(), Ordering::Relaxed);
        if self.head.is_null() {
            self.tail = t.as_raw();
        } else {
            // SAFETY: head is a valid linked thread (run-queue lock held).
            unsafe { (*self.head).se.run_prev.store(t.as_raw(), Ordering::Relaxed) };
        }
        self.head = t.as_raw();
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<ThreadPtr> {
        let t = ThreadPtr::from_raw(self.head)?;
        self.unlink(t);
        Some(t)
    }

    pub fn front(&self) -> Option<ThreadPtr> {
        ThreadPtr::from_raw(self.head)
    }

    pub fn remove(&mut self, t: ThreadPtr) -> bool {
        // Membership test: the thread is linked or is the single head.
        let se = &t.get().se;
        let linked = !se.run_next.load(Ordering::Relaxed).is_null()
            || !se.run_prev.load(Ordering::Relaxed).is_null()
            || self.head == t.as_raw();
        if !linked {
            return false;
        }
        self.unlink(t);
        true
    }

    fn unlink(&mut self, t: ThreadPtr) {
        let se = &t.get().se;
        let prev = se.run_prev.load(Ordering::Relaxed);
        let next = se.run_next.load(Ordering::Relaxed);
        if prev.is_null() {
            self.head = next;
        } else {
            // SAFETY: linked neighbors are valid under the run-queue lock.
            unsafe { (*prev).se.run_next.store(next, Ordering::Relaxed) };
        }
        if next.is_null() {
            self.tail = prev;
        } else {
            // SAFETY: as above.
            unsafe { (*next).se.run_prev.store(prev, Ordering::Relaxed) };
        }
        se.run_next.store(ptr::null_mut(), Ordering::Relaxed);
        se.run_prev.store(ptr::null_mut(), Ordering::Relaxed);
        assert!(self.len > 0, "run list length underflow");
        self.len -= 1;
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-CPU storage for one priority-class slot.
pub struct ClassRq {
    /// FIFO-style classes link ready threads here.
    pub queue: RunList,
    /// The idle class parks its single occupant here.
    pub occupant: Option<ThreadPtr>,
    /// Threads accounted to this class.
    pub nr: u32,
}

impl ClassRq {
    const fn new() -> Self {
        Self {
            queue: RunList::new(),
            occupant: None,
            nr: 0,
        }
    }
}

/// Lock-guarded interior of a run queue.
pub struct RqInner {
    classes: [ClassRq; NR_SCHED_CLASSES],
    /// Top mask: bit `g` covers secondary bits `g*8..g*8+8`.
    top_mask: u8,
    /// Secondary mask: bit `c` set iff class slot `c` is ready.
    group_mask: u64,
    /// Thread currently running on this CPU.
    pub current: Option<ThreadPtr>,
    /// This CPU's idle thread.
    pub idle: Option<ThreadPtr>,
    /// Departing thread handed across the context switch to
    /// `context_switch_finish` on the incoming stack.
    pub prev_departing: Option<ThreadPtr>,
    /// Runnable threads accounted to this queue (running included).
    pub nr_running: u32,
}

impl RqInner {
    const fn new() -> Self {
        Self {
            classes: [const { ClassRq::new() }; NR_SCHED_CLASSES],
            top_mask: 0,
            group_mask: 0,
            current: None,
            idle: None,
            prev_departing: None,
            nr_running: 0,
        }
    }

    pub fn class_mut(&mut self, slot: usize) -> &mut ClassRq {
        &mut self.classes[slot]
    }

    pub fn mark_ready(&mut self, slot: usize) {
        self.group_mask |= 1u64 << slot;
        self.top_mask |= 1u8 << (slot / 8);
    }

    pub fn clear_ready(&mut self, slot: usize) {
        self.group_mask &= !(1u64 << slot);
        let group = slot / 8;
        if (self.group_mask >> (group * 8)) & 0xFF == 0 {
            self.top_mask &= !(1u8 << group);
        }
    }

    pub fn is_ready(&self, slot: usize) -> bool {
        self.group_mask & (1u64 << slot) != 0
    }

    /// Lowest-numbered ready class: find the lowest set bit of the top
    /// mask, extract that group's byte from the secondary mask, find its
    /// lowest set bit.
    pub fn pick_class(&self) -> Option<usize> {
        if self.top_mask == 0 {
            return None;
        }
        let group = self.top_mask.trailing_zeros() as usize;
        let byte = ((self.group_mask >> (group * 8)) & 0xFF) as u8;
        debug_assert!(byte != 0, "top mask bit set over empty group");
        Some(group * 8 + byte.trailing_zeros() as usize)
    }
}

/// One CPU's run queue.
pub struct RunQueue {
    pub lock: RawSpinLock,
    inner: UnsafeCell<RqInner>,
    /// Lock-free LIFO of threads pending enqueue on this CPU.
    wake_list: AtomicPtr<Thread>,
    /// Mirror of `nr_running` for lock-free CPU selection.
    pub nr_queued: AtomicU32,
    pub nr_switches: AtomicU64,
}

// SAFETY: `inner` is only accessed with `lock` held.
unsafe impl Send for RunQueue {}
unsafe impl Sync for RunQueue {}

impl RunQueue {
    const fn new() -> Self {
        Self {
            lock: RawSpinLock::new("rq"),
            inner: UnsafeCell::new(RqInner::new()),
            wake_list: AtomicPtr::new(ptr::null_mut()),
            nr_queued: AtomicU32::new(0),
            nr_switches: AtomicU64::new(0),
        }
    }

    /// Access the interior.
    ///
    /// # Safety
    /// The caller must hold `self.lock`. The scheduler holds it manually
    /// across context switches, which is why this is not guard-based.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn inner_mut(&self) -> &mut RqInner {
        debug_assert!(self.lock.holding(), "run queue touched without its lock");
        // SAFETY: lock held per the caller contract.
        unsafe { &mut *self.inner.get() }
    }
}

static RUN_QUEUES: [RunQueue; MAX_CPUS] = [const { RunQueue::new() }; MAX_CPUS];

/// The run queue owned by `cpu`.
pub fn rq(cpu: usize) -> &'static RunQueue {
    &RUN_QUEUES[cpu]
}

/// Which CPU owns `rq`.
pub fn rq_cpu(rq: &RunQueue) -> usize {
    let base = RUN_QUEUES.as_ptr() as usize;
    let off = rq as *const RunQueue as usize - base;
    off / core::mem::size_of::<RunQueue>()
}

/// Enqueue `t` on `rq` (lock held): class enqueue plus the SE bookkeeping.
/// The `cpu_id` store is a release so a racing waker that reads it sees a
/// fully published enqueue.
pub(crate) fn enqueue_thread(rq: &RunQueue, inner: &mut RqInner, t: ThreadPtr) {
    let se = &t.get().se;
    let prio = se.priority();
    let slot = prio.class();
    let ops = class_ops_or_die(slot, prio.0);
    (ops.enqueue)(inner, slot, t);
    inner.nr_running += 1;
    rq.nr_queued.store(inner.nr_running, Ordering::Relaxed);
    se.on_rq.store(true, Ordering::Relaxed);
    se.rq.store(rq as *const _ as *mut RunQueue, Ordering::Relaxed);
    se.cpu.store(rq_cpu(rq) as u32, Ordering::Release);
}

/// Dequeue `t` from `rq` (lock held); clears the SE's queue linkage.
pub(crate) fn dequeue_thread(rq: &RunQueue, inner: &mut RqInner, t: ThreadPtr) {
    let se = &t.get().se;
    let slot = se.priority().class();
    let ops = class_ops_or_die(slot, se.priority().0);
    (ops.dequeue)(inner, slot, t);
    assert!(inner.nr_running > 0, "run queue count underflow");
    inner.nr_running -= 1;
    rq.nr_queued.store(inner.nr_running, Ordering::Relaxed);
    se.on_rq.store(false, Ordering::Relaxed);
    se.rq.store(ptr::null_mut(), Ordering::Relaxed);
}

/// Pick the next thread: lowest ready class, class-specific choice. The
/// picked thread leaves its class queue but keeps `on_rq = 1`.
pub(crate) fn pick_next(inner: &mut RqInner) -> Option<ThreadPtr> {
    let slot = inner.pick_class()?;
    let ops = class_ops_or_die(slot, (slot << 2) as u8);
    (ops.pick_next)(inner, slot)
}

/// Return a still-runnable previous thread to its class's ready set.
pub(crate) fn put_prev(inner: &mut RqInner, t: ThreadPtr) {
    let se = &t.get().se;
    let slot = se.priority().class();
    let ops = class_ops_or_die(slot, se.priority().0);
    (ops.put_prev)(inner, slot, t);
}

/// Undo a pick the scheduler decided to skip: `t` becomes the slot's next
/// choice again.
pub(crate) fn set_next(inner: &mut RqInner, t: ThreadPtr) {
    let se = &t.get().se;
    let slot = se.priority().class();
    let ops = class_ops_or_die(slot, se.priority().0);
    (ops.set_next)(inner, slot, t);
}

fn class_ops_or_die(slot: usize, prio: u8) -> &'static class::SchedClassOps {
    class::class_ops(slot)
        .unwrap_or_else(|| panic!("priority {:#x} maps to unregistered class {}", prio, slot))
}

// ---------------------------------------------------------------------------
// Wake list
// ---------------------------------------------------------------------------

/// Push `t` onto `rq`'s wake list (lock-free, any CPU).
///
/// Caller must have claimed the thread via the `Wakening` transition, which
/// makes it the only pusher.
pub(crate) fn wake_list_push(rq: &RunQueue, t: ThreadPtr) {
    let se = &t.get().se;
    loop {
        let head = rq.wake_list.load(Ordering::Relaxed);
        se.wake_next.store(head, Ordering::Relaxed);
        if rq
            .wake_list
            .compare_exchange_weak(head, t.as_raw(), Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// Drain `rq`'s wake list, enqueueing each thread on this CPU's classes.
/// Called by the owning CPU with the lock *not* held, only after any
/// in-progress context switch has finished (`on_cpu` already cleared).
pub(crate) fn wake_list_drain(rq: &RunQueue) -> usize {
    let mut raw = rq.wake_list.swap(ptr::null_mut(), Ordering::Acquire);
    let mut drained = 0;
    while let Some(t) = ThreadPtr::from_raw(raw) {
        let next = t.get().se.wake_next.swap(ptr::null_mut(), Ordering::Relaxed);
        rq.lock.acquire();
        // SAFETY: lock acquired on the line above.
        let inner = unsafe { rq.inner_mut() };
        enqueue_thread(rq, inner, t);
        rq.lock.release();
        drained += 1;
        raw = next;
    }
    drained
}

/// Is `rq`'s wake list non-empty?
pub(crate) fn wake_list_pending(rq: &RunQueue) -> bool {
    !rq.wake_list.load(Ordering::Acquire).is_null()
}

// ---------------------------------------------------------------------------
// CPU selection
// ---------------------------------------------------------------------------

/// Choose a run queue for waking `se`: the class override first, then the
/// current CPU if allowed, then the least-loaded allowed online CPU, then
/// any online CPU.
pub fn select_task_rq(se: &SchedEntity) -> usize {
    let online = smp::online_mask();
    debug_assert!(online != 0, "no online CPUs");

    if let Some(hook) = class::class_ops(se.priority().class()).and_then(|ops| ops.select_rq) {
        if let Some(cpu) = hook(se, online) {
            if smp::cpu_online(cpu) {
                return cpu;
            }
        }
    }

    let mut allowed = se.affinity().mask() & online;
    if allowed == 0 {
        // Affinity excludes every active CPU; fall back to all active.
        allowed = online;
    }

    let me = arch::cpu_id();
    if allowed & (1 << me) != 0 {
        return me;
    }

    let mut best = allowed.trailing_zeros() as usize;
    let mut best_load = u32::MAX;
    let mut mask = allowed;
    while mask != 0 {
        let cpu = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        let load = rq(cpu).nr_queued.load(Ordering::Relaxed);
        if load < best_load {
            best_load = load;
            best = cpu;
        }
    }
    best
}

/// Per-CPU ready counts (debug surface).
pub fn dump_runqueues() {
    for cpu in 0..MAX_CPUS {
        if !smp::cpu_online(cpu) {
            continue;
        }
        let q = rq(cpu);
        println!(
            "cpu{}: {} queued, {} switches, wake list {}",
            cpu,
            q.nr_queued.load(Ordering::Relaxed),
            q.nr_switches.load(Ordering::Relaxed),
            if wake_list_pending(q) { "pending" } else { "empty" },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::entity::{CpuSet, Priority};

    fn mk(name: &str) -> ThreadPtr {
        ThreadPtr::leak(
            crate::sched::Thread::new_kthread(name, Priority::DEFAULT, |_| 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_run_list_order_and_removal() {
        let _g = crate::test_support::lock();
        let (a, b, c) = (mk("a"), mk("b"), mk("c"));
        let mut list = RunList::new();
        list.push_back(a);
        list.push_back(b);
        list.push_back(c);
        assert_eq!(list.len(), 3);
        assert_eq!(list.front(), Some(a));

        assert!(list.remove(b));
        assert!(!list.remove(b));
        assert_eq!(list.pop_front(), Some(a));

        // push_front reinstates ahead of existing entries.
        list.push_front(a);
        assert_eq!(list.pop_front(), Some(a));
        assert_eq!(list.pop_front(), Some(c));
        assert_eq!(list.pop_front(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_select_task_rq_honors_affinity() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        let t = mk("pinned");

        // Current CPU allowed: stay local.
        assert_eq!(select_task_rq(&t.get().se), 0);

        // Pinned to an online remote CPU: follow the pin.
        crate::sched::smp::set_online(2);
        t.get().se.set_affinity(CpuSet::single(2));
        assert_eq!(select_task_rq(&t.get().se), 2);

        // Pinned to an offline CPU: fall back to the active set.
        crate::sched::smp::set_offline(2);
        assert_eq!(select_task_rq(&t.get().se), 0);

        t.get().se.set_affinity(CpuSet::all());
    }

    #[test]
    fn test_bitmask_two_layer_invariant() {
        let mut inner = RqInner::new();
        assert_eq!(inner.pick_class(), None);

        inner.mark_ready(0);
        inner.mark_ready(9);
        inner.mark_ready(63);
        assert_eq!(inner.pick_class(), Some(0));

        inner.clear_ready(0);
        assert_eq!(inner.pick_class(), Some(9));
        // Group 0 byte is now empty, so its top bit must be clear.
        assert_eq!(inner.top_mask & 1, 0);

        inner.clear_ready(9);
        assert_eq!(inner.pick_class(), Some(63));
        inner.clear_ready(63);
        assert_eq!(inner.pick_class(), None);
        assert_eq!(inner.top_mask, 0);
        assert_eq!(inner.group_mask, 0);
    }

    #[test]
    fn test_pick_class_prefers_lowest_in_group() {
        let mut inner = RqInner::new();
        inner.mark_ready(17);
        inner.mark_ready(19);
        assert_eq!(inner.pick_class(), Some(17));
        inner.clear_ready(17);
        assert_eq!(inner.pick_class(), Some(19));
        inner.clear_ready(19);
    }

    #[test]
    fn test_rq_cpu_round_trip() {
        for cpu in 0..MAX_CPUS {
            assert_eq!(rq_cpu(rq(cpu)), cpu);
        }
    }
}
