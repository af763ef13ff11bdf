//! Priority classes: a vtable of scheduling operations per run-queue slot.
//!
//! Each of the 64 priority-class slots is served by a [`SchedClassOps`]
//! vtable registered globally; the per-CPU storage a class works on lives
//! in the run queue ([`super::runqueue::ClassRq`]). Two classes are built
//! in: FIFO (slots 0..=62) and idle (slot 63, single occupant, always
//! ready). Registering over an occupied slot is fatal.

use core::sync::atomic::{AtomicPtr, Ordering};

use crate::{
    config::{DEFAULT_TIME_SLICE, NR_SCHED_CLASSES},
    sched::{
        entity::SchedEntity,
        runqueue::RqInner,
        smp,
        task::ThreadPtr,
    },
};

/// Operations vtable for one priority class.
pub struct SchedClassOps {
    pub name: &'static str,
    /// Make `t` ready in this class's queue.
    pub enqueue: fn(&mut RqInner, usize, ThreadPtr),
    /// Remove `t` from this class's queue.
    pub dequeue: fn(&mut RqInner, usize, ThreadPtr),
    /// Choose the next thread from this class.
    pub pick_next: fn(&mut RqInner, usize) -> Option<ThreadPtr>,
    /// Return a previously running thread to the ready set.
    pub put_prev: fn(&mut RqInner, usize, ThreadPtr),
    /// A pick was skipped in favor of `t`; let the class account for it.
    pub set_next: fn(&mut RqInner, usize, ThreadPtr),
    /// Periodic timer tick against the running thread.
    pub task_tick: fn(&mut RqInner, usize, ThreadPtr),
    /// Initialize a child's scheduling metadata from its parent.
    pub task_fork: fn(Option<ThreadPtr>, ThreadPtr),
    /// The thread went zombie; release per-class resources.
    pub task_dead: fn(ThreadPtr),
    /// Voluntary yield inside the class.
    pub yield_task: fn(&mut RqInner, usize, ThreadPtr),
    /// Optional CPU-selection override for wakeups.
    pub select_rq: Option<fn(&SchedEntity, u64) -> Option<usize>>,
}

/// Global slot table; a slot's entry is fixed once registered.
static CLASS_TABLE: [AtomicPtr<SchedClassOps>; NR_SCHED_CLASSES] =
    [const { AtomicPtr::new(core::ptr::null_mut()) }; NR_SCHED_CLASSES];

/// Register `ops` to serve `slot`. Fatal if the slot is occupied.
pub fn register_class(slot: usize, ops: &'static SchedClassOps) {
    assert!(slot < NR_SCHED_CLASSES, "class slot {} out of range", slot);
    let ptr = ops as *const SchedClassOps as *mut SchedClassOps;
    if CLASS_TABLE[slot]
        .compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        panic!("scheduler class slot {} already occupied", slot);
    }
}

/// The vtable serving `slot`, if any.
pub fn class_ops(slot: usize) -> Option<&'static SchedClassOps> {
    let ptr = CLASS_TABLE[slot].load(Ordering::Acquire);
    // SAFETY: entries are only ever set to 'static vtables.
    (!ptr.is_null()).then(|| unsafe { &*ptr })
}

/// Register the built-in classes. Idempotent.
pub fn init() {
    if class_ops(0).is_some() {
        return;
    }
    for slot in 0..NR_SCHED_CLASSES - 1 {
        register_class(slot, &FIFO_CLASS);
    }
    register_class(NR_SCHED_CLASSES - 1, &IDLE_CLASS);
}

// ---------------------------------------------------------------------------
// FIFO class
// ---------------------------------------------------------------------------

fn fifo_enqueue(inner: &mut RqInner, slot: usize, t: ThreadPtr) {
    inner.class_mut(slot).queue.push_back(t);
    inner.class_mut(slot).nr += 1;
    inner.mark_ready(slot);
}

fn fifo_dequeue(inner: &mut RqInner, slot: usize, t: ThreadPtr) {
    if inner.class_mut(slot).queue.remove(t) {
        let cls = inner.class_mut(slot);
        assert!(cls.nr > 0, "fifo class count underflow");
        cls.nr -= 1;
    }
    if inner.class_mut(slot).queue.is_empty() {
        inner.clear_ready(slot);
    }
}

fn fifo_pick_next(inner: &mut RqInner, slot: usize) -> Option<ThreadPtr> {
    let picked = inner.class_mut(slot).queue.pop_front();
    if picked.is_some() {
        let cls = inner.class_mut(slot);
        assert!(cls.nr > 0, "fifo class count underflow");
        cls.nr -= 1;
    }
    if inner.class_mut(slot).queue.is_empty() {
        inner.clear_ready(slot);
    }
    picked
}

fn fifo_put_prev(inner: &mut RqInner, slot: usize, t: ThreadPtr) {
    // Round robin: a preempted thread goes to the back of its class.
    inner.class_mut(slot).queue.push_back(t);
    inner.class_mut(slot).nr += 1;
    inner.mark_ready(slot);
}

fn fifo_set_next(inner: &mut RqInner, slot: usize, t: ThreadPtr) {
    // Undo a pick that was skipped: reinstate `t` as the slot's next choice.
    inner.class_mut(slot).queue.push_front(t);
    inner.class_mut(slot).nr += 1;
    inner.mark_ready(slot);
}

fn fifo_task_tick(_inner: &mut RqInner, _slot: usize, t: ThreadPtr) {
    let se = &t.get().se;
    let left = se.time_slice.load(Ordering::Relaxed);
    if left > 1 {
        se.time_slice.store(left - 1, Ordering::Relaxed);
    } else {
        se.time_slice.store(DEFAULT_TIME_SLICE, Ordering::Relaxed);
        smp::set_need_resched(crate::arch::cpu_id());
    }
}

fn fifo_task_fork(_parent: Option<ThreadPtr>, child: ThreadPtr) {
    child
        .get()
        .se
        .time_slice
        .store(DEFAULT_TIME_SLICE, Ordering::Relaxed);
}

fn fifo_task_dead(_t: ThreadPtr) {
    // Called at the zombie transition, while the thread is still finishing
    // its last time on CPU; the final dequeue happens in that switch's
    // epilogue. The FIFO class keeps no per-thread resources to release.
}

fn fifo_yield_task(_inner: &mut RqInner, _slot: usize, t: ThreadPtr) {
    // Surrender the remaining slice; requeue order is handled by put_prev.
    t.get()
        .se
        .time_slice
        .store(DEFAULT_TIME_SLICE, Ordering::Relaxed);
}

/// The built-in FIFO class.
pub static FIFO_CLASS: SchedClassOps = SchedClassOps {
    name: "fifo",
    enqueue: fifo_enqueue,
    dequeue: fifo_dequeue,
    pick_next: fifo_pick_next,
    put_prev: fifo_put_prev,
    set_next: fifo_set_next,
    task_tick: fifo_task_tick,
    task_fork: fifo_task_fork,
    task_dead: fifo_task_dead,
    yield_task: fifo_yield_task,
    select_rq: None,
};

// ---------------------------------------------------------------------------
// Idle class
// ---------------------------------------------------------------------------

fn idle_enqueue(inner: &mut RqInner, slot: usize, t: ThreadPtr) {
    let cls = inner.class_mut(slot);
    match cls.occupant {
        None => cls.occupant = Some(t),
        Some(existing) => assert_eq!(existing, t, "second idle thread on one CPU"),
    }
    // The idle class is permanently ready: its bit is never cleared.
    inner.mark_ready(slot);
}

fn idle_dequeue(_inner: &mut RqInner, _slot: usize, _t: ThreadPtr) {
    // The idle thread never sleeps; keep it resident and ready.
}

fn idle_pick_next(inner: &mut RqInner, slot: usize) -> Option<ThreadPtr> {
    inner.class_mut(slot).occupant
}

fn idle_put_prev(_inner: &mut RqInner, _slot: usize, _t: ThreadPtr) {
    // Occupant stays in place; nothing to requeue.
}

fn idle_set_next(_inner: &mut RqInner, _slot: usize, _t: ThreadPtr) {}

fn idle_task_tick(_inner: &mut RqInner, _slot: usize, _t: ThreadPtr) {}

fn idle_task_fork(_parent: Option<ThreadPtr>, _child: ThreadPtr) {
    panic!("idle class cannot fork");
}

fn idle_task_dead(_t: ThreadPtr) {
    panic!("idle thread exited");
}

fn idle_yield_task(_inner: &mut RqInner, _slot: usize, _t: ThreadPtr) {}

fn idle_select_rq(se: &SchedEntity, _online: u64) -> Option<usize> {
    // Idle threads are pinned; their affinity names exactly one CPU.
    let mask = se.affinity().mask();
    (mask != 0).then(|| mask.trailing_zeros() as usize)
}

/// The built-in idle class (slot 63).
pub static IDLE_CLASS: SchedClassOps = SchedClassOps {
    name: "idle",
    enqueue: idle_enqueue,
    dequeue: idle_dequeue,
    pick_next: idle_pick_next,
    put_prev: idle_put_prev,
    set_next: idle_set_next,
    task_tick: idle_task_tick,
    task_fork: idle_task_fork,
    task_dead: idle_task_dead,
    yield_task: idle_yield_task,
    select_rq: Some(idle_select_rq),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registration_idempotent() {
        let _g = crate::test_support::lock();
        init();
        init();
        assert_eq!(class_ops(0).unwrap().name, "fifo");
        assert_eq!(class_ops(62).unwrap().name, "fifo");
        assert_eq!(class_ops(63).unwrap().name, "idle");
    }

    #[test]
    fn test_occupied_slot_is_fatal() {
        let _g = crate::test_support::lock();
        init();
        let r = std::panic::catch_unwind(|| register_class(0, &FIFO_CLASS));
        assert!(r.is_err());
    }
}
