//! Scheduler core: yield, context-switch prologue/epilogue, and the wakeup
//! protocol.
//!
//! The ordering rules this module enforces:
//!
//! - A wakeup's state write happens-before the woken thread observes
//!   `Running`, established by the run-queue lock pairs.
//! - `context_switch_finish`'s release-store of `on_cpu = 0` happens-before
//!   any subsequent enqueue of that thread from any CPU; a waker that still
//!   sees `on_cpu = 1` goes through the origin CPU's wake list instead of
//!   enqueueing directly.
//! - Every context switch records a quiescent timestamp for the epoch
//!   reclaimer when the departing thread holds no reader section.

use core::sync::atomic::Ordering;

use crate::{
    arch,
    sched::{
        runqueue::{self, RunQueue},
        smp,
        task::{ThreadPtr, ThreadState, WakeMask},
        timer,
    },
    sync::{rcu, spinlock},
};

// ---------------------------------------------------------------------------
// Yield and context switch
// ---------------------------------------------------------------------------

/// Give up the CPU: drain expired timers and the wake list, pick the next
/// thread, and switch to it. The usual entry into a context switch; sleep
/// paths publish their sleeping state first and then call this.
///
/// Preconditions (fatal if violated): not in interrupt context, preemption
/// not disabled, no spinlocks held.
pub fn yield_now() {
    assert!(!smp::in_interrupt(), "yield in interrupt context");
    assert_eq!(smp::preempt_depth(), 0, "yield with preemption disabled");
    assert_eq!(spinlock::spin_depth(), 0, "yield with spinlocks held");

    // Expired timers may wake threads; flush pending remote wakeups too.
    // Both happen before the run-queue lock is taken.
    timer::drain_expired();
    let rq = runqueue::rq(arch::cpu_id());
    runqueue::wake_list_drain(rq);

    rq.lock.acquire();
    // SAFETY: lock acquired above.
    let inner = unsafe { rq.inner_mut() };
    let prev = inner.current.expect("yield before scheduler bootstrap");

    let next = runqueue::pick_next(inner).expect("idle class guarantees a pick");

    if next == prev {
        // Nothing else to run. If this was a sleep attempt, the sleep
        // aborts: restore Running and continue.
        prev.get().state.store(ThreadState::Running, Ordering::Release);
        rq.lock.release();
        return;
    }

    // A running thread of strictly higher priority keeps the CPU.
    if prev.get().state.load(Ordering::Acquire) == ThreadState::Running
        && prev.get().se.priority() < next.get().se.priority()
    {
        runqueue::set_next(inner, next);
        rq.lock.release();
        return;
    }

    context_switch_prepare(inner, next);
    inner.prev_departing = Some(prev);

    let prev_ctx = prev.get().context.get();
    let next_ctx = next.get().context.get();
    // SAFETY: both contexts are valid; interrupts are off and the run-queue
    // lock is held, per the switch protocol. The lock is released by
    // `context_switch_finish` on the incoming stack.
    unsafe { arch::switch_context(prev_ctx, next_ctx) };

    // Rescheduled (possibly on another CPU): finish the switch that
    // resumed us.
    context_switch_finish();
}

/// Prologue, run under the run-queue lock on the outgoing stack: publish
/// `next` as this CPU's current and mark it physically on-CPU. A thread in
/// `Wakening` becomes `Running` here, at pick time.
fn context_switch_prepare(inner: &mut runqueue::RqInner, next: ThreadPtr) {
    let se = &next.get().se;
    se.on_cpu.store(true, Ordering::Relaxed);
    se.cpu.store(arch::cpu_id() as u32, Ordering::Relaxed);
    next.get().state.store(ThreadState::Running, Ordering::Release);
    inner.current = Some(next);
    smp::set_current(next);
}

/// Epilogue, run on the incoming stack with the run-queue lock still held
/// from the switching-out side. Re-enqueues the previous thread if it is
/// still runnable, dequeues it if it went to sleep, records the quiescent
/// checkpoint, clears the previous thread's `on_cpu`, releases the lock,
/// and drains the wake list.
pub(crate) fn context_switch_finish() {
    let rq = runqueue::rq(arch::cpu_id());
    // SAFETY: the lock was acquired by the yield that switched into us and
    // is still held by this CPU.
    let inner = unsafe { rq.inner_mut() };

    if let Some(prev) = inner.prev_departing.take() {
        match prev.get().state.load(Ordering::Acquire) {
            // Still runnable (a waker may have stored Running mid-switch):
            // back into its class's ready set.
            ThreadState::Running | ThreadState::Wakening => {
                runqueue::put_prev(inner, prev);
            }
            // Sleeping, stopped, or dead: off the queue entirely. A waker
            // arriving from here on sees on_rq = 0.
            _ => {
                runqueue::dequeue_thread(rq, inner, prev);
            }
        }

        // The departing thread held no reader section, so this CPU passed
        // a quiescent state.
        if prev.get().rcu_nesting.load(Ordering::Relaxed) == 0 {
            rcu::quiescent_checkpoint();
        }

        // on_cpu release: after this, wakers may enqueue `prev` anywhere.
        prev.get().se.on_cpu.store(false, Ordering::Release);
    }

    rq.nr_switches.fetch_add(1, Ordering::Relaxed);
    rq.lock.release();

    // Threads woken while we were mid-switch were parked on the wake list
    // with an IPI; they become ready here, on this CPU.
    runqueue::wake_list_drain(rq);
}

// ---------------------------------------------------------------------------
// Wakeup protocol
// ---------------------------------------------------------------------------

fn lock_rq_pair(a: &'static RunQueue, b: &'static RunQueue) {
    if core::ptr::eq(a, b) {
        a.lock.acquire();
        return;
    }
    // Address order prevents AB/BA deadlock between racing wakers.
    let (first, second) = if (a as *const RunQueue) < (b as *const RunQueue) {
        (a, b)
    } else {
        (b, a)
    };
    first.lock.acquire();
    second.lock.acquire();
}

fn unlock_rq_pair(a: &'static RunQueue, b: &'static RunQueue) {
    if core::ptr::eq(a, b) {
        a.lock.release();
        return;
    }
    b.lock.release();
    a.lock.release();
}

/// Try to wake `t` if its state falls inside `mask`.
///
/// A wake against a thread outside the mask is a silent no-op (returns
/// false) so callers never need to know the victim's exact state. Returns
/// true once the wake is committed: the thread is runnable, queued, or
/// parked on an origin CPU's wake list.
pub fn try_to_wake_up(t: ThreadPtr, mask: WakeMask) -> bool {
    let th = t.get();

    // Waker self-case: an interrupt handler waking the thread it landed on
    // mid-sleep-attempt. No run-queue lock needed.
    if smp::current_thread() == Some(t) {
        let state = th.state.load(Ordering::Relaxed);
        if !mask.matches(state) {
            return false;
        }
        th.state.store(ThreadState::Running, Ordering::Release);
        return true;
    }

    // Step 1: serialize racing wakers of this thread.
    th.se.pi_lock.acquire();

    let woke = loop {
        // Step 2: reject states outside the caller's wakeable set.
        let state = th.state.load(Ordering::Acquire);
        if !mask.matches(state) {
            break false;
        }

        // Step 3: lock origin and target queues in address order; retry if
        // the thread migrated between the read and the locks.
        let origin_cpu = th.se.cpu.load(Ordering::Acquire) as usize;
        let origin = runqueue::rq(origin_cpu);
        let target_cpu = runqueue::select_task_rq(&th.se);
        let target = runqueue::rq(target_cpu);
        lock_rq_pair(origin, target);

        if th.se.cpu.load(Ordering::Relaxed) as usize != origin_cpu {
            unlock_rq_pair(origin, target);
            continue;
        }

        // Step 4: still logically queued (runnable or running): flipping
        // the state back to Running is the entire wake.
        if th.se.on_rq.load(Ordering::Relaxed) {
            th.state.store(ThreadState::Running, Ordering::Release);
            unlock_rq_pair(origin, target);
            break true;
        }

        // Step 5: mid context-switch on the origin CPU. Park the thread on
        // the *origin's* wake list; its context_switch_finish will enqueue
        // it after on_cpu clears. The IPI is only a nudge.
        if th.se.on_cpu.load(Ordering::Acquire) {
            if th
                .state
                .compare_exchange(
                    state,
                    ThreadState::Wakening,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                unlock_rq_pair(origin, target);
                continue;
            }
            runqueue::wake_list_push(origin, t);
            unlock_rq_pair(origin, target);
            arch::send_resched_ipi(origin_cpu);
            break true;
        }

        // Step 6: fully off-queue and off-CPU: claim and enqueue on the
        // selected target.
        if th
            .state
            .compare_exchange(
                state,
                ThreadState::Wakening,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            unlock_rq_pair(origin, target);
            continue;
        }
        // SAFETY: target's lock is held via lock_rq_pair.
        let target_inner = unsafe { target.inner_mut() };
        runqueue::enqueue_thread(target, target_inner, t);

        // Preemption nudge: if the wakee outranks the target's current.
        let preempts = target_inner
            .current
            .map(|cur| t.get().se.priority() < cur.get().se.priority())
            .unwrap_or(false);
        unlock_rq_pair(origin, target);
        if preempts {
            smp::set_need_resched(target_cpu);
            if target_cpu != arch::cpu_id() {
                arch::send_resched_ipi(target_cpu);
            }
        }
        break true;
    };

    th.se.pi_lock.release();
    woke
}

/// Unconditional wake: applies to every sleeping state.
pub fn wake_up(t: ThreadPtr) -> bool {
    try_to_wake_up(t, WakeMask::ALL_SLEEPING)
}

/// Wake only an interruptible sleeper.
pub fn wake_up_interruptible(t: ThreadPtr) -> bool {
    try_to_wake_up(t, WakeMask::INTERRUPTIBLE_ONLY)
}

/// Kill-style wake: interruptible and killable sleeps.
pub fn wake_up_killable(t: ThreadPtr) -> bool {
    try_to_wake_up(t, WakeMask::KILL)
}

/// Timer wake: only a timer sleep.
pub fn wake_up_timer(t: ThreadPtr) -> bool {
    try_to_wake_up(t, WakeMask::TIMER)
}

// ---------------------------------------------------------------------------
// Interrupt-side hooks
// ---------------------------------------------------------------------------

/// Reschedule-IPI handler: flush the wake list and request a resched.
/// The trap layer calls this; by the time interrupts are deliverable the
/// current switch (if any) has finished, so draining here is safe.
pub fn handle_resched_ipi() {
    let cpu = arch::cpu_id();
    runqueue::wake_list_drain(runqueue::rq(cpu));
    smp::set_need_resched(cpu);
}

/// Timer-tick hook against the running thread's class.
pub fn tick_current() {
    let rq = runqueue::rq(arch::cpu_id());
    rq.lock.acquire();
    // SAFETY: lock acquired above.
    let inner = unsafe { rq.inner_mut() };
    if let Some(cur) = inner.current {
        let slot = cur.get().se.priority().class();
        if let Some(ops) = crate::sched::class::class_ops(slot) {
            (ops.task_tick)(inner, slot, cur);
        }
    }
    rq.lock.release();
}

// ---------------------------------------------------------------------------
// Kernel-thread entry
// ---------------------------------------------------------------------------

/// Entry stub for freshly created kernel threads: finish the pending
/// context switch, enable interrupts, record a quiescent checkpoint, run
/// the entry function, exit with its return value.
#[cfg(target_os = "none")]
extern "C" fn kthread_trampoline() -> ! {
    context_switch_finish();
    arch::intr_on();
    rcu::quiescent_checkpoint();

    let t = smp::current_thread().expect("kthread trampoline without current");
    // SAFETY: `entry` is written once at creation and read once here, by
    // the thread itself.
    let entry = unsafe { (*t.get().entry.get()).take() }.expect("kthread without entry");
    let status = (entry.func)(entry.arg);
    crate::process::exit::exit_thread(status);
}

#[cfg(target_os = "none")]
pub(crate) fn kthread_trampoline_addr() -> usize {
    kthread_trampoline as extern "C" fn() -> ! as usize
}

/// The host simulator never runs spawned threads; the address is unused.
#[cfg(not(target_os = "none"))]
pub(crate) fn kthread_trampoline_addr() -> usize {
    0
}

/// Idle loop: the per-CPU idle thread parks the hart until there is work.
pub fn idle_loop() -> ! {
    loop {
        if smp::take_need_resched()
            || runqueue::wake_list_pending(runqueue::rq(arch::cpu_id()))
        {
            runqueue::wake_list_drain(runqueue::rq(arch::cpu_id()));
            yield_now();
        }
        arch::wait_for_interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::entity::Priority;
    use crate::sched::waitqueue::{self, WaitList};
    use crate::sync::RawSpinLock;

    fn mk_parked(name: &str, prio: Priority) -> ThreadPtr {
        ThreadPtr::leak(
            crate::sched::Thread::new_kthread(name, prio, |_| 0, 0).unwrap(),
        )
    }

    /// Pull a test thread back out of the scheduler so later tests see a
    /// clean run queue.
    fn scrub(t: ThreadPtr) {
        let rq = runqueue::rq(arch::cpu_id());
        rq.lock.acquire();
        // SAFETY: lock acquired above.
        let inner = unsafe { rq.inner_mut() };
        if t.get().se.on_rq.load(Ordering::Relaxed) {
            runqueue::dequeue_thread(rq, inner, t);
        }
        rq.lock.release();
        t.get().state.store(ThreadState::Uninterruptible, Ordering::Release);
    }

    #[test]
    fn test_wake_enqueues_parked_thread() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        let t = mk_parked("wakee", Priority::DEFAULT);

        let before = runqueue::rq(0).nr_queued.load(Ordering::Relaxed);
        assert!(try_to_wake_up(t, WakeMask::ALL_SLEEPING));

        let se = &t.get().se;
        assert!(se.on_rq.load(Ordering::Acquire));
        assert_eq!(se.cpu.load(Ordering::Acquire), 0);
        assert_eq!(
            t.get().state.load(Ordering::Acquire),
            ThreadState::Wakening
        );
        assert_eq!(
            runqueue::rq(0).nr_queued.load(Ordering::Relaxed),
            before + 1
        );

        // A second wake is a silent no-op: Wakening is not a sleeping state.
        assert!(!try_to_wake_up(t, WakeMask::ALL_SLEEPING));
        scrub(t);
    }

    #[test]
    fn test_wake_mask_rejects_mismatched_state() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        let t = mk_parked("picky", Priority::DEFAULT);

        // Parked threads are Uninterruptible; narrower wakes must no-op.
        assert!(!wake_up_interruptible(t));
        assert!(!wake_up_timer(t));
        assert_eq!(
            t.get().state.load(Ordering::Acquire),
            ThreadState::Uninterruptible
        );
        assert!(!t.get().se.on_rq.load(Ordering::Acquire));

        assert!(wake_up(t));
        scrub(t);
    }

    #[test]
    fn test_wake_while_on_rq_only_flips_state() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        let t = mk_parked("requeued", Priority::DEFAULT);
        assert!(wake_up(t));
        let queued = runqueue::rq(0).nr_queued.load(Ordering::Relaxed);

        // Pretend the thread published a sleeping state while still
        // logically queued (the classic store-state-then-yield window).
        t.get()
            .state
            .store(ThreadState::Interruptible, Ordering::Release);
        assert!(wake_up(t));
        assert_eq!(t.get().state.load(Ordering::Acquire), ThreadState::Running);
        // No double enqueue happened.
        assert_eq!(runqueue::rq(0).nr_queued.load(Ordering::Relaxed), queued);
        scrub(t);
    }

    #[test]
    fn test_wake_mid_switch_goes_through_wake_list() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        let t = mk_parked("midswitch", Priority::DEFAULT);
        let se = &t.get().se;

        // Thread is finishing a switch on CPU 0: off the queue, still
        // physically on the CPU.
        t.get()
            .state
            .store(ThreadState::Interruptible, Ordering::Release);
        se.cpu.store(0, Ordering::Release);
        se.on_cpu.store(true, Ordering::Release);

        let ipis = crate::arch::host::ipi_count(0);
        assert!(wake_up(t));
        assert_eq!(t.get().state.load(Ordering::Acquire), ThreadState::Wakening);
        assert!(!se.on_rq.load(Ordering::Acquire), "must not enqueue while on_cpu");
        assert!(runqueue::wake_list_pending(runqueue::rq(0)));
        assert!(crate::arch::host::ipi_count(0) > ipis, "origin CPU must get an IPI");

        // The origin finishes its switch and drains: exactly one enqueue.
        se.on_cpu.store(false, Ordering::Release);
        let before = runqueue::rq(0).nr_queued.load(Ordering::Relaxed);
        assert_eq!(runqueue::wake_list_drain(runqueue::rq(0)), 1);
        assert!(se.on_rq.load(Ordering::Acquire));
        assert_eq!(
            runqueue::rq(0).nr_queued.load(Ordering::Relaxed),
            before + 1
        );
        assert!(!runqueue::wake_list_pending(runqueue::rq(0)));
        scrub(t);
    }

    #[test]
    fn test_pick_prefers_lowest_priority_class() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        let low = mk_parked("prio5", Priority(5));
        let high = mk_parked("prio3", Priority(3));
        wake_up(low);
        wake_up(high);

        let rq = runqueue::rq(0);
        rq.lock.acquire();
        // SAFETY: lock acquired above.
        let inner = unsafe { rq.inner_mut() };
        let first = runqueue::pick_next(inner).unwrap();
        assert_eq!(first, high, "lower priority value must be picked first");
        let second = runqueue::pick_next(inner).unwrap();
        assert_eq!(second, low);
        // Reinstate so scrub sees them queued.
        runqueue::set_next(inner, low);
        runqueue::set_next(inner, high);
        rq.lock.release();

        scrub(low);
        scrub(high);
    }

    #[test]
    fn test_wake_one_hands_payload_to_waiter_node() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        static LOCK: RawSpinLock = RawSpinLock::new("wq_sched_test");
        let q = WaitList::new(&LOCK);
        let t = mk_parked("sleeper", Priority::DEFAULT);
        t.get()
            .state
            .store(ThreadState::Interruptible, Ordering::Release);

        LOCK.acquire();
        q.push(t);
        let woken = waitqueue::wake_one(&q, 0, 0xFEED_FACE).unwrap();
        LOCK.release();

        assert_eq!(woken, t);
        assert!(!t.get().wait.is_queued());
        assert_eq!(t.get().wait.payload.load(Ordering::Acquire), 0xFEED_FACE);
        assert_eq!(t.get().wait.err.load(Ordering::Acquire), 0);
        // The wake really scheduled it.
        assert!(t.get().se.on_rq.load(Ordering::Acquire));
        scrub(t);
    }

    #[test]
    fn test_tree_wake_by_key_in_address_order() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        static LOCK: RawSpinLock = RawSpinLock::new("wq_tree_test");
        let q = crate::sched::waitqueue::WaitTree::new(&LOCK);

        let mut tens = [mk_parked("t10a", Priority::DEFAULT), mk_parked("t10b", Priority::DEFAULT)];
        let twenty = mk_parked("t20", Priority::DEFAULT);
        let thirty = mk_parked("t30", Priority::DEFAULT);
        for t in tens.iter().chain([&twenty, &thirty]) {
            t.get()
                .state
                .store(ThreadState::Interruptible, Ordering::Release);
        }

        LOCK.acquire();
        q.add(tens[0], 10);
        q.add(tens[1], 10);
        q.add(twenty, 20);
        q.add(thirty, 30);
        let woken = waitqueue::wake_matching_key(&q, 10, 0, 0);
        assert_eq!(woken, 2, "exactly the two key-10 waiters wake");
        assert_eq!(q.min_key(), Some(20));
        LOCK.release();

        // Both woke into the scheduler, in address order.
        tens.sort_by_key(|t| t.addr());
        for t in tens {
            assert!(t.get().se.on_rq.load(Ordering::Acquire));
            scrub(t);
        }
        LOCK.acquire();
        q.remove(twenty);
        q.remove(thirty);
        LOCK.release();
        scrub(twenty);
        scrub(thirty);
    }

    #[test]
    fn test_wake_on_empty_chan_is_harmless() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        assert_eq!(crate::sched::wake_on_chan(0xDEAD_F00D), 0);
    }

    #[test]
    fn test_cancel_sleep_stores_intr() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        static LOCK: RawSpinLock = RawSpinLock::new("wq_cancel_test");
        let q = WaitList::new(&LOCK);
        let t = mk_parked("cancelled", Priority::DEFAULT);
        t.get()
            .state
            .store(ThreadState::Interruptible, Ordering::Release);

        LOCK.acquire();
        q.push(t);
        LOCK.release();

        assert!(waitqueue::cancel_sleep(t));
        assert!(!t.get().wait.is_queued());
        assert_eq!(
            t.get().wait.err.load(Ordering::Acquire),
            waitqueue::ERR_INTR
        );
        assert!(!waitqueue::cancel_sleep(t), "second cancel finds nothing");
        scrub(t);
    }
}
