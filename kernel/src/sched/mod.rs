//! Scheduler: per-CPU multi-priority run queues, sleeping-thread queues,
//! and the thread-lifecycle state machine.

pub mod class;
pub mod entity;
pub mod runqueue;
pub mod scheduler;
pub mod smp;
pub mod task;
pub mod timer;
pub mod waitqueue;

use core::sync::atomic::Ordering;

use crate::{arch, error::KernelResult, sync::rcu};

pub use entity::{CpuSet, Priority};
pub use runqueue::dump_runqueues;
pub use scheduler::{
    handle_resched_ipi, idle_loop, wake_up, wake_up_interruptible, wake_up_killable,
    wake_up_timer, yield_now,
};
pub use task::{SleepState, Thread, ThreadPtr, ThreadState, Tid, WakeMask};
pub use waitqueue::{sleep_on_chan, wake_on_chan};

/// Register the built-in scheduler classes. Idempotent; call before any
/// CPU bootstraps.
pub fn init() {
    class::init();
}

/// Turn the calling CPU's boot context into its idle thread and bring the
/// CPU online. Idempotent per CPU. Must run on the CPU it initializes.
pub fn bootstrap_this_cpu() -> ThreadPtr {
    let cpu = arch::cpu_id();
    let pc = smp::per_cpu(cpu);
    if let Some(existing) = ThreadPtr::from_raw(pc.idle.load(Ordering::Acquire)) {
        return existing;
    }

    let idle = ThreadPtr::leak(Thread::new_bootstrap("idle", Priority::IDLE, cpu));
    let se = &idle.get().se;
    se.cpu.store(cpu as u32, Ordering::Relaxed);
    se.on_cpu.store(true, Ordering::Relaxed);

    let rq = runqueue::rq(cpu);
    rq.lock.acquire();
    // SAFETY: lock acquired above.
    let inner = unsafe { rq.inner_mut() };
    runqueue::enqueue_thread(rq, inner, idle);
    inner.idle = Some(idle);
    inner.current = Some(idle);
    rq.lock.release();

    pc.idle.store(idle.as_raw(), Ordering::Release);
    pc.current.store(idle.as_raw(), Ordering::Release);
    smp::set_online(cpu);

    // First quiescent checkpoint: from here on this CPU participates in
    // grace-period detection.
    rcu::quiescent_checkpoint();

    log::info!(target: "sched", "cpu{} online", cpu);
    idle
}

/// Create a kernel thread, parked in `Uninterruptible`, published in the
/// thread table, and attached to the caller as parent. Wake it with
/// [`wake_up`] (or use [`kthread_spawn`]).
pub fn kthread_create(
    name: &str,
    prio: Priority,
    entry: fn(usize) -> i32,
    arg: usize,
) -> KernelResult<ThreadPtr> {
    let thread = Thread::new_kthread(name, prio, entry, arg)?;
    let t = crate::process::table::publish(thread)?;

    // Let the thread's class initialize the child's scheduling metadata.
    let slot = t.get().se.priority().class();
    if let Some(ops) = class::class_ops(slot) {
        (ops.task_fork)(smp::current_thread(), t);
    }
    Ok(t)
}

/// Like [`kthread_create`], additionally recording `leader` as the new
/// thread's group leader. Bookkeeping only: group exit semantics are not
/// implemented, single-thread exit is the rule.
pub fn kthread_create_in_group(
    name: &str,
    prio: Priority,
    entry: fn(usize) -> i32,
    arg: usize,
    leader: ThreadPtr,
) -> KernelResult<ThreadPtr> {
    let t = kthread_create(name, prio, entry, arg)?;
    t.get()
        .group_leader
        .store(leader.as_raw(), Ordering::Release);
    Ok(t)
}

/// Create and immediately wake a kernel thread.
pub fn kthread_spawn(
    name: &str,
    prio: Priority,
    entry: fn(usize) -> i32,
    arg: usize,
) -> KernelResult<ThreadPtr> {
    let t = kthread_create(name, prio, entry, arg)?;
    scheduler::wake_up(t);
    Ok(t)
}

/// Park the idle bootstrap used by host unit tests: classes registered,
/// CPU 0 online, the test thread installed as current.
#[cfg(all(test, not(target_os = "none")))]
pub fn bootstrap_for_tests() -> ThreadPtr {
    init();
    bootstrap_this_cpu()
}

/// Create a thread whose zombie transition notifies the class. Invoked by
/// the reaper path indirectly; exposed for the class vtable contract.
pub(crate) fn notify_task_dead(t: ThreadPtr) {
    let slot = t.get().se.priority().class();
    if let Some(ops) = class::class_ops(slot) {
        (ops.task_dead)(t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_TIME_SLICE, FIRST_PID};
    use crate::process::table;

    #[test]
    fn test_bootstrap_is_idempotent() {
        let _g = crate::test_support::lock();
        let a = bootstrap_for_tests();
        let b = bootstrap_for_tests();
        assert_eq!(a, b);
        assert_eq!(smp::current_thread(), Some(a));
        assert!(smp::cpu_online(0));
        assert_eq!(a.get().se.priority(), Priority::IDLE);
    }

    #[test]
    fn test_kthread_create_publishes_and_links() {
        let _g = crate::test_support::lock();
        let me = bootstrap_for_tests();

        let t = kthread_create("child", Priority::DEFAULT, |_| 0, 7).unwrap();
        assert!(t.get().tid.0 >= FIRST_PID);
        assert_eq!(
            t.get().state.load(Ordering::Acquire),
            ThreadState::Uninterruptible
        );
        assert_eq!(
            t.get().se.time_slice.load(Ordering::Relaxed),
            DEFAULT_TIME_SLICE
        );
        assert_eq!(
            ThreadPtr::from_raw(t.get().parent.load(Ordering::Acquire)),
            Some(me)
        );
        assert!(me.get().children.lock().contains(&t));
        assert_eq!(table::lookup(t.get().tid.0), Some(t));

        // Detach again so later tests see a clean parent.
        me.get().children.lock().retain(|c| *c != t);
        table::unpublish(t.get().tid);
    }

    #[test]
    fn test_group_leader_is_recorded() {
        let _g = crate::test_support::lock();
        let me = bootstrap_for_tests();
        let leader = kthread_create("leader", Priority::DEFAULT, |_| 0, 0).unwrap();
        let member =
            kthread_create_in_group("member", Priority::DEFAULT, |_| 0, 0, leader).unwrap();
        assert_eq!(
            ThreadPtr::from_raw(member.get().group_leader.load(Ordering::Acquire)),
            Some(leader)
        );
        for t in [member, leader] {
            me.get().children.lock().retain(|c| *c != t);
            table::unpublish(t.get().tid);
        }
    }
}
