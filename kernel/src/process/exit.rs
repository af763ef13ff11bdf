//! Thread exit and reaping.
//!
//! `exit_thread` runs on the dying thread: wake any vfork parent, release
//! externally owned resources through the hooks, reparent children to init
//! under the thread table's upgraded lock, go zombie, wake the parent, and
//! yield for the last time. `wait_for_child` runs on the parent: publish an
//! interruptible sleep state before scanning so an exit cannot slip between
//! scan and sleep, claim a zombie with a state CAS, wait out the child's
//! final context switch, then detach and reclaim its storage through the
//! epoch reclaimer.

use core::sync::atomic::Ordering;

use alloc::boxed::Box;

use crate::{
    config::REAP_ONCPU_SPINS,
    error::{KernelError, KernelResult},
    process::{hooks, table},
    sched::{
        scheduler, smp,
        task::{ThreadPtr, ThreadState, Tid},
    },
    sync::rcu,
};

/// Terminate the calling thread with `status`. Never returns.
pub fn exit_thread(status: i32) -> ! {
    let t = smp::current_thread().expect("exit without current thread");
    let th = t.get();
    assert!(th.tid.0 != 0, "idle thread attempted to exit");

    // A vfork-style parent sleeps until the child is done with its borrowed
    // address space; it is released first.
    if let Some(vp) = ThreadPtr::from_raw(
        th.vfork_parent
            .swap(core::ptr::null_mut(), Ordering::AcqRel),
    ) {
        scheduler::wake_up(vp);
    }

    hooks::release_resources(t);

    // Reparent children to init. Taken as an upgradeable read first so
    // childless exits do not serialize against readers.
    {
        let guard = table::THREAD_TABLE.upgradeable_read();
        let has_children = !th.children.lock().is_empty();
        if has_children {
            let init = guard.get(1).expect("exit with children before init exists");
            let _w = table::upgrade_or_reacquire(&table::THREAD_TABLE, guard);
            let mut mine = th.children.lock();
            let mut theirs = init.get().children.lock();
            for child in mine.drain(..) {
                child.get().parent.store(init.as_raw(), Ordering::Release);
                theirs.push(child);
            }
        }
    }

    th.exit_status.store(status, Ordering::Release);
    th.state.store(ThreadState::Zombie, Ordering::Release);
    crate::sched::notify_task_dead(t);

    // Wake the parent unconditionally, independent of exit-signal choice.
    let parent = ThreadPtr::from_raw(th.parent.load(Ordering::Acquire));
    if let Some(p) = parent {
        scheduler::wake_up(p);
        let signal = th.exit_signal.load(Ordering::Relaxed);
        if signal != 0 {
            hooks::deliver_exit_signal(p, signal);
        }
    }

    log::debug!(target: "sched", "tid {} exited with status {}", th.tid.0, status);

    scheduler::yield_now();
    panic!("zombie thread rescheduled");
}

/// Reap one exited child. Blocks interruptibly until a child goes zombie;
/// returns its tid and exit status. `NotFound` if the caller has no
/// children.
pub fn wait_for_child() -> KernelResult<(Tid, i32)> {
    let me = smp::current_thread().expect("wait without current thread");
    let th = me.get();

    loop {
        // Sleep state first: a child exiting after our scan still finds us
        // wakeable, so the wake cannot be lost.
        th.state
            .store(ThreadState::Interruptible, Ordering::Release);

        let (zombie, has_children) = {
            let children = th.children.lock();
            let z = children
                .iter()
                .copied()
                .find(|c| c.get().state.load(Ordering::Acquire) == ThreadState::Zombie);
            (z, !children.is_empty())
        };

        if let Some(child) = zombie {
            // Claim: back to running (a racing waker may already have).
            let _ = th.state.compare_exchange(
                ThreadState::Interruptible,
                ThreadState::Running,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            reap(me, child);
            let tid = child.get().tid;
            let status = child.get().exit_status.load(Ordering::Acquire);
            destroy_thread(child);
            return Ok((tid, status));
        }

        if !has_children {
            th.state.store(ThreadState::Running, Ordering::Release);
            return Err(KernelError::NotFound {
                resource: "child thread",
                id: 0,
            });
        }

        scheduler::yield_now();
    }
}

/// Wait out the zombie's final context switch, then detach it from the
/// parent and the table.
fn reap(parent: ThreadPtr, child: ThreadPtr) {
    let cse = &child.get().se;

    // The child is zombie but may still be running its last yield on
    // another CPU. Spin briefly; fall back to yielding.
    let mut spins = 0;
    while cse.on_cpu.load(Ordering::Acquire) {
        core::hint::spin_loop();
        spins += 1;
        if spins >= REAP_ONCPU_SPINS {
            scheduler::yield_now();
            spins = 0;
        }
    }
    assert!(!cse.on_rq.load(Ordering::Acquire), "zombie still on a run queue");

    parent.get().children.lock().retain(|c| *c != child);
    table::unpublish(child.get().tid);
}

/// Schedule the thread's storage (TCB and kernel stack) for reclamation
/// after a grace period; handles read under a reader section stay valid
/// until it passes.
fn destroy_thread(t: ThreadPtr) {
    t.get().state.store(ThreadState::Unused, Ordering::Release);
    rcu::defer(move || {
        // SAFETY: the thread was unpublished from every registry and its
        // last observer is gone by the grace-period contract; the Box was
        // leaked at publish time. Dropping it frees the kernel stack too.
        unsafe { drop(Box::from_raw(t.as_raw())) };
    });
}

/// Park the calling thread until `child` exits (vfork-style).
pub fn vfork_wait(child: ThreadPtr) {
    let me = smp::current_thread().expect("vfork_wait without current thread");
    child
        .get()
        .vfork_parent
        .store(me.as_raw(), Ordering::Release);
    loop {
        me.get()
            .state
            .store(ThreadState::Uninterruptible, Ordering::Release);
        let st = child.get().state.load(Ordering::Acquire);
        if st == ThreadState::Zombie || st == ThreadState::Unused {
            me.get().state.store(ThreadState::Running, Ordering::Release);
            return;
        }
        scheduler::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::entity::Priority;
    use crate::sched::task::Thread;

    #[test]
    fn test_wait_with_no_children() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        let me = smp::current_thread().unwrap();
        me.get().children.lock().clear();
        assert!(matches!(
            wait_for_child(),
            Err(KernelError::NotFound { .. })
        ));
        assert_eq!(
            me.get().state.load(Ordering::Acquire),
            ThreadState::Running
        );
    }

    #[test]
    fn test_reap_zombie_child() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        let me = smp::current_thread().unwrap();

        // Publish a child and hand-retire it to zombie, as if it exited on
        // another CPU and fully switched out.
        let child = table::publish(
            Thread::new_kthread("doomed", Priority::DEFAULT, |_| 0, 0).unwrap(),
        )
        .unwrap();
        let tid = child.get().tid;
        child.get().exit_status.store(42, Ordering::Release);
        child.get().state.store(ThreadState::Zombie, Ordering::Release);

        let (reaped, status) = wait_for_child().unwrap();
        assert_eq!(reaped, tid);
        assert_eq!(status, 42);
        assert_eq!(table::lookup(tid.0), None);
        assert!(me.get().children.lock().iter().all(|c| c.get().tid != tid));

        // Storage free is deferred through the reclaimer.
        assert!(rcu::pending_count(crate::arch::cpu_id()) > 0);
        rcu::barrier();
    }
}
