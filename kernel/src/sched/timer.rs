//! Scheduler timers: timed sleeps and the periodic tick glue.
//!
//! Timers are kept in an ordered map from `(deadline, sequence)` to the
//! sleeping thread, so draining expired entries is a prefix walk. The
//! sequence number disambiguates equal deadlines. `yield_now` drains
//! expired timers before picking, and the timer interrupt drives the same
//! drain plus the per-class tick and the reclaim-scan period.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::collections::BTreeMap;

use crate::{
    arch,
    config::RCU_SCAN_PERIOD_TICKS,
    error::QueueError,
    sched::{
        scheduler,
        smp,
        task::{ThreadPtr, ThreadState},
    },
    sync::SpinLock,
};

/// Armed timers: (absolute deadline in ticks, sequence) -> sleeper.
static TIMERS: SpinLock<BTreeMap<(u64, u64), ThreadPtr>> =
    SpinLock::new("sched_timers", BTreeMap::new());

static TIMER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Last reclaim-scan tick per this CPU lives in rcu; we only track the
/// trigger period here.
static LAST_SCAN: [AtomicU64; crate::config::MAX_CPUS] =
    [const { AtomicU64::new(0) }; crate::config::MAX_CPUS];

/// Sleep the current thread for at least `ticks` monotonic ticks.
///
/// Registers a timer, publishes the `TimerSleep` state, and yields; on
/// resume the timer is cancelled if it has not fired. An `Interrupted`
/// error means some other waker cancelled the sleep asynchronously.
pub fn sleep_ticks(ticks: u64) -> Result<(), QueueError> {
    let t = smp::current_thread().expect("sleep_ticks before scheduler bootstrap");
    let node = &t.get().wait;
    node.err.store(0, Ordering::Relaxed);

    let deadline = arch::monotonic_tick().saturating_add(ticks);
    let seq = TIMER_SEQ.fetch_add(1, Ordering::Relaxed);
    let id = (deadline, seq);
    TIMERS.lock().insert(id, t);

    t.get()
        .state
        .store(ThreadState::TimerSleep, Ordering::Release);
    scheduler::yield_now();

    // Either the timer fired (entry gone) or something else woke us;
    // cancel the leftover registration in the latter case.
    TIMERS.lock().remove(&id);

    match node.err.load(Ordering::Acquire) {
        0 => Ok(()),
        crate::sched::waitqueue::ERR_INTR => Err(QueueError::Interrupted),
        code => Err(QueueError::Waker(code)),
    }
}

/// Wake every timer whose deadline has passed. Returns how many fired.
pub fn drain_expired() -> usize {
    let now = arch::monotonic_tick();
    let mut fired = 0;
    loop {
        let entry = {
            let mut timers = TIMERS.lock();
            match timers.keys().next().copied() {
                Some(id) if id.0 <= now => timers.remove_entry(&id),
                _ => None,
            }
        };
        let Some((_, t)) = entry else { break };
        scheduler::wake_up_timer(t);
        fired += 1;
    }
    fired
}

/// Number of armed timers (debug surface).
pub fn armed_count() -> usize {
    TIMERS.lock().len()
}

/// Ticks between periodic timer interrupts (1 ms at the QEMU virt
/// timebase).
const TICK_INTERVAL: u64 = 10_000;

/// Arm this hart's next periodic interrupt. The trap layer calls
/// [`on_tick`] when it fires, which re-arms.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn arm_tick() {
    crate::arch::riscv64::sbi::set_timer(arch::monotonic_tick() + TICK_INTERVAL);
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn arm_tick() {}

/// Timer-interrupt hook: drain expired sleeps (which resumes the per-CPU
/// reclaim worker when its period elapses), tick the running class,
/// request a reschedule when the reclaim period has passed so the worker
/// gets the CPU promptly, and re-arm the hardware timer.
pub fn on_tick() {
    drain_expired();
    scheduler::tick_current();

    let cpu = arch::cpu_id();
    let now = arch::monotonic_tick();
    let last = LAST_SCAN[cpu].load(Ordering::Relaxed);
    if now.wrapping_sub(last) >= RCU_SCAN_PERIOD_TICKS {
        LAST_SCAN[cpu].store(now, Ordering::Relaxed);
        smp::set_need_resched(cpu);
    }

    arm_tick();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_timer_fires_through_yield() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        // Deadline 0 ticks out immediately: the drain inside yield wakes
        // us (waker self-case) and the sleep completes normally.
        assert_eq!(sleep_ticks(0), Ok(()));
        assert_eq!(armed_count(), 0);
    }

    #[test]
    fn test_unexpired_timer_is_cancelled_after_resume() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        // Nothing else is runnable, so the sleep aborts at pick time; the
        // registration must not leak.
        assert_eq!(sleep_ticks(1 << 40), Ok(()));
        assert_eq!(armed_count(), 0);
    }

    #[test]
    fn test_drain_reports_fired_count() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        assert_eq!(drain_expired(), 0);
    }
}
