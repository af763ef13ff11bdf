//! Epoch-based deferred reclamation (RCU-style).
//!
//! Readers mark critical sections with [`read_lock`]/[`read_unlock`]; they
//! never block, never allocate, and may nest. Quiescence is inferred from
//! context switches: the switch path calls [`quiescent_checkpoint`], which
//! records the monotonic tick into the CPU's timestamp cell when the
//! departing thread holds no reader section. Readers disable preemption,
//! so a CPU that context-switched after tick `t` cannot still be inside a
//! reader section that began before `t`.
//!
//! A callback registered at tick `t` on some CPU is safe to invoke once
//! every *other* CPU's recorded timestamp is `>= t`; the invoking CPU's own
//! quiescence is implied because its reclaim worker only runs after a
//! context switch. When no other CPU has ever recorded a timestamp the
//! effective minimum is plus infinity and everything is immediately ready,
//! which is the single-CPU fast path.

use core::{ptr, sync::atomic::Ordering};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize};

use alloc::boxed::Box;

use crate::{
    arch,
    config::{MAX_CPUS, RCU_WATCHDOG_SPINS, TICK_NORMALIZE_THRESHOLD},
    sched::{
        smp,
        task::SleepState,
        waitqueue::{self, WaitList, WaitTarget},
    },
    sync::{RawSpinLock, SpinLock},
};

// ---------------------------------------------------------------------------
// Publish / consume cells
// ---------------------------------------------------------------------------

/// An RCU-published pointer slot.
///
/// [`publish`](RcuCell::publish) is a release store; [`consume`]
/// (RcuCell::consume) an acquire load, so everything written before the
/// publish is visible through the consumed pointer. [`peek`](RcuCell::peek)
/// is the relaxed access-without-dereference form.
pub struct RcuCell<T> {
    ptr: AtomicPtr<T>,
}

// SAFETY: the cell only hands out raw pointers; dereference safety is the
// reader-section contract.
unsafe impl<T> Send for RcuCell<T> {}
unsafe impl<T> Sync for RcuCell<T> {}

impl<T> RcuCell<T> {
    pub const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publish `value` into the slot (release).
    pub fn publish(&self, value: *mut T) {
        self.ptr.store(value, Ordering::Release);
    }

    /// Read the slot for dereference within a reader section (acquire).
    pub fn consume(&self) -> *mut T {
        self.ptr.load(Ordering::Acquire)
    }

    /// Read the slot without intending to dereference (relaxed).
    pub fn peek(&self) -> *mut T {
        self.ptr.load(Ordering::Relaxed)
    }
}

impl<T> Default for RcuCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Per-CPU state
// ---------------------------------------------------------------------------

struct CbNode {
    registered: u64,
    func: Option<Box<dyn FnOnce() + Send>>,
    next: *mut CbNode,
}

/// Pending-callback list: singly linked, FIFO. Registration timestamps are
/// monotonic, so the list is sorted and the ready set is always a prefix.
struct CbList {
    head: *mut CbNode,
    tail: *mut CbNode,
    count: usize,
    invoked: u64,
}

// SAFETY: raw node pointers are only touched under the list's spinlock.
unsafe impl Send for CbList {}

impl CbList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            count: 0,
            invoked: 0,
        }
    }

    fn push(&mut self, node: *mut CbNode) {
        if self.tail.is_null() {
            self.head = node;
        } else {
            // SAFETY: tail is a valid pending node.
            unsafe { (*self.tail).next = node };
        }
        self.tail = node;
        self.count += 1;
    }

    /// Detach the prefix of callbacks registered at or before `limit`
    /// (`None` means everything). Returns the chain head.
    fn take_ready(&mut self, limit: Option<u64>) -> *mut CbNode {
        let ready = self.head;
        let mut last: *mut CbNode = ptr::null_mut();
        let mut cur = self.head;
        let mut taken = 0;
        while !cur.is_null() {
            // SAFETY: cur walks the pending list under the lock.
            let registered = unsafe { (*cur).registered };
            if let Some(limit) = limit {
                if registered > limit {
                    break;
                }
            }
            last = cur;
            // SAFETY: as above.
            cur = unsafe { (*cur).next };
            taken += 1;
        }
        if last.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: last is the final detached node.
        unsafe { (*last).next = ptr::null_mut() };
        self.head = cur;
        if cur.is_null() {
            self.tail = ptr::null_mut();
        }
        assert!(self.count >= taken, "callback count underflow");
        self.count -= taken;
        ready
    }
}

struct RcuCpu {
    /// Tick of this CPU's last quiescent state; 0 means never recorded.
    last_quiescent: AtomicU64,
    pending: SpinLock<CbList>,
}

impl RcuCpu {
    const fn new() -> Self {
        Self {
            last_quiescent: AtomicU64::new(0),
            pending: SpinLock::new("rcu_cbs", CbList::new()),
        }
    }
}

static CPUS: [RcuCpu; MAX_CPUS] = [const { RcuCpu::new() }; MAX_CPUS];

/// Total callbacks outstanding across all CPUs (the lazy accumulator).
static PENDING_TOTAL: AtomicUsize = AtomicUsize::new(0);

// Grace-period bookkeeping for the synchronous waiters.
static GP_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static GP_START: AtomicU64 = AtomicU64::new(0);
static GP_COMPLETED: AtomicU64 = AtomicU64::new(0);
static GP_LAST_DONE_START: AtomicU64 = AtomicU64::new(0);

static GP_LOCK: RawSpinLock = RawSpinLock::new("rcu_gp");
static GP_WAITERS: WaitList = WaitList::new(&GP_LOCK);

/// Offset subtracted from the raw tick by the normalization checkpoint.
static TICK_OFFSET: AtomicU64 = AtomicU64::new(0);

/// The reclaimer's view of the monotonic clock.
fn now() -> u64 {
    arch::monotonic_tick().saturating_sub(TICK_OFFSET.load(Ordering::Relaxed))
}

// ---------------------------------------------------------------------------
// Reader side
// ---------------------------------------------------------------------------

/// Enter a reader critical section. Never blocks, never allocates; nests
/// freely (the counter is per-thread, so a reader could migrate safely,
/// though preemption is disabled for the section's duration anyway).
pub fn read_lock() {
    smp::preempt_disable();
    match smp::current_thread() {
        Some(t) => {
            t.get().rcu_nesting.fetch_add(1, Ordering::Relaxed);
        }
        None => {
            smp::this_cpu().boot_rcu_nesting.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Leave a reader critical section. Underflow is fatal.
pub fn read_unlock() {
    match smp::current_thread() {
        Some(t) if t.get().rcu_nesting.load(Ordering::Relaxed) > 0 => {
            t.get().rcu_nesting.fetch_sub(1, Ordering::Relaxed);
        }
        _ => {
            let prev = smp::this_cpu().boot_rcu_nesting.fetch_sub(1, Ordering::Relaxed);
            assert!(prev > 0, "rcu read_unlock without matching read_lock");
        }
    }
    smp::preempt_enable();
}

/// Reader-section nesting depth of the current thread.
pub fn reader_nesting() -> u32 {
    let boot = smp::this_cpu().boot_rcu_nesting.load(Ordering::Relaxed);
    match smp::current_thread() {
        Some(t) => t.get().rcu_nesting.load(Ordering::Relaxed) + boot,
        None => boot,
    }
}

/// Is the caller inside a reader section?
pub fn reader_active() -> bool {
    reader_nesting() > 0
}

// ---------------------------------------------------------------------------
// Quiescence
// ---------------------------------------------------------------------------

/// Report a passive quiescent state for the local CPU. A no-op while the
/// current thread is inside a reader section; that gate is what makes the
/// context-switch path the sole source of quiescence information.
pub fn quiescent_checkpoint() {
    if reader_nesting() == 0 {
        CPUS[arch::cpu_id()]
            .last_quiescent
            .store(now(), Ordering::Release);
    }
}

/// Record a quiescent state for a specific CPU (bootstrap, tests).
pub(crate) fn note_quiescent_on(cpu: usize) {
    CPUS[cpu].last_quiescent.store(now(), Ordering::Release);
}

/// Minimum quiescence timestamp across every *other* online CPU; `None`
/// means no other CPU has ever recorded one, i.e. plus infinity. CPUs that
/// have not recorded yet are skipped: each CPU records its first checkpoint
/// while coming online, so that window is confined to boot.
fn min_other_timestamp(me: usize) -> Option<u64> {
    let mut min: Option<u64> = None;
    for cpu in 0..MAX_CPUS {
        if cpu == me || !smp::cpu_online(cpu) {
            continue;
        }
        let ts = CPUS[cpu].last_quiescent.load(Ordering::Acquire);
        if ts == 0 {
            continue;
        }
        min = Some(min.map_or(ts, |m| m.min(ts)));
    }
    min
}

fn grace_elapsed(me: usize, t0: u64) -> bool {
    min_other_timestamp(me).map_or(true, |m| m >= t0)
}

// ---------------------------------------------------------------------------
// Deferred callbacks
// ---------------------------------------------------------------------------

/// Defer `func` until after a grace period. The callback runs on this
/// CPU's reclaim worker with preemption enabled; a panicking callback is
/// fatal.
pub fn defer(func: impl FnOnce() + Send + 'static) {
    let node = Box::into_raw(Box::new(CbNode {
        registered: now(),
        func: Some(Box::new(func)),
        next: ptr::null_mut(),
    }));
    CPUS[arch::cpu_id()].pending.lock().push(node);
    PENDING_TOTAL.fetch_add(1, Ordering::AcqRel);
}

/// One reclaim pass over `cpu`'s pending list: invoke every callback whose
/// registration tick is at or before the minimum of the other CPUs'
/// quiescence timestamps. Returns how many ran.
///
/// Normally driven by `cpu`'s reclaim worker; [`barrier`] also runs it
/// cross-CPU, which is safe because eligibility never depends on which CPU
/// invokes.
pub fn reclaim_scan(cpu: usize) -> usize {
    maybe_normalize();
    let limit = min_other_timestamp(cpu);
    let mut chain = CPUS[cpu].pending.lock().take_ready(limit);

    let mut ran: usize = 0;
    while !chain.is_null() {
        // SAFETY: the chain was detached under the lock; nodes came from
        // Box::into_raw in defer().
        let mut node = unsafe { Box::from_raw(chain) };
        chain = node.next;
        if let Some(f) = node.func.take() {
            f();
        }
        ran += 1;
    }
    if ran > 0 {
        CPUS[cpu].pending.lock().invoked += ran as u64;
        PENDING_TOTAL.fetch_sub(ran, Ordering::AcqRel);
    }

    complete_grace_period_if_due(cpu);
    ran
}

fn complete_grace_period_if_due(cpu: usize) {
    if !GP_IN_PROGRESS.load(Ordering::Acquire) {
        return;
    }
    let start = GP_START.load(Ordering::Acquire);
    if grace_elapsed(cpu, start) {
        GP_IN_PROGRESS.store(false, Ordering::Release);
        GP_COMPLETED.fetch_add(1, Ordering::AcqRel);
        GP_LAST_DONE_START.fetch_max(start, Ordering::AcqRel);
        GP_LOCK.acquire();
        waitqueue::wake_all(&GP_WAITERS, 0, 0);
        GP_LOCK.release();
    }
}

// ---------------------------------------------------------------------------
// Synchronous waiting
// ---------------------------------------------------------------------------

fn start_grace_period(t0: u64) {
    if !GP_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        GP_START.store(t0, Ordering::Release);
    }
}

#[cfg(target_os = "none")]
fn can_block() -> bool {
    smp::current_thread().is_some()
        && !smp::in_interrupt()
        && smp::preempt_depth() == 0
        && crate::sync::spinlock::spin_depth() == 0
}

// The host simulator cannot context-switch; waiters must poll.
#[cfg(not(target_os = "none"))]
fn can_block() -> bool {
    false
}

/// Wait until every reader section that existed at the time of the call
/// has finished: blocks on the grace-period wait queue until a completion
/// whose start timestamp covers us is recorded, or polls where blocking is
/// impossible. A stall past the watchdog budget is fatal.
pub fn synchronize() {
    let me = arch::cpu_id();
    let t0 = now();
    if grace_elapsed(me, t0) {
        return;
    }

    let mut spins: u64 = 0;
    loop {
        if GP_LAST_DONE_START.load(Ordering::Acquire) >= t0 || grace_elapsed(me, t0) {
            return;
        }
        start_grace_period(t0);

        if can_block() {
            GP_LOCK.acquire();
            // Re-check under the lock so a completion cannot slip between
            // the check and the enqueue.
            if GP_LAST_DONE_START.load(Ordering::Acquire) >= t0 || grace_elapsed(me, t0) {
                GP_LOCK.release();
                return;
            }
            let _ = waitqueue::wait_in_state(
                WaitTarget::List(&GP_WAITERS),
                SleepState::Uninterruptible,
                || {},
                || {},
            );
            GP_LOCK.release();
        } else {
            quiescent_checkpoint();
            reclaim_scan(me);
            core::hint::spin_loop();
            spins += 1;
            if spins > RCU_WATCHDOG_SPINS {
                panic!("rcu watchdog: synchronize() stalled");
            }
        }
    }
}

/// Expedited grace-period wait: poll the other CPUs' timestamp cells
/// directly, prodding them with reschedule IPIs. Bounded by the watchdog.
pub fn synchronize_expedited() {
    let me = arch::cpu_id();
    let t0 = now();
    let mut spins: u64 = 0;
    while !grace_elapsed(me, t0) {
        if spins % 4096 == 0 {
            for cpu in 0..MAX_CPUS {
                if cpu != me && smp::cpu_online(cpu) {
                    arch::send_resched_ipi(cpu);
                }
            }
        }
        quiescent_checkpoint();
        core::hint::spin_loop();
        spins += 1;
        if spins > RCU_WATCHDOG_SPINS {
            panic!("rcu watchdog: expedited grace period stalled");
        }
    }
}

/// Drain every pending callback on every CPU, waiting out grace periods as
/// needed. Returns when the lazy accumulator reads zero.
pub fn barrier() {
    let mut rounds: u64 = 0;
    while PENDING_TOTAL.load(Ordering::Acquire) > 0 {
        synchronize();
        for cpu in 0..MAX_CPUS {
            if smp::cpu_online(cpu) || pending_count(cpu) > 0 {
                reclaim_scan(cpu);
            }
        }
        rounds += 1;
        assert!(rounds < RCU_WATCHDOG_SPINS, "rcu watchdog: barrier stalled");
    }
}

// ---------------------------------------------------------------------------
// Timestamp normalization
// ---------------------------------------------------------------------------

static NORM_LOCK: spin::Mutex<()> = spin::Mutex::new(());

fn maybe_normalize() {
    if now() >= TICK_NORMALIZE_THRESHOLD {
        normalize_by(TICK_NORMALIZE_THRESHOLD / 2);
    }
}

/// Shift every recorded timestamp down by `delta` and fold the delta into
/// the tick offset, preserving all orderings. Invoked from the reclaim
/// worker when the configured threshold is exceeded; never on a fast path.
fn normalize_by(delta: u64) {
    let _guard = NORM_LOCK.lock();
    TICK_OFFSET.fetch_add(delta, Ordering::AcqRel);
    for cpu in 0..MAX_CPUS {
        let cell = &CPUS[cpu].last_quiescent;
        let ts = cell.load(Ordering::Acquire);
        if ts != 0 {
            // Keep 1 as the floor so "never recorded" stays unambiguous.
            cell.store(ts.saturating_sub(delta).max(1), Ordering::Release);
        }
        let pending = CPUS[cpu].pending.lock();
        let mut cur = pending.head;
        while !cur.is_null() {
            // SAFETY: walking the pending list under its lock.
            unsafe {
                (*cur).registered = (*cur).registered.saturating_sub(delta);
                cur = (*cur).next;
            }
        }
        drop(pending);
    }
    let s = GP_START.load(Ordering::Acquire);
    GP_START.store(s.saturating_sub(delta), Ordering::Release);
    let s = GP_LAST_DONE_START.load(Ordering::Acquire);
    GP_LAST_DONE_START.store(s.saturating_sub(delta), Ordering::Release);
}

// ---------------------------------------------------------------------------
// Workers and stats
// ---------------------------------------------------------------------------

/// Reclaim worker body: scan, sleep out the period, repeat.
#[cfg(target_os = "none")]
fn reclaim_worker_main(cpu: usize) -> i32 {
    loop {
        reclaim_scan(cpu);
        let _ = crate::sched::timer::sleep_ticks(crate::config::RCU_SCAN_PERIOD_TICKS);
    }
}

/// Spawn one reclaim worker per online CPU, each pinned to its CPU.
#[cfg(target_os = "none")]
pub fn spawn_workers() -> crate::error::KernelResult<()> {
    use crate::sched::entity::{CpuSet, Priority};
    for cpu in 0..MAX_CPUS {
        if !smp::cpu_online(cpu) {
            continue;
        }
        let t = crate::sched::kthread_create("rcu_reclaim", Priority(0x20), reclaim_worker_main, cpu)?;
        t.get().se.set_affinity(CpuSet::single(cpu));
        crate::sched::scheduler::wake_up(t);
    }
    Ok(())
}

/// Callbacks waiting on `cpu`.
pub fn pending_count(cpu: usize) -> usize {
    CPUS[cpu].pending.lock().count
}

/// Callbacks `cpu` has invoked since boot.
pub fn invoked_count(cpu: usize) -> u64 {
    CPUS[cpu].pending.lock().invoked
}

/// Completed grace periods.
pub fn completed_count() -> u64 {
    GP_COMPLETED.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_publish_consume_round_trip() {
        let cell: RcuCell<u32> = RcuCell::new();
        assert!(cell.consume().is_null());
        let v = Box::into_raw(Box::new(7u32));
        cell.publish(v);
        assert_eq!(cell.consume(), v);
        assert_eq!(cell.peek(), v);
        // SAFETY: single-threaded test owns the allocation.
        unsafe { drop(Box::from_raw(v)) };
    }

    #[test]
    fn test_reader_nesting_is_deep_and_linear() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        for _ in 0..512 {
            read_lock();
        }
        assert_eq!(reader_nesting(), 512);
        assert!(reader_active());
        for _ in 0..512 {
            read_unlock();
        }
        assert_eq!(reader_nesting(), 0);
    }

    #[test]
    fn test_single_cpu_grace_is_instant() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        // No other CPU has a timestamp: the minimum is plus infinity.
        let ran = Arc::new(StdAtomicUsize::new(0));
        let r = ran.clone();
        defer(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        synchronize();
        reclaim_scan(arch::cpu_id());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pending_count(arch::cpu_id()), 0);
    }

    #[test]
    fn test_callbacks_wait_for_other_cpu() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        // Simulate a second CPU that has quiesced once, long ago.
        smp::set_online(1);
        note_quiescent_on(1);

        let ran = Arc::new(StdAtomicUsize::new(0));
        let r = ran.clone();
        defer(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        // CPU 1's timestamp predates the callback: not ready.
        reclaim_scan(0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(pending_count(0), 1);

        // CPU 1 passes a quiescent state after registration: ready.
        note_quiescent_on(1);
        reclaim_scan(0);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pending_count(0), 0);

        smp::set_offline(1);
    }

    #[test]
    fn test_expedited_completes_when_peers_quiesce() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        smp::set_online(1);
        note_quiescent_on(1);
        // A peer that keeps passing quiescent states lets the poller finish.
        let stop = Arc::new(StdAtomicUsize::new(0));
        let s = stop.clone();
        let h = std::thread::spawn(move || {
            while s.load(Ordering::SeqCst) == 0 {
                note_quiescent_on(1);
                std::thread::yield_now();
            }
        });
        synchronize_expedited();
        stop.store(1, Ordering::SeqCst);
        h.join().unwrap();
        smp::set_offline(1);
    }

    #[test]
    fn test_barrier_drains_everything() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        let ran = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..8 {
            let r = ran.clone();
            defer(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
        }
        barrier();
        assert_eq!(ran.load(Ordering::SeqCst), 8);
        assert_eq!(pending_count(arch::cpu_id()), 0);
    }

    #[test]
    fn test_normalization_preserves_order() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        smp::set_online(1);
        note_quiescent_on(1);
        let before = CPUS[1].last_quiescent.load(Ordering::Acquire);
        assert!(before > 0);

        let t_reg = now();
        defer(|| {});
        normalize_by(t_reg / 2);

        // The peer's shifted timestamp still predates the shifted
        // registration tick, so the callback is still held back.
        reclaim_scan(0);
        assert_eq!(pending_count(0), 1);

        // After a fresh checkpoint on the peer it drains.
        note_quiescent_on(1);
        reclaim_scan(0);
        assert_eq!(pending_count(0), 0);
        smp::set_offline(1);
    }
}
