//! Thread control block and the thread-state machine.
//!
//! A [`Thread`] is the scheduled unit. It is heap-allocated at creation,
//! published in the thread table, and from then on only ever referenced
//! through raw [`ThreadPtr`] handles; its storage is reclaimed through the
//! epoch reclaimer after the reaper detaches it, so a handle read under an
//! RCU reader section stays dereferenceable.

use core::{cell::UnsafeCell, ptr::NonNull, sync::atomic::Ordering};
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicU8};

use alloc::{boxed::Box, string::String, vec::Vec};
use bitflags::bitflags;
use spin::Mutex;

use crate::{
    arch::Context,
    config::KSTACK_ORDER,
    error::KernelResult,
    mm::page,
    sched::{
        entity::{CpuSet, Priority, SchedEntity},
        waitqueue::WaitNode,
    },
};

/// Thread identifier. Allocatable ids live in `[2, MAX_PID)`; 0 is the
/// per-CPU idle threads, 1 is init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub usize);

/// Thread lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Slot free; terminal state after reaping.
    Unused = 0,
    /// Sleeping; only an unconditional wake applies.
    Uninterruptible = 1,
    /// Sleeping; any wake applies, including cancellation.
    Interruptible = 2,
    /// Sleeping; interruptible only by kill-style wakes.
    Killable = 3,
    /// Sleeping until a scheduler timer fires.
    TimerSleep = 4,
    /// Stopped by job control.
    Stopped = 5,
    /// Sleeping on a channel (global channel tree).
    OnChan = 6,
    /// Runnable or running.
    Running = 7,
    /// Transient: a waker claimed the thread but the enqueue has not been
    /// picked yet.
    Wakening = 8,
    /// Exited, awaiting reap.
    Zombie = 9,
}

impl ThreadState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unused,
            1 => Self::Uninterruptible,
            2 => Self::Interruptible,
            3 => Self::Killable,
            4 => Self::TimerSleep,
            5 => Self::Stopped,
            6 => Self::OnChan,
            7 => Self::Running,
            8 => Self::Wakening,
            9 => Self::Zombie,
            _ => panic!("corrupt thread state {}", v),
        }
    }

    /// Is this one of the sleeping variants?
    pub fn is_sleeping(self) -> bool {
        matches!(
            self,
            Self::Uninterruptible
                | Self::Interruptible
                | Self::Killable
                | Self::TimerSleep
                | Self::Stopped
                | Self::OnChan
        )
    }
}

/// The sleeping subset of [`ThreadState`], used where only a sleeping
/// state makes sense (queue waits); non-sleeping states are unrepresentable
/// there by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepState {
    Uninterruptible,
    Interruptible,
    Killable,
    TimerSleep,
    Stopped,
    OnChan,
}

impl From<SleepState> for ThreadState {
    fn from(s: SleepState) -> Self {
        match s {
            SleepState::Uninterruptible => Self::Uninterruptible,
            SleepState::Interruptible => Self::Interruptible,
            SleepState::Killable => Self::Killable,
            SleepState::TimerSleep => Self::TimerSleep,
            SleepState::Stopped => Self::Stopped,
            SleepState::OnChan => Self::OnChan,
        }
    }
}

bitflags! {
    /// Which sleeping states a particular wake function applies to. A wake
    /// against a thread outside its mask is a silent no-op.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WakeMask: u16 {
        const UNINTERRUPTIBLE = 1 << ThreadState::Uninterruptible as u16;
        const INTERRUPTIBLE   = 1 << ThreadState::Interruptible as u16;
        const KILLABLE        = 1 << ThreadState::Killable as u16;
        const TIMER_SLEEP     = 1 << ThreadState::TimerSleep as u16;
        const STOPPED         = 1 << ThreadState::Stopped as u16;
        const ON_CHAN         = 1 << ThreadState::OnChan as u16;
    }
}

impl WakeMask {
    /// Unconditional wake: every sleeping state.
    pub const ALL_SLEEPING: WakeMask = WakeMask::all();
    /// Interruptible-only wake.
    pub const INTERRUPTIBLE_ONLY: WakeMask = WakeMask::INTERRUPTIBLE;
    /// Kill-style wake: interruptible and killable sleeps.
    pub const KILL: WakeMask =
        WakeMask::INTERRUPTIBLE.union(WakeMask::KILLABLE);
    /// Timer wake.
    pub const TIMER: WakeMask = WakeMask::TIMER_SLEEP;

    /// Does `state` fall inside this mask?
    pub fn matches(self, state: ThreadState) -> bool {
        state.is_sleeping() && self.contains(WakeMask::from_bits_truncate(1 << state as u16))
    }
}

/// Atomic wrapper over [`ThreadState`].
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub const fn new(state: ThreadState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self, order: Ordering) -> ThreadState {
        ThreadState::from_u8(self.0.load(order))
    }

    pub fn store(&self, state: ThreadState, order: Ordering) {
        self.0.store(state as u8, order);
    }

    pub fn compare_exchange(
        &self,
        old: ThreadState,
        new: ThreadState,
        success: Ordering,
        failure: Ordering,
    ) -> Result<ThreadState, ThreadState> {
        self.0
            .compare_exchange(old as u8, new as u8, success, failure)
            .map(ThreadState::from_u8)
            .map_err(ThreadState::from_u8)
    }
}

/// An owned kernel stack: one page block of order [`KSTACK_ORDER`].
pub struct KernelStack {
    base: NonNull<u8>,
    order: usize,
}

impl KernelStack {
    pub fn alloc() -> KernelResult<Self> {
        let base = page::alloc_block(KSTACK_ORDER)?;
        Ok(Self {
            base,
            order: KSTACK_ORDER,
        })
    }

    /// Top of stack (stacks grow down).
    pub fn top(&self) -> usize {
        self.base.as_ptr() as usize + page::block_bytes(self.order)
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        // SAFETY: base/order come from alloc_block and the stack is dropped
        // exactly once, after the epoch reclaimer says no CPU can still be
        // on it.
        unsafe { page::free_block(self.base, self.order) };
    }
}

/// Kernel-thread entry: function plus its argument.
#[derive(Clone, Copy)]
pub struct KthreadEntry {
    pub func: fn(usize) -> i32,
    pub arg: usize,
}

/// Thread control block.
pub struct Thread {
    pub tid: Tid,
    pub name: String,
    /// Owned kernel stack; `None` for bootstrap/idle threads that run on
    /// the boot stack.
    pub stack: Option<KernelStack>,
    /// Saved register state; written only by the owning CPU during context
    /// switch, under the run-queue lock.
    pub context: UnsafeCell<Context>,
    /// Lifecycle state.
    pub state: AtomicState,
    pub exit_status: AtomicI32,
    /// Exit-signal number delivered to the parent, 0 for none.
    pub exit_signal: AtomicU32,
    /// Parent thread; threads are reparented to init when the parent exits.
    pub parent: AtomicPtr<Thread>,
    /// Owned child list, navigated under the thread-table lock.
    pub children: Mutex<Vec<ThreadPtr>>,
    /// Optional group leader recorded at creation; bookkeeping only.
    pub group_leader: AtomicPtr<Thread>,
    /// Thread parked in a vfork-style wait for us, woken first on exit.
    pub vfork_parent: AtomicPtr<Thread>,
    /// Scheduling metadata.
    pub se: SchedEntity,
    /// Handle into a wait container.
    pub wait: WaitNode,
    /// Nesting depth of RCU reader sections held by this thread.
    pub rcu_nesting: AtomicU32,
    /// Entry point for the kthread trampoline; read once by the thread
    /// itself on first schedule.
    pub entry: UnsafeCell<Option<KthreadEntry>>,
}

// SAFETY: all mutable fields are atomics or UnsafeCells whose access is
// serialized by the scheduler's locking protocol (run-queue lock for
// context, first-schedule-only for entry).
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Create a detached kernel thread, parked in `Uninterruptible` until
    /// a wake starts it.
    pub fn new_kthread(
        name: &str,
        prio: Priority,
        entry: fn(usize) -> i32,
        arg: usize,
    ) -> KernelResult<Box<Thread>> {
        let stack = KernelStack::alloc()?;
        let mut context = Context::zeroed();
        context.prepare(crate::sched::scheduler::kthread_trampoline_addr(), stack.top());
        Ok(Box::new(Thread {
            tid: Tid(0),
            name: String::from(name),
            stack: Some(stack),
            context: UnsafeCell::new(context),
            state: AtomicState::new(ThreadState::Uninterruptible),
            exit_status: AtomicI32::new(0),
            exit_signal: AtomicU32::new(0),
            parent: AtomicPtr::new(core::ptr::null_mut()),
            children: Mutex::new(Vec::new()),
            group_leader: AtomicPtr::new(core::ptr::null_mut()),
            vfork_parent: AtomicPtr::new(core::ptr::null_mut()),
            se: SchedEntity::new(prio, CpuSet::all()),
            wait: WaitNode::new(),
            rcu_nesting: AtomicU32::new(0),
            entry: UnsafeCell::new(Some(KthreadEntry { func: entry, arg })),
        }))
    }

    /// Wrap the currently executing boot context into a thread (the idle
    /// thread of the booting CPU). Uses the boot stack; state is `Running`.
    pub fn new_bootstrap(name: &str, prio: Priority, cpu: usize) -> Box<Thread> {
        Box::new(Thread {
            tid: Tid(0),
            name: String::from(name),
            stack: None,
            context: UnsafeCell::new(Context::zeroed()),
            state: AtomicState::new(ThreadState::Running),
            exit_status: AtomicI32::new(0),
            exit_signal: AtomicU32::new(0),
            parent: AtomicPtr::new(core::ptr::null_mut()),
            children: Mutex::new(Vec::new()),
            group_leader: AtomicPtr::new(core::ptr::null_mut()),
            vfork_parent: AtomicPtr::new(core::ptr::null_mut()),
            se: SchedEntity::new(prio, CpuSet::single(cpu)),
            wait: WaitNode::new(),
            rcu_nesting: AtomicU32::new(0),
            entry: UnsafeCell::new(None),
        })
    }
}

/// Raw, copyable handle to a thread.
///
/// Validity is guaranteed by the lifecycle protocol: a thread's storage is
/// only reclaimed through the epoch reclaimer after it was detached from
/// every structure a handle could have been read from.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadPtr(NonNull<Thread>);

// SAFETY: Thread is Send + Sync; the pointer is a shared handle.
unsafe impl Send for ThreadPtr {}
unsafe impl Sync for ThreadPtr {}

impl ThreadPtr {
    pub fn new(ptr: NonNull<Thread>) -> Self {
        Self(ptr)
    }

    pub fn from_raw(raw: *mut Thread) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    /// Leak a freshly created thread into a raw handle.
    pub fn leak(thread: Box<Thread>) -> Self {
        Self(NonNull::from(Box::leak(thread)))
    }

    pub fn as_raw(self) -> *mut Thread {
        self.0.as_ptr()
    }

    /// Address of the thread, used as the deterministic tie-break in keyed
    /// wait trees.
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub fn get(self) -> &'static Thread {
        // SAFETY: see the type-level validity contract above.
        unsafe { &*self.0.as_ptr() }
    }
}

impl core::fmt::Debug for ThreadPtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let t = self.get();
        write!(f, "Thread({}, {:?})", t.tid.0, t.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for v in 0..=9u8 {
            assert_eq!(ThreadState::from_u8(v) as u8, v);
        }
    }

    #[test]
    fn test_sleeping_classification() {
        assert!(ThreadState::Interruptible.is_sleeping());
        assert!(ThreadState::OnChan.is_sleeping());
        assert!(!ThreadState::Running.is_sleeping());
        assert!(!ThreadState::Wakening.is_sleeping());
        assert!(!ThreadState::Zombie.is_sleeping());
    }

    #[test]
    fn test_wake_mask_matching() {
        assert!(WakeMask::ALL_SLEEPING.matches(ThreadState::Uninterruptible));
        assert!(WakeMask::ALL_SLEEPING.matches(ThreadState::TimerSleep));
        assert!(!WakeMask::ALL_SLEEPING.matches(ThreadState::Running));

        assert!(WakeMask::INTERRUPTIBLE_ONLY.matches(ThreadState::Interruptible));
        assert!(!WakeMask::INTERRUPTIBLE_ONLY.matches(ThreadState::Uninterruptible));

        assert!(WakeMask::KILL.matches(ThreadState::Killable));
        assert!(WakeMask::KILL.matches(ThreadState::Interruptible));
        assert!(!WakeMask::KILL.matches(ThreadState::TimerSleep));

        assert!(WakeMask::TIMER.matches(ThreadState::TimerSleep));
        assert!(!WakeMask::TIMER.matches(ThreadState::OnChan));
    }

    #[test]
    fn test_atomic_state_cas() {
        let s = AtomicState::new(ThreadState::Interruptible);
        assert_eq!(
            s.compare_exchange(
                ThreadState::Interruptible,
                ThreadState::Wakening,
                Ordering::AcqRel,
                Ordering::Acquire
            ),
            Ok(ThreadState::Interruptible)
        );
        assert_eq!(
            s.compare_exchange(
                ThreadState::Interruptible,
                ThreadState::Running,
                Ordering::AcqRel,
                Ordering::Acquire
            ),
            Err(ThreadState::Wakening)
        );
    }
}
