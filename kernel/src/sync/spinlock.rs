//! Interrupt-disabling spinlocks.
//!
//! Acquiring any of these locks disables interrupts on the local CPU first,
//! with per-CPU nesting (`push_off`/`pop_off`): interrupts are re-enabled
//! only when the outermost lock is released, and only if they were enabled
//! before the first acquire. The scheduler's yield preconditions consult
//! the nesting depth, so *all* locks that may be held around a suspension
//! point must come from this module.
//!
//! [`RawSpinLock`] is the manual-acquire form used where a lock is handed
//! across a context switch (run queues, wait queues); [`SpinLock`] wraps it
//! with data and an RAII guard for everything else.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{arch, sched::smp};

/// Sentinel owner value meaning "unlocked".
const NO_OWNER: usize = usize::MAX;

/// Disable interrupts and bump this CPU's nesting count, remembering the
/// previous interrupt state at depth zero.
pub fn push_off() {
    let was_enabled = arch::intr_get();
    arch::intr_off();
    let cpu = smp::this_cpu();
    if cpu.noff.fetch_add(1, Ordering::Relaxed) == 0 {
        cpu.intena.store(was_enabled, Ordering::Relaxed);
    }
}

/// Undo one [`push_off`]; re-enables interrupts at depth zero if they were
/// enabled originally. Unbalanced calls are fatal.
pub fn pop_off() {
    #[cfg(target_os = "none")]
    assert!(!arch::intr_get(), "pop_off with interrupts enabled");
    let cpu = smp::this_cpu();
    let prev = cpu.noff.fetch_sub(1, Ordering::Relaxed);
    assert!(prev >= 1, "unbalanced pop_off");
    if prev == 1 && cpu.intena.load(Ordering::Relaxed) {
        arch::intr_on();
    }
}

/// Current spinlock nesting depth on this CPU.
pub fn spin_depth() -> u32 {
    smp::this_cpu().noff.load(Ordering::Relaxed)
}

/// A dataless spinlock with manual acquire/release.
pub struct RawSpinLock {
    name: &'static str,
    locked: AtomicBool,
    /// CPU currently holding the lock, [`NO_OWNER`] when free.
    owner: AtomicUsize,
}

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
        }
    }

    /// Spin until the lock is held. Disables interrupts first.
    pub fn acquire(&self) {
        push_off();
        // Re-acquiring a lock this CPU already holds can only deadlock.
        // The check is reliable on bare metal, where one CPU runs one
        // thread; the host simulator maps every test thread to CPU 0, so
        // it is skipped there.
        #[cfg(target_os = "none")]
        assert!(!self.holding(), "deadlock: reacquired {:?}", self.name);

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.owner.store(arch::cpu_id(), Ordering::Relaxed);
    }

    /// Try once; returns whether the lock was taken.
    pub fn try_acquire(&self) -> bool {
        push_off();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(arch::cpu_id(), Ordering::Relaxed);
            true
        } else {
            pop_off();
            false
        }
    }

    /// Release the lock. Fatal if this CPU does not hold it (bare metal).
    pub fn release(&self) {
        #[cfg(target_os = "none")]
        assert!(self.holding(), "released {:?} while not holding it", self.name);
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    /// Does the current CPU hold this lock?
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == arch::cpu_id()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A spinlock protecting `T`, with an RAII guard.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to the inner T.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            raw: RawSpinLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.acquire();
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// The underlying raw lock, for holders that need to assert on it.
    pub fn raw(&self) -> &RawSpinLock {
        &self.raw
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_round_trip() {
        let _g = crate::test_support::lock();
        let l = SpinLock::new("t", 41u32);
        {
            let mut g = l.lock();
            *g += 1;
        }
        assert_eq!(*l.lock(), 42);
    }

    #[test]
    fn test_try_lock_contended() {
        let _g = crate::test_support::lock();
        let l = SpinLock::new("t2", ());
        let held = l.lock();
        assert!(l.try_lock().is_none());
        drop(held);
        assert!(l.try_lock().is_some());
    }

    #[test]
    fn test_nesting_balances() {
        let _g = crate::test_support::lock();
        let depth0 = spin_depth();
        let a = SpinLock::new("a", ());
        let b = SpinLock::new("b", ());
        let ga = a.lock();
        assert_eq!(spin_depth(), depth0 + 1);
        let gb = b.lock();
        assert_eq!(spin_depth(), depth0 + 2);
        drop(gb);
        drop(ga);
        assert_eq!(spin_depth(), depth0);
    }
}
