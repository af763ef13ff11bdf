//! Synchronization primitives.
//!
//! [`spinlock`] provides the interrupt-disabling spinlock every IRQ-sensitive
//! path uses; [`rcu`] is the epoch-based deferred-reclamation machinery.
//! Locks that are never taken from interrupt context (allocator pools,
//! bookkeeping lists) use `spin::Mutex`/`spin::RwLock` directly.
//!
//! Lock ordering, top-down: wait-queue lock < thread pi-lock < run-queue
//! lock < thread-table rwlock. Run-queue lock pairs are acquired in address
//! order.

pub mod rcu;
pub mod spinlock;

pub use spinlock::{pop_off, push_off, spin_depth, RawSpinLock, SpinLock, SpinLockGuard};
