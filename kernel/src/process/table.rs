//! Thread table: id allocation and the registry of live threads.
//!
//! Guarded by a reader-preferring `spin::RwLock`; lookups take the read
//! side, exit's reparenting path takes an upgradeable read and upgrades.
//! Parent/child links are navigated under this lock. Thread ids are
//! allocated from `[FIRST_PID, MAX_PID)`; tid 0 belongs to idle threads
//! (never in the table) and tid 1 to init.

use core::sync::atomic::Ordering;

use alloc::{boxed::Box, collections::BTreeMap};
use lazy_static::lazy_static;
use spin::{RwLock, RwLockUpgradableGuard, RwLockWriteGuard};

use crate::{
    error::{KernelError, KernelResult},
    config::{FIRST_PID, MAX_PID},
    sched::smp,
    sched::task::{Thread, ThreadPtr, Tid},
};

pub struct ThreadTable {
    slots: BTreeMap<usize, ThreadPtr>,
    next_hint: usize,
}

impl ThreadTable {
    fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            next_hint: FIRST_PID,
        }
    }

    /// Allocate a free tid, scanning circularly from the hint.
    fn alloc_tid(&mut self) -> KernelResult<usize> {
        let span = MAX_PID - FIRST_PID;
        for i in 0..span {
            let tid = FIRST_PID + (self.next_hint - FIRST_PID + i) % span;
            if !self.slots.contains_key(&tid) {
                self.next_hint = FIRST_PID + (tid - FIRST_PID + 1) % span;
                return Ok(tid);
            }
        }
        Err(KernelError::ResourceExhausted {
            resource: "thread ids",
        })
    }

    pub fn get(&self, tid: usize) -> Option<ThreadPtr> {
        self.slots.get(&tid).copied()
    }

    pub fn remove(&mut self, tid: usize) -> Option<ThreadPtr> {
        self.slots.remove(&tid)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&usize, &ThreadPtr)> {
        self.slots.iter()
    }
}

lazy_static! {
    pub static ref THREAD_TABLE: RwLock<ThreadTable> = RwLock::new(ThreadTable::new());
}

/// Upgrade an upgradeable read guard to a writer, falling back to
/// drop-then-reacquire when another writer already queued.
pub fn upgrade_or_reacquire<'a>(
    lock: &'a RwLock<ThreadTable>,
    guard: RwLockUpgradableGuard<'a, ThreadTable>,
) -> RwLockWriteGuard<'a, ThreadTable> {
    match guard.try_upgrade() {
        Ok(w) => w,
        Err(g) => {
            drop(g);
            lock.write()
        }
    }
}

/// Assign a tid to a freshly created thread and publish it in the table,
/// attaching it to the calling thread as parent.
pub fn publish(mut thread: Box<Thread>) -> KernelResult<ThreadPtr> {
    let parent = smp::current_thread();

    let t = {
        let mut table = THREAD_TABLE.write();
        let tid = table.alloc_tid()?;
        thread.tid = Tid(tid);
        let t = ThreadPtr::leak(thread);
        table.slots.insert(tid, t);
        t
    };

    if let Some(p) = parent {
        t.get().parent.store(p.as_raw(), Ordering::Release);
        p.get().children.lock().push(t);
    }
    Ok(t)
}

/// Publish the init thread under tid 1. Fatal if init already exists.
pub fn publish_init(mut thread: Box<Thread>) -> ThreadPtr {
    let mut table = THREAD_TABLE.write();
    assert!(!table.slots.contains_key(&1), "init thread already published");
    thread.tid = Tid(1);
    let t = ThreadPtr::leak(thread);
    table.slots.insert(1, t);
    t
}

/// Look up a live thread by id.
pub fn lookup(tid: usize) -> Option<ThreadPtr> {
    THREAD_TABLE.read().get(tid)
}

/// The init thread, once published.
pub fn init_thread() -> Option<ThreadPtr> {
    lookup(1)
}

/// Remove a thread from the table, freeing its tid.
pub fn unpublish(tid: Tid) -> Option<ThreadPtr> {
    THREAD_TABLE.write().remove(tid.0)
}

/// Live thread count.
pub fn thread_count() -> usize {
    THREAD_TABLE.read().len()
}

/// Print the thread table (debug surface).
pub fn dump_threads() {
    let table = THREAD_TABLE.read();
    println!("{} threads:", table.len());
    for (tid, t) in table.iter() {
        let th = t.get();
        println!(
            "  tid {:4} {:16} state {:?} cpu {} on_rq {} on_cpu {}",
            tid,
            th.name,
            th.state.load(Ordering::Acquire),
            th.se.cpu.load(Ordering::Relaxed),
            th.se.on_rq.load(Ordering::Relaxed),
            th.se.on_cpu.load(Ordering::Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::entity::Priority;

    fn mk(name: &str) -> Box<Thread> {
        Thread::new_kthread(name, Priority::DEFAULT, |_| 0, 0).unwrap()
    }

    #[test]
    fn test_publish_assigns_distinct_tids() {
        let _g = crate::test_support::lock();
        let a = publish(mk("a")).unwrap();
        let b = publish(mk("b")).unwrap();
        assert_ne!(a.get().tid, b.get().tid);
        assert!(a.get().tid.0 >= FIRST_PID);
        assert_eq!(lookup(a.get().tid.0), Some(a));
        unpublish(a.get().tid);
        unpublish(b.get().tid);
        assert_eq!(lookup(a.get().tid.0), None);
    }

    #[test]
    fn test_tid_space_exhaustion_and_reuse() {
        let _g = crate::test_support::lock();
        // Exercise the allocator on a private table: fill every slot with
        // copies of one handle, drain one, reallocate it.
        let t = ThreadPtr::leak(mk("filler"));
        let mut table = ThreadTable::new();
        for tid in FIRST_PID..MAX_PID {
            table.slots.insert(tid, t);
        }
        assert_eq!(
            table.alloc_tid(),
            Err(KernelError::ResourceExhausted {
                resource: "thread ids"
            })
        );
        table.remove(100);
        assert_eq!(table.alloc_tid(), Ok(100));
    }

    #[test]
    fn test_upgrade_path() {
        let _g = crate::test_support::lock();
        let up = THREAD_TABLE.upgradeable_read();
        let w = upgrade_or_reacquire(&THREAD_TABLE, up);
        drop(w);
    }
}
