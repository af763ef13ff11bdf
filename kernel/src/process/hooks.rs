//! Seams for the external collaborators of the thread lifecycle.
//!
//! Address-space teardown, file-table release, signal delivery and the
//! like belong to other subsystems; they register here and the exit path
//! calls through. Defaults are no-ops so the core is self-contained.

use spin::RwLock;

use crate::sched::task::ThreadPtr;

/// Hooks the exit path runs.
#[derive(Clone, Copy)]
pub struct LifecycleHooks {
    /// Release user-space and file resources owned by the exiting thread
    /// (the `vm_put` / `vfs_fdtable_put` / `sigacts_put` family).
    pub release_resources: fn(ThreadPtr),
    /// Deliver the exiting thread's termination signal to its parent
    /// (kill-thread style delivery).
    pub deliver_exit_signal: fn(ThreadPtr, u32),
}

fn default_release(_t: ThreadPtr) {}

fn default_deliver(_parent: ThreadPtr, _signal: u32) {}

static HOOKS: RwLock<LifecycleHooks> = RwLock::new(LifecycleHooks {
    release_resources: default_release,
    deliver_exit_signal: default_deliver,
});

/// Install lifecycle hooks, replacing the defaults.
pub fn register(hooks: LifecycleHooks) {
    *HOOKS.write() = hooks;
}

pub(crate) fn release_resources(t: ThreadPtr) {
    (HOOKS.read().release_resources)(t);
}

pub(crate) fn deliver_exit_signal(parent: ThreadPtr, signal: u32) {
    (HOOKS.read().deliver_exit_signal)(parent, signal);
}
