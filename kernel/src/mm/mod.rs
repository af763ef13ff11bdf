//! Memory management consumed by the lifecycle core.
//!
//! Two allocators: the page-block allocator in [`page`] hands out
//! power-of-two blocks for kernel stacks,
//! and the byte heap backs small metadata (`alloc::*` types). On bare metal
//! the heap is a [`linked_list_allocator`] fed once at boot; on the host the
//! system allocator is used and only [`page`] is exercised.

pub mod page;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Initialize the kernel byte heap over `[start, start + len)`.
///
/// # Safety
/// The range must be unused RAM, mapped writable, and handed to this
/// function exactly once.
#[cfg(target_os = "none")]
pub unsafe fn heap_init(start: *mut u8, len: usize) {
    // SAFETY: forwarded caller contract.
    unsafe { HEAP.lock().init(start, len) }
}

/// Heap allocation failure is unrecoverable in the kernel.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
