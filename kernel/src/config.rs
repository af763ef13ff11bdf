//! Compile-time kernel configuration.
//!
//! The lifecycle core has no runtime configuration; everything tunable is a
//! constant here so the other subsystems share one source of truth.

/// Maximum number of CPUs (harts) supported.
pub const MAX_CPUS: usize = 8;

/// Upper bound (exclusive) of the thread id space. Allocatable ids live in
/// `[2, MAX_PID)`; tid 0 is reserved for idle threads and tid 1 for init.
pub const MAX_PID: usize = 4096;

/// First allocatable thread id.
pub const FIRST_PID: usize = 2;

/// Number of scheduler priority-class slots. A priority's high 6 bits
/// select the slot, so this is fixed at 64.
pub const NR_SCHED_CLASSES: usize = 64;

/// Base page size used by the page-block allocator.
pub const PAGE_SIZE: usize = 4096;

/// Largest supported page-block order (blocks of `PAGE_SIZE << order`).
pub const MAX_PAGE_ORDER: usize = 6;

/// Kernel stacks are one block of `PAGE_SIZE << KSTACK_ORDER` bytes.
pub const KSTACK_ORDER: usize = 2;

/// Default timer-tick budget handed to a freshly scheduled FIFO thread.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// How many monotonic ticks elapse between reclaim scans on a CPU.
///
/// At the QEMU virt 10 MHz timebase this is roughly 10 ms.
pub const RCU_SCAN_PERIOD_TICKS: u64 = 100_000;

/// Spin iterations a synchronous grace-period wait tolerates before the
/// watchdog declares a deadlock and panics.
pub const RCU_WATCHDOG_SPINS: u64 = 100_000_000;

/// Monotonic-tick value past which the reclaim worker renormalizes all
/// recorded timestamps. Never reached at realistic tick rates; kept far
/// below `u64::MAX` so the subtraction in the normalizer cannot wrap.
pub const TICK_NORMALIZE_THRESHOLD: u64 = 1 << 62;

/// Bounded spins while waiting for a reaped child to leave its CPU before
/// falling back to yielding.
pub const REAP_ONCPU_SPINS: u32 = 10_000;

/// Number of buckets in the device registry hash table.
pub const DEV_REGISTRY_BUCKETS: usize = 64;
