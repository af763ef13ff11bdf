//! Error types for the HartOS kernel.
//!
//! Fallible operations return [`KernelResult`]; invariant violations do not
//! surface here at all, they panic. Subsystems with their own vocabulary
//! (scheduler, wait queues, device registry) get a nested enum that converts
//! into [`KernelError`] via `From`, so `?` composes across layers.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory allocation failed.
    OutOfMemory { requested: usize },
    /// A finite resource (pid space, timer slots) ran out.
    ResourceExhausted { resource: &'static str },
    /// Caller passed something nonsensical.
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    /// A keyed entity already exists.
    AlreadyExists { resource: &'static str, id: u64 },
    /// A keyed entity does not exist.
    NotFound { resource: &'static str, id: u64 },
    /// Operation would block and the caller asked not to.
    WouldBlock,
    /// Subsystem used before its `init()` ran.
    NotInitialized { subsystem: &'static str },

    /// Scheduler-specific errors.
    Sched(SchedError),
    /// Wait-queue errors.
    Queue(QueueError),
    /// Device-registry errors.
    Device(DeviceError),
}

/// Scheduler-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Priority does not map to a registered class.
    InvalidPriority { prio: u8 },
    /// CPU id out of range or offline.
    InvalidCpu { cpu: usize },
    /// Thread id not present in the thread table.
    TaskNotFound { tid: usize },
    /// Affinity mask excludes every online CPU.
    InvalidAffinity,
}

/// Wait-queue errors.
///
/// `Interrupted` and `Waker` also travel through the sleeping thread's wait
/// node, which is how an asynchronous waker hands its error to the waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Sleep was aborted by an asynchronous wake.
    Interrupted,
    /// The waker supplied a nonzero error code.
    Waker(i32),
    /// `bulk_move` destination was not empty.
    DestinationNotEmpty,
    /// Wake targeted a queue with no waiters.
    Empty,
}

/// Device-registry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// No device registered under that (major, minor).
    NoSuchDevice { major: u32, minor: u32 },
    /// Device exists but is of a different class than requested.
    WrongClass,
    /// The operation table has no handler for the requested op.
    OpNotSupported { op: &'static str },
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: requested {} bytes", requested)
            }
            Self::ResourceExhausted { resource } => write!(f, "resource exhausted: {}", resource),
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} with id {} already exists", resource, id)
            }
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::Sched(e) => write!(f, "scheduler error: {:?}", e),
            Self::Queue(e) => write!(f, "wait-queue error: {:?}", e),
            Self::Device(e) => write!(f, "device error: {:?}", e),
        }
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Sched(err)
    }
}

impl From<QueueError> for KernelError {
    fn from(err: QueueError) -> Self {
        Self::Queue(err)
    }
}

impl From<DeviceError> for KernelError {
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        let e = KernelError::OutOfMemory { requested: 4096 };
        assert_eq!(
            std::format!("{}", e),
            "out of memory: requested 4096 bytes"
        );

        let e = KernelError::NotFound {
            resource: "device",
            id: 7,
        };
        assert_eq!(std::format!("{}", e), "device with id 7 not found");
    }

    #[test]
    fn test_subsystem_conversion() {
        fn queue_op() -> Result<(), QueueError> {
            Err(QueueError::Interrupted)
        }
        fn kernel_op() -> KernelResult<()> {
            queue_op()?;
            Ok(())
        }
        assert_eq!(
            kernel_op(),
            Err(KernelError::Queue(QueueError::Interrupted))
        );
    }
}
