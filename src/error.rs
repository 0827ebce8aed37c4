//! # Errors
//!
//! Every recoverable failure in Spindle is a return value. Nothing here
//! unwinds, so the same paths stay usable from interrupt context.

/// Recoverable errors returned by the kernel, locks and containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The task table or a bounded container is full.
    #[error("capacity exceeded")]
    CapacityExceeded,

    /// The operation is only valid before the scheduler starts.
    #[error("the scheduler has already started")]
    AlreadyStarted,

    /// No registered task has the given id.
    #[error("no such task")]
    NoSuchTask,

    /// The operation may not target the reserved idle task.
    #[error("the idle task is reserved")]
    ReservedTask,

    /// The stack arena handed to `Kernel::start` cannot hold every task.
    #[error("stack arena exhausted")]
    ArenaExhausted,

    /// The lock or semaphore is taken and the caller asked not to wait.
    #[error("operation would block")]
    WouldBlock,

    /// The calling task already owns the lock it tried to acquire.
    #[error("lock is already owned by the calling task")]
    AlreadyOwned,

    /// A task tried to release a lock it does not own.
    #[error("lock is not owned by the calling task")]
    OwnershipViolation,

    /// A timeout-bounded wait expired.
    #[error("timed out")]
    Timeout,

    /// A bounded container had nothing to remove.
    #[error("container is empty")]
    Empty,
}

/// An insert a bounded container refused, handing the item back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected<T> {
    pub error: Error,
    pub item: T,
}

impl<T> Rejected<T> {
    pub(crate) fn new(error: Error, item: T) -> Self {
        Self { error, item }
    }

    /// Recover the item that was not inserted.
    pub fn into_inner(self) -> T {
        self.item
    }
}
