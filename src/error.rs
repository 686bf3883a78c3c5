//! # Errors
//!
//! Three classes of failure, mirroring how the kernel reports them:
//!
//! - [`ConfigError`]: a table is exhausted or a parameter is invalid. Raised
//!   at creation time; the caller is expected to abort startup.
//! - [`KernelError`]: a caller-contract violation, or a recoverable
//!   would-block / timeout. Primitive state is left unmodified.
//! - [`RunError`]: what a harness returns when either of the above stops it.

use thiserror::Error;

use crate::thread::ThreadId;

/// Startup-time configuration failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("thread table exhausted (capacity {capacity})")]
    ThreadTableFull { capacity: usize },

    #[error("{kind} table exhausted (capacity {capacity})")]
    ObjectTableFull { kind: &'static str, capacity: usize },

    #[error("priority {priority} out of range (lowest allowed is {lowest})")]
    InvalidPriority { priority: u8, lowest: u8 },

    #[error("capacity must be non-zero")]
    ZeroCapacity,

    #[error("semaphore max must be non-zero")]
    ZeroSemaphoreMax,

    #[error("semaphore initial count {initial} exceeds max {max}")]
    InitialExceedsMax { initial: u32, max: u32 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("failed to create host thread: {0}")]
    HostSpawn(String),
}

/// Runtime failure of a kernel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("thread {caller:?} unlocked a mutex owned by {owner:?}")]
    NotOwner {
        caller: ThreadId,
        owner: Option<ThreadId>,
    },

    #[error("thread {0:?} already owns this mutex")]
    Relock(ThreadId),

    #[error("semaphore already at its maximum count")]
    CountAtMax,

    #[error("operation would block")]
    WouldBlock,

    #[error("timed out")]
    Timeout,

    #[error("blocking call outside a kernel thread")]
    NotInThread,

    #[error("blocking call from timer context")]
    InIsr,

    #[error("blocking call with preemption disabled")]
    PreemptionDisabled,

    #[error("thread {0:?} holds too many mutexes")]
    TooManyHeld(ThreadId),

    #[error("no such thread {0:?}")]
    NoSuchThread(ThreadId),

    #[error("kernel already started")]
    AlreadyStarted,

    #[error("queue storage out of step with its counting semaphores")]
    QueueInconsistent,
}

/// Failure of a harness run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}
