//! # Thread Control Block
//!
//! Defines the thread model for rtsync. Each thread has a fixed base
//! priority, an effective priority that differs from the base only while it
//! holds a priority-inheriting mutex some higher-precedence thread is waiting
//! on, and a state in the scheduler's state machine.
//!
//! Priorities follow the RTOS convention: a numerically **lower** value has
//! **higher** precedence.

use heapless::Vec;

use crate::clock::Ticks;
use crate::config::{DEFAULT_STACK_SIZE, DEFAULT_TIME_SLICE, MAX_HELD_MUTEXES};
use crate::mutex::MutexId;
use crate::semaphore::SemaphoreId;

/// Index of a thread in the kernel's thread table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) usize);

impl ThreadId {
    pub fn index(self) -> usize {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Thread state machine
// ---------------------------------------------------------------------------

/// Execution state of a thread.
///
/// ```text
///   ┌──────────┐     dispatch        ┌─────────┐
///   │  Ready   │ ──────────────────► │ Running │
///   └──────────┘                     └─────────┘
///        ▲  ▲      preempt / yield        │  │
///        │  └─────────────────────────────┘  │ lock / take / sleep
///        │                                   ▼
///        │   wake / timeout          ┌────────────────────┐
///        └────────────────────────── │ Blocked / Sleeping │
///                                    └────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Waiting in a ready queue.
    Ready,
    /// Holds the CPU.
    Running,
    /// Waiting on a mutex or semaphore.
    Blocked,
    /// Waiting for a clock deadline.
    Sleeping,
    /// Removed from scheduling until resumed.
    Suspended,
    /// Finished; the slot is never reused.
    Terminated,
}

/// Kernel object a blocked thread is queued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitObject {
    Mutex(MutexId),
    Semaphore(SemaphoreId),
}

/// Why a blocked thread was made ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The resource was handed over to this thread.
    Acquired,
    /// The wait deadline passed first.
    TimedOut,
}

// ---------------------------------------------------------------------------
// Thread configuration (immutable after creation)
// ---------------------------------------------------------------------------

/// Static configuration for a thread, set at spawn time.
#[derive(Debug, Clone, Copy)]
pub struct ThreadConfig {
    /// Name used for the host thread and in log output.
    pub name: &'static str,

    /// Base priority. `0` is the highest precedence,
    /// [`LOWEST_PRIORITY`](crate::config::LOWEST_PRIORITY) the lowest.
    pub priority: u8,

    /// Stack budget in bytes.
    pub stack_size: usize,

    /// Round-robin slice in ticks. If 0, uses `DEFAULT_TIME_SLICE`.
    pub time_slice: u32,
}

impl ThreadConfig {
    pub const fn new(name: &'static str, priority: u8) -> Self {
        Self {
            name,
            priority,
            stack_size: DEFAULT_STACK_SIZE,
            time_slice: 0,
        }
    }

    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub const fn with_time_slice(mut self, time_slice: u32) -> Self {
        self.time_slice = time_slice;
        self
    }

    /// Returns the effective time slice, falling back to the system default.
    #[inline]
    pub const fn effective_time_slice(&self) -> u32 {
        if self.time_slice > 0 {
            self.time_slice
        } else {
            DEFAULT_TIME_SLICE
        }
    }
}

/// Per-thread execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Ticks of CPU consumed through `work`.
    pub cpu_ticks: u64,
    /// Times the thread was given the CPU.
    pub dispatches: u64,
    /// Times the thread lost the CPU involuntarily.
    pub preemptions: u64,
}

// ---------------------------------------------------------------------------
// Thread Control Block
// ---------------------------------------------------------------------------

/// Thread Control Block: all state the kernel keeps for one thread.
pub struct ThreadControlBlock {
    pub id: ThreadId,
    pub config: ThreadConfig,
    pub state: ThreadState,

    /// Priority the thread was created with.
    pub base_priority: u8,

    /// Priority the scheduler uses. Equal to `base_priority` unless boosted
    /// through priority inheritance.
    pub effective_priority: u8,

    /// Remaining ticks in the current time slice.
    pub ticks_remaining: u32,

    /// Absolute deadline of a sleep or a bounded wait.
    pub wake_at: Option<Ticks>,

    pub waiting_on: Option<WaitObject>,
    pub wake_reason: Option<WakeReason>,

    /// Set by `suspend`; a suspended thread is never queued as ready.
    pub suspended: bool,

    /// Last queued at the head of its ready level.
    pub queued_front: bool,

    /// Mutexes currently owned, in acquisition order.
    pub held: Vec<MutexId, MAX_HELD_MUTEXES>,

    /// Host thread backing this kernel thread, used to hand it the CPU.
    pub host: Option<std::thread::Thread>,

    pub stats: ThreadStats,
}

impl ThreadControlBlock {
    /// Create a TCB for a new thread in the Ready state.
    pub fn new(id: ThreadId, config: ThreadConfig) -> Self {
        Self {
            id,
            config,
            state: ThreadState::Ready,
            base_priority: config.priority,
            effective_priority: config.priority,
            ticks_remaining: config.effective_time_slice(),
            wake_at: None,
            waiting_on: None,
            wake_reason: None,
            suspended: false,
            queued_front: false,
            held: Vec::new(),
            host: None,
            stats: ThreadStats::default(),
        }
    }

    /// True if this thread has strictly higher precedence than `priority`.
    #[inline]
    pub fn outranks(&self, priority: u8) -> bool {
        self.effective_priority < priority
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.state != ThreadState::Terminated
    }

    /// Refill the round-robin slice.
    pub fn reset_slice(&mut self) {
        self.ticks_remaining = self.config.effective_time_slice();
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        ThreadSnapshot {
            id: self.id,
            name: self.config.name,
            state: self.state,
            base_priority: self.base_priority,
            effective_priority: self.effective_priority,
            stats: self.stats,
        }
    }
}

/// Read-only copy of a thread's scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub name: &'static str,
    pub state: ThreadState,
    pub base_priority: u8,
    pub effective_priority: u8,
    pub stats: ThreadStats,
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
