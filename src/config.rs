//! # rtsync Configuration
//!
//! Compile-time constants governing the kernel tables and scheduler
//! behavior. All limits are fixed at compile time: the thread table, the
//! ready queues and every wait queue are fixed-capacity containers.

/// Maximum number of threads the kernel can manage over its lifetime.
/// Thread slots are never reused; spawning past this is a configuration
/// error.
pub const MAX_THREADS: usize = 16;

/// Number of distinct priority levels. Valid priorities are
/// `0..NUM_PRIORITIES`, where a numerically lower value has higher
/// precedence.
pub const NUM_PRIORITIES: usize = 32;

/// Lowest-precedence priority a thread may be given.
pub const LOWEST_PRIORITY: u8 = (NUM_PRIORITIES - 1) as u8;

/// Capacity of the mutex table.
pub const MAX_MUTEXES: usize = 32;

/// Capacity of the semaphore table. Every `BoundedQueue` consumes two.
pub const MAX_SEMAPHORES: usize = 32;

/// Capacity of the timer table.
pub const MAX_TIMERS: usize = 8;

/// Maximum number of mutexes a single thread may hold at once.
pub const MAX_HELD_MUTEXES: usize = 8;

/// Default time slice in ticks. Equal-priority ready threads round-robin
/// on this boundary.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Default per-thread stack budget in bytes.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024;

/// Host threads get at least this much stack regardless of the requested
/// budget. The host runtime needs far more than a microcontroller task.
pub const HOST_MIN_STACK: usize = 256 * 1024;
