//! # rtsync
//!
//! A single-core preemptive RTOS kernel, simulated on the host, with the
//! blocking synchronization primitives a real-time application builds on
//! and a set of worked scenarios that exercise them.
//!
//! ## Overview
//!
//! Every kernel thread is backed by a host thread, but only one of them
//! holds the CPU at a time. The scheduler hands the CPU over explicitly, so
//! a run is as deterministic as a run on one core: the highest-precedence
//! ready thread always runs, equal priorities share the CPU round-robin,
//! and virtual time advances only when a thread does work or the system
//! idles.
//!
//! - **Lower number, higher precedence**: priority 0 outranks priority 31
//! - **FIFO wait queues**: waiters on one object are served in arrival order
//! - **Explicit lock/unlock**: a mutex is released by a call, not a guard
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                     Scenarios                           │
//! │  philosophers.rs · prodcons.rs · inversion.rs          │
//! │  sampler.rs                                            │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │    spawn() · run() · work() · sleep() · yield_now()    │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Scheduler   │  Blocking objects  │  Timer context    │
//! │  scheduler.rs│  mutex.rs          │  timer.rs         │
//! │  ─ tick()    │  semaphore.rs      │  workqueue.rs     │
//! │  ─ pick_next │  queue.rs          │  ─ IsrContext     │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │        Thread Model (thread.rs) · Clock (clock.rs)      │
//! │    TCB · ThreadState · WaitObject · Ticks · Timeout    │
//! ├────────────────────────────────────────────────────────┤
//! │   Critical sections (sync.rs) · Host port (arch/host)  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **Fixed tables**: threads, mutexes, semaphores and timers live in
//!   `heapless::Vec`s sized by [`config`]
//! - **Fixed queues**: [`BoundedQueue`] storage is a `heapless::Deque`
//! - **Critical sections**: all kernel state sits behind
//!   `critical_section::Mutex<RefCell<_>>`

pub mod arch;
pub mod clock;
pub mod config;
pub mod error;
pub mod inversion;
pub mod kernel;
pub mod mutex;
pub mod philosophers;
pub mod prodcons;
pub mod queue;
pub mod sampler;
pub mod scheduler;
pub mod semaphore;
pub mod sync;
pub mod thread;
pub mod timer;
pub mod workqueue;

pub use clock::{Ticks, Timeout};
pub use error::{ConfigError, KernelError, RunError};
pub use kernel::{HaltReason, Kernel, RunSummary};
pub use mutex::{Mutex, MutexMode};
pub use queue::{BoundedQueue, TrySendError};
pub use semaphore::Semaphore;
pub use thread::{ThreadConfig, ThreadId, ThreadState};
pub use timer::{IsrContext, Timer};
pub use workqueue::{Job, WorkQueue};
