//! # Host Port Layer
//!
//! Hosted implementation of the context-switch mechanism.
//!
//! ## Context Switch Mechanism
//!
//! Each kernel thread runs on its own host thread, but only the thread the
//! scheduler marks as current is allowed to make progress:
//!
//! ```text
//!   outgoing thread                       incoming thread
//!   ───────────────                       ───────────────
//!   update scheduler state (CS)
//!   current = next (CS)
//!   unpark(next) ───────────────────────► wakes, sees current == self
//!   park() until current == self          runs
//! ```
//!
//! The thread-local `CURRENT` records which kernel thread a host thread
//! backs, so kernel calls can identify their caller without a parameter.
//!
//! At shutdown a parked thread is unwound with a [`Shutdown`] payload; the
//! spawn wrapper swallows it so the host thread exits cleanly.

use std::any::Any;
use std::cell::Cell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crate::config::HOST_MIN_STACK;
use crate::thread::{ThreadConfig, ThreadId};

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// Unwind payload used to retire a parked thread when the kernel halts.
pub(crate) struct Shutdown;

/// What a parked thread should do after re-checking scheduler state.
pub(crate) enum Resume {
    /// It holds the CPU.
    Run,
    /// Keep waiting.
    Wait,
    /// The kernel is shutting down.
    Exit,
}

/// Kernel thread backed by the calling host thread, if any.
pub fn current() -> Option<ThreadId> {
    CURRENT.with(|c| c.get())
}

/// Create the host thread backing kernel thread `id`.
///
/// `body` runs with `CURRENT` set. A [`Shutdown`] unwind ends the thread
/// quietly; any other panic payload is passed to `on_panic`.
pub(crate) fn spawn<B, P>(
    config: &ThreadConfig,
    id: ThreadId,
    body: B,
    on_panic: P,
) -> io::Result<JoinHandle<()>>
where
    B: FnOnce() + Send + 'static,
    P: FnOnce(Box<dyn Any + Send>) + Send + 'static,
{
    thread::Builder::new()
        .name(config.name.to_string())
        .stack_size(config.stack_size.max(HOST_MIN_STACK))
        .spawn(move || {
            CURRENT.with(|c| c.set(Some(id)));
            match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(()) => {}
                Err(payload) if payload.is::<Shutdown>() => {}
                Err(payload) => on_panic(payload),
            }
        })
}

/// Park the calling host thread until `check` says it may run.
///
/// Spurious wakeups are harmless: the state is re-checked on every return
/// from `park`.
pub(crate) fn park_until(mut check: impl FnMut() -> Resume) {
    loop {
        match check() {
            Resume::Run => return,
            Resume::Wait => thread::park(),
            Resume::Exit => {
                // Already unwinding: a second unwind would abort the process.
                if thread::panicking() {
                    return;
                }
                panic::resume_unwind(Box::new(Shutdown));
            }
        }
    }
}

/// Hand the CPU token to the host thread `t`.
#[inline]
pub(crate) fn resume(t: &thread::Thread) {
    t.unpark();
}
