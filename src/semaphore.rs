//! # Counting Semaphore
//!
//! Bounded counter with a FIFO wait queue. Serves both as a signal (binary
//! semaphore, `max = 1`) and as a resource counter.
//!
//! `give` hands the count straight to the longest-waiting taker when there
//! is one, so the count is only incremented when nobody is waiting.
//! Invariant: `0 <= count <= max` at all times.

use heapless::Vec;
use log::{debug, trace};

use crate::clock::Timeout;
use crate::config::{MAX_SEMAPHORES, MAX_THREADS};
use crate::error::{ConfigError, KernelError};
use crate::kernel::{Acquire, Kernel, KernelState};
use crate::thread::{ThreadId, WaitObject, WakeReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(pub(crate) usize);

pub(crate) struct SemaphoreState {
    pub count: u32,
    pub max: u32,
    pub waiters: Vec<ThreadId, MAX_THREADS>,
}

impl KernelState {
    pub(crate) fn semaphore_create(&mut self, initial: u32, max: u32) -> Result<SemaphoreId, ConfigError> {
        if max == 0 {
            return Err(ConfigError::ZeroSemaphoreMax);
        }
        if initial > max {
            return Err(ConfigError::InitialExceedsMax { initial, max });
        }
        let id = SemaphoreId(self.semaphores.len());
        self.semaphores
            .push(SemaphoreState {
                count: initial,
                max,
                waiters: Vec::new(),
            })
            .map_err(|_| ConfigError::ObjectTableFull {
                kind: "semaphore",
                capacity: MAX_SEMAPHORES,
            })?;
        Ok(id)
    }

    /// Returns the waiter the count was handed to, if any.
    pub(crate) fn semaphore_give(&mut self, id: SemaphoreId) -> Result<Option<ThreadId>, KernelError> {
        let s = &mut self.semaphores[id.0];
        if !s.waiters.is_empty() {
            let next = s.waiters.remove(0);
            self.wake(next, WakeReason::Acquired);
            return Ok(Some(next));
        }
        if s.count >= s.max {
            return Err(KernelError::CountAtMax);
        }
        s.count += 1;
        Ok(None)
    }

    /// Take one unit without waiting.
    pub(crate) fn semaphore_try_take(&mut self, id: SemaphoreId) -> bool {
        let s = &mut self.semaphores[id.0];
        if s.count > 0 {
            s.count -= 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn semaphore_take(&mut self, id: SemaphoreId, me: ThreadId, timeout: Timeout) -> Result<Acquire, KernelError> {
        if self.semaphore_try_take(id) {
            return Ok(Acquire::Now);
        }
        if timeout.is_poll() {
            return Err(KernelError::WouldBlock);
        }
        let deadline = timeout.deadline(self.sched.clock.now());
        // A blocked thread is queued at most once.
        let _ = self.semaphores[id.0].waiters.push(me);
        self.block_on(me, WaitObject::Semaphore(id), deadline);
        Ok(Acquire::Blocked)
    }

    pub(crate) fn semaphore_cancel_wait(&mut self, id: SemaphoreId, waiter: ThreadId) {
        self.semaphores[id.0].waiters.retain(|&t| t != waiter);
    }
}

/// Handle to a kernel semaphore. Clones refer to the same semaphore.
#[derive(Clone)]
pub struct Semaphore {
    kernel: Kernel,
    id: SemaphoreId,
}

impl Semaphore {
    /// # Errors
    /// `ZeroSemaphoreMax` if `max == 0`, `InitialExceedsMax` if
    /// `initial > max`, or `ObjectTableFull`.
    pub fn new(kernel: &Kernel, initial: u32, max: u32) -> Result<Self, ConfigError> {
        let id = kernel.with(|k| k.semaphore_create(initial, max))?;
        Ok(Self {
            kernel: kernel.clone(),
            id,
        })
    }

    /// A binary semaphore, initially empty.
    pub fn binary(kernel: &Kernel) -> Result<Self, ConfigError> {
        Self::new(kernel, 0, 1)
    }

    pub fn id(&self) -> SemaphoreId {
        self.id
    }

    /// Release one unit, waking the longest waiter if there is one.
    ///
    /// May be called from any context, including before the kernel runs.
    /// A woken waiter with higher precedence than the caller runs
    /// immediately.
    ///
    /// # Errors
    /// `CountAtMax` if the count is already at `max`; nothing changes.
    pub fn give(&self) -> Result<(), KernelError> {
        let woken = self.kernel.with(|k| k.semaphore_give(self.id))?;
        if let Some(t) = woken {
            trace!("sem: {:?} handed to {:?}", self.id, t);
            self.kernel.preempt_point(self.kernel.current());
        }
        Ok(())
    }

    /// Give from timer context. Never switches threads.
    pub(crate) fn give_in_isr(&self) -> Result<(), KernelError> {
        self.kernel.with(|k| k.semaphore_give(self.id)).map(|_| ())
    }

    /// Take from timer context without waiting.
    pub(crate) fn try_take_in_isr(&self) -> bool {
        self.kernel.with(|k| k.semaphore_try_take(self.id))
    }

    /// Take one unit, waiting at most `timeout`.
    ///
    /// # Errors
    /// `WouldBlock` if a poll finds the count at zero, `Timeout` if a
    /// bounded wait expires first.
    pub fn take(&self, timeout: Timeout) -> Result<(), KernelError> {
        let me = self.kernel.wait_context(timeout)?;
        let outcome = self.kernel.with(|k| k.semaphore_take(self.id, me, timeout))?;
        if let Acquire::Blocked = outcome {
            debug!("sem: {:?} blocked on {:?}", me, self.id);
        }
        self.kernel.finish_wait(me, outcome)
    }

    pub fn count(&self) -> u32 {
        self.kernel.with(|k| k.semaphores[self.id.0].count)
    }

    pub fn max(&self) -> u32 {
        self.kernel.with(|k| k.semaphores[self.id.0].max)
    }

    /// Number of threads waiting.
    pub fn waiters(&self) -> usize {
        self.kernel.with(|k| k.semaphores[self.id.0].waiters.len())
    }
}
