//! # Timers and ISR Context
//!
//! Software timers fire on the tick, the way a hardware timer interrupt
//! would. Their callbacks run in a restricted context: they receive an
//! [`IsrContext`] that only offers non-blocking hand-off operations, and the
//! kernel rejects any blocking call made while a callback is executing.
//!
//! ```text
//!   tick / idle jump
//!     └─► timer due ──► callback(&IsrContext)
//!                          ├─► give(&Semaphore)     wake a thread
//!                          ├─► post(&BoundedQueue)  pass a message
//!                          └─► submit(&WorkQueue)   defer a job
//!     └─► preemption check  ◄── woken threads run only after this
//! ```

use heapless::Vec;
use log::trace;

use crate::clock::Ticks;
use crate::config::MAX_TIMERS;
use crate::error::{ConfigError, KernelError};
use crate::kernel::{Kernel, KernelState};
use crate::queue::BoundedQueue;
use crate::semaphore::Semaphore;
use crate::workqueue::{Job, WorkQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) usize);

pub(crate) type TimerCallback = Box<dyn FnMut(&IsrContext<'_>) + Send>;

pub(crate) struct TimerState {
    /// Absolute time of the next expiry, `None` while stopped.
    pub next: Option<Ticks>,
    pub period: Option<Ticks>,
    /// Taken out while the callback runs.
    pub callback: Option<TimerCallback>,
    pub expirations: u64,
}

impl KernelState {
    /// Collect timers due at the current time and schedule their next
    /// expiry.
    pub(crate) fn due_timers(&mut self) -> Vec<TimerId, MAX_TIMERS> {
        let now = self.sched.clock.now();
        let mut due = Vec::new();
        for (i, t) in self.timers.iter_mut().enumerate() {
            let Some(at) = t.next else {
                continue;
            };
            if at > now {
                continue;
            }
            t.expirations += 1;
            t.next = t.period.map(|p| at + p);
            let _ = due.push(TimerId(i));
        }
        due
    }
}

impl Kernel {
    pub(crate) fn fire_timer(&self, id: TimerId) {
        let callback = self.with(|k| {
            k.in_isr += 1;
            k.timers[id.0].callback.take()
        });
        let mut callback = callback;
        if let Some(cb) = callback.as_mut() {
            trace!("timer: {:?} fired at {}", id, self.now());
            cb(&IsrContext { kernel: self });
        }
        self.with(|k| {
            let slot = &mut k.timers[id.0].callback;
            if slot.is_none() {
                *slot = callback;
            }
            k.in_isr -= 1;
        });
    }
}

/// Operations available to a timer callback. None of them block or switch
/// threads; a thread woken here runs once the callback has returned.
pub struct IsrContext<'a> {
    kernel: &'a Kernel,
}

impl IsrContext<'_> {
    pub fn now(&self) -> Ticks {
        self.kernel.now()
    }

    /// Give a semaphore.
    pub fn give(&self, sem: &Semaphore) -> Result<(), KernelError> {
        sem.give_in_isr()
    }

    /// Post a message without waiting. The item comes back if the queue is
    /// full.
    pub fn post<T: Send, const N: usize>(&self, queue: &BoundedQueue<T, N>, item: T) -> Result<(), T> {
        queue.post_in_isr(item)
    }

    /// Defer `job` to a work queue's thread.
    pub fn submit<const N: usize>(&self, work: &WorkQueue<N>, job: Job) -> Result<(), Job> {
        work.submit_in_isr(job)
    }
}

/// Handle to a software timer. Clones refer to the same timer.
#[derive(Clone)]
pub struct Timer {
    kernel: Kernel,
    id: TimerId,
}

impl Timer {
    /// Register a stopped timer.
    pub fn new<F>(kernel: &Kernel, callback: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&IsrContext<'_>) + Send + 'static,
    {
        let id = kernel.with(|k| {
            let id = TimerId(k.timers.len());
            k.timers
                .push(TimerState {
                    next: None,
                    period: None,
                    callback: Some(Box::new(callback)),
                    expirations: 0,
                })
                .map_err(|_| ConfigError::ObjectTableFull {
                    kind: "timer",
                    capacity: MAX_TIMERS,
                })?;
            Ok(id)
        })?;
        Ok(Self {
            kernel: kernel.clone(),
            id,
        })
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Arm the timer to fire `delay` ticks from now, then every `period`
    /// ticks if given. Restarting an armed timer replaces its schedule.
    pub fn start(&self, delay: Ticks, period: Option<Ticks>) -> Result<(), ConfigError> {
        if delay == 0 {
            return Err(ConfigError::InvalidParameter("timer delay must be non-zero"));
        }
        if period == Some(0) {
            return Err(ConfigError::InvalidParameter("timer period must be non-zero"));
        }
        self.kernel.with(|k| {
            let now = k.sched.clock.now();
            let t = &mut k.timers[self.id.0];
            t.next = Some(now + delay);
            t.period = period;
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.kernel.with(|k| k.timers[self.id.0].next = None);
    }

    pub fn is_running(&self) -> bool {
        self.kernel.with(|k| k.timers[self.id.0].next.is_some())
    }

    pub fn expirations(&self) -> u64 {
        self.kernel.with(|k| k.timers[self.id.0].expirations)
    }
}
