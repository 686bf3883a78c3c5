//! # Clock
//!
//! Monotonic virtual time. The clock only moves when the running thread
//! burns CPU (one tick per unit of [`Kernel::work`](crate::kernel::Kernel::work))
//! or when the CPU is idle and the kernel jumps straight to the next pending
//! event. Every latency the kernel reports is therefore exact and
//! reproducible.

/// Kernel time unit.
pub type Ticks = u64;

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Poll once, never block.
    NoWait,
    /// Block until the resource is available.
    Forever,
    /// Block for at most this many ticks. `Ticks(0)` behaves as `NoWait`.
    Ticks(Ticks),
}

impl Timeout {
    /// Absolute deadline for a wait starting at `now`, if bounded.
    pub fn deadline(self, now: Ticks) -> Option<Ticks> {
        match self {
            Timeout::Ticks(t) => Some(now.saturating_add(t)),
            _ => None,
        }
    }

    /// True if the caller must not be put to sleep.
    pub fn is_poll(self) -> bool {
        matches!(self, Timeout::NoWait | Timeout::Ticks(0))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Clock {
    now: Ticks,
}

impl Clock {
    pub const fn new() -> Self {
        Self { now: 0 }
    }

    #[inline]
    pub fn now(&self) -> Ticks {
        self.now
    }

    /// Advance by one tick and return the new time.
    pub fn tick(&mut self) -> Ticks {
        self.now += 1;
        self.now
    }

    /// Jump forward to `deadline`. Never moves backwards.
    pub fn advance_to(&mut self, deadline: Ticks) {
        if deadline > self.now {
            self.now = deadline;
        }
    }
}
