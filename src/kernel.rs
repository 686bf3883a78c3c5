//! # Kernel
//!
//! Top-level kernel object and public thread API for rtsync.
//!
//! A [`Kernel`] is an explicit context: it owns the scheduler, the kernel
//! object tables (mutexes, semaphores, timers) and the host threads backing
//! every kernel thread. Primitives hold a clone of the handle, so nothing is
//! reachable through process-wide globals.
//!
//! ## Startup Sequence
//!
//! ```text
//! Kernel::new()
//!   ├─► Mutex::new / Semaphore::new / BoundedQueue::new / Timer::new
//!   ├─► kernel.spawn()          ← register threads (×N), each parked
//!   └─► kernel.run(limit)       ← boot: dispatch the first thread
//!         ├─► threads run one at a time, clock advances on work/idle
//!         └─► halt: all terminated | time limit | idle | panic
//!               └─► shutdown: unwind and join every host thread
//! ```
//!
//! ## Time
//!
//! The running thread advances the clock one tick per unit of
//! [`Kernel::work`]. Each tick expires sleeps and bounded waits, fires due
//! timers, then checks for preemption, which is what the SysTick handler
//! does on hardware. When no thread is ready the idle path jumps the clock
//! straight to the next pending event.

use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use heapless::Vec;
use log::{debug, error, info, warn};

use crate::arch::host::{self, Resume};
use crate::clock::{Ticks, Timeout};
use crate::config::{MAX_MUTEXES, MAX_SEMAPHORES, MAX_THREADS, MAX_TIMERS};
use crate::error::{ConfigError, KernelError};
use crate::mutex::MutexState;
use crate::scheduler::Scheduler;
use crate::semaphore::SemaphoreState;
use crate::sync::{self, Guarded};
use crate::thread::{ThreadConfig, ThreadId, ThreadSnapshot, ThreadState, WaitObject, WakeReason};
use crate::timer::TimerState;

/// Why [`Kernel::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Every thread ran to completion.
    AllTerminated,
    /// The clock reached the run limit.
    TimeLimit,
    /// Live threads remain but none is ready and no sleep, timeout or timer
    /// is pending. A deadlock ends this way.
    Idle { blocked: usize },
    /// A kernel thread panicked; the panic is re-raised by `run`.
    Panicked,
}

/// Result of a completed [`Kernel::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub reason: HaltReason,
    pub ended_at: Ticks,
    pub context_switches: u64,
    pub threads: std::vec::Vec<ThreadSnapshot>,
}

// ---------------------------------------------------------------------------
// Kernel state (always accessed inside a critical section)
// ---------------------------------------------------------------------------

pub(crate) struct KernelState {
    pub sched: Scheduler,
    pub mutexes: Vec<MutexState, MAX_MUTEXES>,
    pub semaphores: Vec<SemaphoreState, MAX_SEMAPHORES>,
    pub timers: Vec<TimerState, MAX_TIMERS>,

    /// Nesting depth of timer callbacks currently executing.
    pub in_isr: u32,

    limit: Option<Ticks>,
    started: bool,
    shutdown: bool,
    halted: Option<HaltReason>,
    runner: Option<thread::Thread>,
    joins: Vec<JoinHandle<()>, MAX_THREADS>,
    panic: Option<Box<dyn Any + Send>>,
}

/// Result of trying to acquire a mutex or semaphore.
pub(crate) enum Acquire {
    /// Taken without waiting.
    Now,
    /// The caller has been queued and must block.
    Blocked,
}

enum Dispatch {
    Run {
        next: ThreadId,
        host: Option<thread::Thread>,
    },
    Idle,
    Halt(Option<thread::Thread>),
}

impl KernelState {
    fn new() -> Self {
        Self {
            sched: Scheduler::new(),
            mutexes: Vec::new(),
            semaphores: Vec::new(),
            timers: Vec::new(),
            in_isr: 0,
            limit: None,
            started: false,
            shutdown: false,
            halted: None,
            runner: None,
            joins: Vec::new(),
            panic: None,
        }
    }

    /// Make a waiting thread ready, recording why it woke.
    pub(crate) fn wake(&mut self, id: ThreadId, reason: WakeReason) {
        let tcb = self.sched.tcb_mut(id);
        tcb.waiting_on = None;
        tcb.wake_at = None;
        tcb.wake_reason = Some(reason);
        self.sched.make_ready(id);
    }

    /// Queue the running thread `me` on a kernel object.
    pub(crate) fn block_on(&mut self, me: ThreadId, object: WaitObject, deadline: Option<Ticks>) {
        let tcb = self.sched.tcb_mut(me);
        tcb.state = ThreadState::Blocked;
        tcb.waiting_on = Some(object);
        tcb.wake_at = deadline;
        tcb.wake_reason = None;
    }

    /// Wake sleepers and time out bounded waits whose deadline has passed.
    fn expire_waits(&mut self) {
        let now = self.sched.clock.now();
        for id in self.sched.due_wakeups(now) {
            match self.sched.tcb(id).state {
                ThreadState::Sleeping => {
                    self.sched.tcb_mut(id).wake_at = None;
                    self.sched.make_ready(id);
                }
                ThreadState::Blocked => {
                    match self.sched.tcb(id).waiting_on {
                        Some(WaitObject::Mutex(m)) => self.mutex_cancel_wait(m, id),
                        Some(WaitObject::Semaphore(s)) => self.semaphore_cancel_wait(s, id),
                        None => {}
                    }
                    self.wake(id, WakeReason::TimedOut);
                }
                _ => {}
            }
        }
    }

    fn next_event(&self) -> Option<Ticks> {
        let timers = self.timers.iter().filter_map(|t| t.next).min();
        match (self.sched.next_deadline(), timers) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn halt(&mut self, reason: HaltReason) -> Option<thread::Thread> {
        if self.halted.is_none() {
            info!("kernel: halted at {} ({:?})", self.sched.clock.now(), reason);
            self.halted = Some(reason);
        }
        self.runner.clone()
    }

    /// Pick the next thread to run, idling or halting if there is none.
    fn dispatch(&mut self) -> Dispatch {
        if self.halted.is_some() || self.shutdown {
            return Dispatch::Halt(self.runner.clone());
        }
        if let Some(next) = self.sched.pick_next() {
            let host = self.sched.tcb(next).host.clone();
            return Dispatch::Run { next, host };
        }

        self.sched.current = None;
        let live = self.sched.live_threads();
        if live == 0 {
            return Dispatch::Halt(self.halt(HaltReason::AllTerminated));
        }

        match self.next_event() {
            Some(at) => {
                if let Some(limit) = self.limit {
                    if at >= limit {
                        self.sched.clock.advance_to(limit);
                        return Dispatch::Halt(self.halt(HaltReason::TimeLimit));
                    }
                }
                self.sched.clock.advance_to(at);
                Dispatch::Idle
            }
            None => Dispatch::Halt(self.halt(HaltReason::Idle { blocked: live })),
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel handle
// ---------------------------------------------------------------------------

/// Handle to a kernel instance. Cheap to clone; all clones share one kernel.
#[derive(Clone)]
pub struct Kernel {
    state: Arc<Guarded<KernelState>>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            state: Arc::new(sync::guarded(KernelState::new())),
        }
    }

    /// Run `f` with exclusive access to the kernel state.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        sync::with_guarded(&self.state, f)
    }

    // -----------------------------------------------------------------------
    // Thread lifecycle
    // -----------------------------------------------------------------------

    /// Create a thread that will run `entry(kernel, arg)`.
    ///
    /// `arg` is moved into the thread, so the caller can reuse or drop its
    /// own copy immediately. A thread spawned from a running thread with
    /// higher precedence than its creator runs before `spawn` returns.
    ///
    /// # Errors
    /// Returns a `ConfigError` if the thread table is full, the priority is
    /// out of range, or the host thread could not be created.
    pub fn spawn<A, F>(&self, config: ThreadConfig, entry: F, arg: A) -> Result<ThreadId, ConfigError>
    where
        A: Send + 'static,
        F: FnOnce(&Kernel, A) -> Result<(), KernelError> + Send + 'static,
    {
        let caller = host::current();
        let id = self.with(|k| {
            if k.started && caller.is_none() {
                return Err(ConfigError::InvalidParameter(
                    "spawn after start must come from a kernel thread",
                ));
            }
            k.sched.create_thread(config)
        })?;

        let kernel = self.clone();
        let name = config.name;
        let body = move || {
            kernel.wait_for_cpu(id);
            if let Err(e) = entry(&kernel, arg) {
                error!("{}: exited with error: {}", name, e);
            }
            kernel.exit_current(id);
        };
        let panic_kernel = self.clone();
        let on_panic = move |payload| panic_kernel.record_panic(id, payload);

        match host::spawn(&config, id, body, on_panic) {
            Ok(join) => self.with(|k| {
                k.sched.tcb_mut(id).host = Some(join.thread().clone());
                // At most MAX_THREADS threads exist, so this always fits.
                let _ = k.joins.push(join);
            }),
            Err(e) => {
                self.with(|k| k.sched.discard(id));
                return Err(ConfigError::HostSpawn(e.to_string()));
            }
        }

        debug!("kernel: spawned {} ({:?}) at priority {}", name, id, config.priority);
        self.preempt_point(caller);
        Ok(id)
    }

    /// Boot the scheduler and block the calling host thread until the kernel
    /// halts. `limit` is an absolute tick count; `None` runs until every
    /// thread has terminated or the system goes idle.
    ///
    /// If a kernel thread panicked, its panic is resumed here after all
    /// host threads have been joined.
    pub fn run(&self, limit: Option<Ticks>) -> Result<RunSummary, KernelError> {
        if host::current().is_some() {
            return Err(KernelError::AlreadyStarted);
        }
        let count = self.with(|k| {
            if k.started {
                return Err(KernelError::AlreadyStarted);
            }
            k.started = true;
            k.limit = limit;
            k.runner = Some(thread::current());
            Ok(k.sched.threads.len())
        })?;
        info!("kernel: starting {} thread(s), limit {:?}", count, limit);

        self.reschedule(None);
        host::park_until(|| {
            if self.with(|k| k.halted.is_some()) {
                Resume::Run
            } else {
                Resume::Wait
            }
        });
        Ok(self.shutdown())
    }

    fn shutdown(&self) -> RunSummary {
        let (hosts, joins, callbacks, summary) = self.with(|k| {
            k.shutdown = true;
            let hosts: std::vec::Vec<_> = k
                .sched
                .threads
                .iter()
                .filter(|t| t.is_live())
                .filter_map(|t| t.host.clone())
                .collect();
            let joins = core::mem::take(&mut k.joins);
            let callbacks: std::vec::Vec<_> = k.timers.iter_mut().filter_map(|t| t.callback.take()).collect();
            let summary = RunSummary {
                reason: k.halted.unwrap_or(HaltReason::AllTerminated),
                ended_at: k.sched.clock.now(),
                context_switches: k.sched.context_switches,
                threads: k.sched.threads.iter().map(|t| t.snapshot()).collect(),
            };
            (hosts, joins, callbacks, summary)
        });

        for h in &hosts {
            host::resume(h);
        }
        for join in joins {
            let _ = join.join();
        }
        drop(callbacks);

        if let Some(payload) = self.with(|k| k.panic.take()) {
            std::panic::resume_unwind(payload);
        }
        summary
    }

    fn exit_current(&self, me: ThreadId) {
        self.with(|k| {
            k.sched.remove_ready(me);
            let now = k.sched.clock.now();
            let tcb = k.sched.tcb_mut(me);
            if !tcb.held.is_empty() {
                warn!(
                    "{}: terminated while holding {} mutex(es)",
                    tcb.config.name,
                    tcb.held.len()
                );
            }
            tcb.state = ThreadState::Terminated;
            debug!("{}: terminated at {}", tcb.config.name, now);
        });
        self.reschedule(Some(me));
    }

    fn record_panic(&self, id: ThreadId, payload: Box<dyn Any + Send>) {
        let runner = self.with(|k| {
            if let Some(tcb) = k.sched.get_mut(id) {
                tcb.state = ThreadState::Terminated;
            }
            if k.sched.current == Some(id) {
                k.sched.current = None;
            }
            if k.shutdown {
                return None;
            }
            if k.panic.is_none() {
                k.panic = Some(payload);
            }
            k.halt(HaltReason::Panicked)
        });
        if let Some(r) = runner {
            host::resume(&r);
        }
    }

    // -----------------------------------------------------------------------
    // Context switching
    // -----------------------------------------------------------------------

    /// Park the calling host thread until `me` holds the CPU.
    fn wait_for_cpu(&self, me: ThreadId) {
        host::park_until(|| {
            self.with(|k| {
                if k.shutdown {
                    Resume::Exit
                } else if k.halted.is_some() {
                    Resume::Wait
                } else if k.sched.current == Some(me) && k.sched.tcb(me).state == ThreadState::Running {
                    Resume::Run
                } else {
                    Resume::Wait
                }
            })
        });
    }

    /// Give the CPU away. `me` must already have left the Running state (or
    /// been requeued); `None` is the boot path from `run`.
    pub(crate) fn reschedule(&self, me: Option<ThreadId>) {
        loop {
            match self.with(|k| k.dispatch()) {
                Dispatch::Run { next, host } => {
                    if Some(next) != me {
                        if let Some(h) = host {
                            host::resume(&h);
                        }
                    }
                    break;
                }
                Dispatch::Idle => self.process_time_events(),
                Dispatch::Halt(runner) => {
                    if let Some(r) = runner {
                        host::resume(&r);
                    }
                    break;
                }
            }
        }
        if let Some(me) = me {
            if self.with(|k| k.sched.tcb(me).is_live()) {
                self.wait_for_cpu(me);
            }
        }
    }

    /// Block the running thread `me` (already queued on an object) and
    /// return why it was woken.
    pub(crate) fn block_current(&self, me: ThreadId) -> Option<WakeReason> {
        self.reschedule(Some(me));
        self.with(|k| k.sched.tcb_mut(me).wake_reason.take())
    }

    /// Switch away from `me` if a wakeup just made a higher-precedence
    /// thread ready. No-op from timer context or while preemption is
    /// disabled; the decision is then taken at the next opportunity.
    pub(crate) fn preempt_point(&self, me: Option<ThreadId>) {
        let Some(me) = me else {
            return;
        };
        let switch = self.with(|k| {
            k.in_isr == 0 && k.sched.current == Some(me) && k.sched.preempt_current(false)
        });
        if switch {
            self.reschedule(Some(me));
        }
    }

    /// Expire waits and fire due timers at the current clock value.
    fn process_time_events(&self) {
        let fired = self.with(|k| {
            k.expire_waits();
            k.due_timers()
        });
        for id in fired {
            self.fire_timer(id);
        }
    }

    fn tick(&self, me: ThreadId) {
        let halted = self.with(|k| {
            let now = k.sched.tick();
            match k.limit {
                Some(limit) if now >= limit => Some(k.halt(HaltReason::TimeLimit)),
                _ => None,
            }
        });
        if let Some(runner) = halted {
            if let Some(r) = runner {
                host::resume(&r);
            }
            self.wait_for_cpu(me);
            return;
        }

        self.process_time_events();
        if self.with(|k| k.sched.preempt_current(true)) {
            self.reschedule(Some(me));
        }
    }

    // -----------------------------------------------------------------------
    // Caller context
    // -----------------------------------------------------------------------

    /// The calling kernel thread, rejecting timer context.
    pub(crate) fn thread_context(&self) -> Result<ThreadId, KernelError> {
        let me = host::current().ok_or(KernelError::NotInThread)?;
        if self.with(|k| k.in_isr > 0) {
            return Err(KernelError::InIsr);
        }
        Ok(me)
    }

    /// The calling kernel thread, which is about to block.
    pub(crate) fn blocking_context(&self) -> Result<ThreadId, KernelError> {
        let me = host::current().ok_or(KernelError::NotInThread)?;
        self.with(|k| {
            if k.in_isr > 0 {
                Err(KernelError::InIsr)
            } else if !k.sched.preemption_enabled() {
                Err(KernelError::PreemptionDisabled)
            } else {
                Ok(me)
            }
        })
    }

    /// Caller check for an operation that waits up to `timeout`. Polls are
    /// allowed with preemption disabled.
    pub(crate) fn wait_context(&self, timeout: Timeout) -> Result<ThreadId, KernelError> {
        if timeout.is_poll() {
            self.thread_context()
        } else {
            self.blocking_context()
        }
    }

    /// Complete an acquisition started inside the critical section.
    pub(crate) fn finish_wait(&self, me: ThreadId, outcome: Acquire) -> Result<(), KernelError> {
        match outcome {
            Acquire::Now => Ok(()),
            Acquire::Blocked => match self.block_current(me) {
                Some(WakeReason::Acquired) => Ok(()),
                _ => Err(KernelError::Timeout),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Thread API
    // -----------------------------------------------------------------------

    /// Current kernel time.
    pub fn now(&self) -> Ticks {
        self.with(|k| k.sched.clock.now())
    }

    /// Kernel thread backing the calling host thread.
    pub fn current(&self) -> Option<ThreadId> {
        host::current()
    }

    pub fn thread_info(&self, id: ThreadId) -> Option<ThreadSnapshot> {
        self.with(|k| k.sched.get(id).map(|t| t.snapshot()))
    }

    /// Consume `ticks` of CPU. Every tick is a preemption point.
    pub fn work(&self, ticks: Ticks) -> Result<(), KernelError> {
        let me = self.thread_context()?;
        for _ in 0..ticks {
            self.tick(me);
        }
        Ok(())
    }

    /// Move to the back of the ready queue for the caller's priority.
    pub fn yield_now(&self) -> Result<(), KernelError> {
        let me = self.blocking_context()?;
        self.with(|k| {
            k.sched.tcb_mut(me).reset_slice();
            k.sched.make_ready(me);
        });
        self.reschedule(Some(me));
        Ok(())
    }

    /// Sleep for `ticks`. Zero yields.
    pub fn sleep(&self, ticks: Ticks) -> Result<(), KernelError> {
        if ticks == 0 {
            return self.yield_now();
        }
        let deadline = self.now().saturating_add(ticks);
        self.sleep_until(deadline)
    }

    /// Sleep until the clock reaches `deadline`. Returns at once if it
    /// already has.
    pub fn sleep_until(&self, deadline: Ticks) -> Result<(), KernelError> {
        let me = self.blocking_context()?;
        let sleeping = self.with(|k| {
            if deadline <= k.sched.clock.now() {
                return false;
            }
            let tcb = k.sched.tcb_mut(me);
            tcb.state = ThreadState::Sleeping;
            tcb.wake_at = Some(deadline);
            true
        });
        if sleeping {
            self.reschedule(Some(me));
        }
        Ok(())
    }

    /// Run `f` with preemption disabled.
    ///
    /// No other thread runs until `f` returns, even if a higher-precedence
    /// thread becomes ready meanwhile; the switch happens on exit. `f` must
    /// not block.
    pub fn non_preemptible<R>(&self, f: impl FnOnce() -> R) -> Result<R, KernelError> {
        let me = self.thread_context()?;
        self.with(|k| k.sched.disable_preemption());
        let out = f();
        let switch = self.with(|k| {
            k.sched.enable_preemption();
            k.sched.preempt_current(true)
        });
        if switch {
            self.reschedule(Some(me));
        }
        Ok(out)
    }

    /// Stop scheduling `id`. A sleeping or blocked thread finishes its wait
    /// but stays suspended; a thread suspending itself gives up the CPU.
    pub fn suspend(&self, id: ThreadId) -> Result<(), KernelError> {
        let me = host::current();
        let switch = self.with(|k| {
            let in_isr = k.in_isr > 0;
            let tcb = k.sched.get_mut(id).ok_or(KernelError::NoSuchThread(id))?;
            if !tcb.is_live() {
                return Ok(false);
            }
            tcb.suspended = true;
            match tcb.state {
                ThreadState::Ready => {
                    k.sched.remove_ready(id);
                    k.sched.tcb_mut(id).state = ThreadState::Suspended;
                    Ok(false)
                }
                ThreadState::Running if Some(id) == me => {
                    if in_isr || !k.sched.preemption_enabled() {
                        k.sched.tcb_mut(id).suspended = false;
                        return Err(KernelError::PreemptionDisabled);
                    }
                    k.sched.tcb_mut(id).state = ThreadState::Suspended;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })?;
        debug!("kernel: suspended {:?}", id);
        if switch {
            self.reschedule(Some(id));
        }
        Ok(())
    }

    /// Make a suspended thread schedulable again.
    pub fn resume(&self, id: ThreadId) -> Result<(), KernelError> {
        self.with(|k| {
            let tcb = k.sched.get_mut(id).ok_or(KernelError::NoSuchThread(id))?;
            tcb.suspended = false;
            if tcb.state == ThreadState::Suspended {
                k.sched.make_ready(id);
            }
            Ok(())
        })?;
        debug!("kernel: resumed {:?}", id);
        self.preempt_point(host::current());
        Ok(())
    }
}
