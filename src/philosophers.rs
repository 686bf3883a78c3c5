//! # Dining Philosophers
//!
//! N philosophers sit around a table with one chopstick between each pair.
//! Philosopher `i` needs chopsticks `i` and `(i + 1) % N`. The acquisition
//! policy decides whether that can deadlock:
//!
//! | Policy                    | Acquisition                              | Deadlock |
//! |---------------------------|------------------------------------------|----------|
//! | `Hierarchy`               | lower index first                        | never    |
//! | `Arbitrator(WholeMeal)`   | global lock held for the whole meal      | never    |
//! | `Arbitrator(AcquisitionOnly)` | global lock held while picking up    | never    |
//! | `Unordered`               | own index first, then the next one       | possible |
//!
//! A coordinator thread spawns the philosophers one by one, waiting on a
//! "started" rendezvous after each spawn, then collects one "done" signal
//! per philosopher. Each seat number is moved into its thread, so nothing is
//! shared between the spawn loop and the philosophers.

use std::sync::Arc;

use log::{debug, error, info};

use crate::clock::{Ticks, Timeout};
use crate::config::{MAX_MUTEXES, MAX_THREADS};
use crate::error::{ConfigError, KernelError, RunError};
use crate::kernel::{HaltReason, Kernel};
use crate::mutex::{Mutex, MutexMode};
use crate::semaphore::Semaphore;
use crate::sync::{self, Guarded};
use crate::thread::ThreadConfig;

/// How long the arbitrator lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationScope {
    /// Pick up, eat and put down under the lock. Only one philosopher eats
    /// at a time.
    WholeMeal,
    /// Hold the lock only while picking up both chopsticks.
    AcquisitionOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Hierarchy,
    Arbitrator(ArbitrationScope),
    /// Left then right with no coordination. Deadlocks once every
    /// philosopher holds one chopstick.
    Unordered,
}

#[derive(Debug, Clone)]
pub struct DiningConfig {
    pub seats: usize,
    pub policy: Policy,
    /// Priority shared by every philosopher.
    pub priority: u8,
    pub coordinator_priority: u8,
    /// Pause between the first and the second chopstick.
    pub pickup_delay: Ticks,
    pub eat_ticks: Ticks,
    /// Spawn order as a permutation of `0..seats`; `None` is ascending.
    pub start_order: Option<Vec<usize>>,
    pub run_limit: Option<Ticks>,
}

impl Default for DiningConfig {
    fn default() -> Self {
        Self {
            seats: 5,
            policy: Policy::Hierarchy,
            priority: 10,
            coordinator_priority: 5,
            pickup_delay: 1,
            eat_ticks: 100,
            start_order: None,
            run_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceAction {
    Took,
    Returned,
}

/// One chopstick transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEvent {
    pub at: Ticks,
    pub seat: usize,
    pub chopstick: usize,
    pub action: ResourceAction,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    /// Every philosopher signalled completion.
    pub completed: bool,
    /// Meals eaten, per seat.
    pub meals: Vec<u32>,
    pub resource_trace: Vec<ResourceEvent>,
    pub acquisitions: usize,
    pub releases: usize,
    /// Most philosophers eating at the same time.
    pub max_concurrent_meals: usize,
    pub reason: HaltReason,
    pub ended_at: Ticks,
}

#[derive(Default)]
struct Table {
    trace: Vec<ResourceEvent>,
    meals: Vec<u32>,
    eating: usize,
    max_eating: usize,
    finished: usize,
    spawn_error: Option<ConfigError>,
}

struct Dining {
    policy: Policy,
    priority: u8,
    pickup_delay: Ticks,
    eat_ticks: Ticks,
    order: Vec<usize>,
    chopsticks: Vec<Mutex>,
    arbitrator: Option<Mutex>,
    started: Semaphore,
    done: Semaphore,
    table: Guarded<Table>,
}

impl Dining {
    fn record(&self, kernel: &Kernel, seat: usize, chopstick: usize, action: ResourceAction) {
        let at = kernel.now();
        sync::with_guarded(&self.table, |t| {
            t.trace.push(ResourceEvent {
                at,
                seat,
                chopstick,
                action,
            })
        });
    }

    fn take(&self, kernel: &Kernel, seat: usize, chopstick: usize) -> Result<(), KernelError> {
        self.chopsticks[chopstick].lock()?;
        debug!("philosopher {}: took chopstick {}", seat, chopstick);
        self.record(kernel, seat, chopstick, ResourceAction::Took);
        Ok(())
    }

    fn put(&self, kernel: &Kernel, seat: usize, chopstick: usize) -> Result<(), KernelError> {
        self.chopsticks[chopstick].unlock()?;
        debug!("philosopher {}: returned chopstick {}", seat, chopstick);
        self.record(kernel, seat, chopstick, ResourceAction::Returned);
        Ok(())
    }

    /// Chopsticks in the order the policy takes them.
    fn pair(&self, seat: usize) -> (usize, usize) {
        let next = (seat + 1) % self.chopsticks.len();
        match self.policy {
            Policy::Hierarchy => (seat.min(next), seat.max(next)),
            Policy::Arbitrator(_) | Policy::Unordered => (seat, next),
        }
    }

    fn pick_up(&self, kernel: &Kernel, seat: usize) -> Result<(), KernelError> {
        let (first, second) = self.pair(seat);
        self.take(kernel, seat, first)?;
        if self.pickup_delay > 0 {
            kernel.sleep(self.pickup_delay)?;
        }
        self.take(kernel, seat, second)
    }

    fn eat(&self, kernel: &Kernel, seat: usize) -> Result<(), KernelError> {
        sync::with_guarded(&self.table, |t| {
            t.meals[seat] += 1;
            t.eating += 1;
            t.max_eating = t.max_eating.max(t.eating);
        });
        debug!("philosopher {}: eating", seat);
        kernel.sleep(self.eat_ticks)?;
        sync::with_guarded(&self.table, |t| t.eating -= 1);
        Ok(())
    }

    /// Release in reverse acquisition order.
    fn put_down(&self, kernel: &Kernel, seat: usize) -> Result<(), KernelError> {
        let (first, second) = self.pair(seat);
        self.put(kernel, seat, second)?;
        self.put(kernel, seat, first)
    }
}

fn philosopher(kernel: &Kernel, (seat, ctx): (usize, Arc<Dining>)) -> Result<(), KernelError> {
    ctx.started.give()?;

    match (ctx.policy, &ctx.arbitrator) {
        (Policy::Arbitrator(scope), Some(arbitrator)) => {
            arbitrator.lock()?;
            ctx.pick_up(kernel, seat)?;
            if scope == ArbitrationScope::AcquisitionOnly {
                arbitrator.unlock()?;
                ctx.eat(kernel, seat)?;
                ctx.put_down(kernel, seat)?;
            } else {
                ctx.eat(kernel, seat)?;
                ctx.put_down(kernel, seat)?;
                arbitrator.unlock()?;
            }
        }
        _ => {
            ctx.pick_up(kernel, seat)?;
            ctx.eat(kernel, seat)?;
            ctx.put_down(kernel, seat)?;
        }
    }

    ctx.done.give()
}

fn coordinator(kernel: &Kernel, ctx: Arc<Dining>) -> Result<(), KernelError> {
    for &seat in ctx.order.iter() {
        let config = ThreadConfig::new("philosopher", ctx.priority);
        if let Err(e) = kernel.spawn(config, philosopher, (seat, ctx.clone())) {
            error!("dining: failed to seat philosopher {}: {}", seat, e);
            sync::with_guarded(&ctx.table, |t| t.spawn_error = Some(e));
            return Ok(());
        }
        ctx.started.take(Timeout::Forever)?;
    }

    for _ in 0..ctx.order.len() {
        ctx.done.take(Timeout::Forever)?;
        sync::with_guarded(&ctx.table, |t| t.finished += 1);
    }
    info!("dining: all {} philosophers finished at {}", ctx.order.len(), kernel.now());
    Ok(())
}

fn validate(config: &DiningConfig) -> Result<Vec<usize>, ConfigError> {
    let n = config.seats;
    if n < 2 {
        return Err(ConfigError::InvalidParameter("at least two seats are needed"));
    }
    // One thread per seat plus the coordinator.
    if n + 1 > MAX_THREADS {
        return Err(ConfigError::ThreadTableFull {
            capacity: MAX_THREADS,
        });
    }
    if n + 1 > MAX_MUTEXES {
        return Err(ConfigError::ObjectTableFull {
            kind: "mutex",
            capacity: MAX_MUTEXES,
        });
    }
    let order = config.start_order.clone().unwrap_or_else(|| (0..n).collect());
    let mut seen = vec![false; n];
    for &seat in &order {
        if seat >= n || std::mem::replace(&mut seen[seat], true) {
            return Err(ConfigError::InvalidParameter("start order must be a permutation of the seats"));
        }
    }
    if order.len() != n {
        return Err(ConfigError::InvalidParameter("start order must be a permutation of the seats"));
    }
    Ok(order)
}

/// Seat `seats` philosophers under `policy` with default timing.
pub fn run(policy: Policy, seats: usize) -> Result<Outcome, RunError> {
    run_with(DiningConfig {
        seats,
        policy,
        ..DiningConfig::default()
    })
}

pub fn run_with(config: DiningConfig) -> Result<Outcome, RunError> {
    let order = validate(&config)?;
    let n = config.seats;
    let kernel = Kernel::new();

    let chopsticks = (0..n)
        .map(|_| Mutex::new(&kernel, MutexMode::Plain))
        .collect::<Result<Vec<_>, _>>()?;
    let arbitrator = match config.policy {
        Policy::Arbitrator(_) => Some(Mutex::new(&kernel, MutexMode::Plain)?),
        Policy::Hierarchy | Policy::Unordered => None,
    };
    let max = u32::try_from(n).map_err(|_| ConfigError::InvalidParameter("too many seats"))?;
    let ctx = Arc::new(Dining {
        policy: config.policy,
        priority: config.priority,
        pickup_delay: config.pickup_delay,
        eat_ticks: config.eat_ticks,
        order,
        chopsticks,
        arbitrator,
        started: Semaphore::binary(&kernel)?,
        done: Semaphore::new(&kernel, 0, max)?,
        table: sync::guarded(Table {
            meals: vec![0; n],
            ..Table::default()
        }),
    });

    info!("dining: {} seats, {:?}", n, config.policy);
    kernel.spawn(
        ThreadConfig::new("coordinator", config.coordinator_priority),
        coordinator,
        ctx.clone(),
    )?;
    let summary = kernel.run(config.run_limit)?;

    let table = sync::with_guarded(&ctx.table, std::mem::take);
    if let Some(e) = table.spawn_error {
        return Err(e.into());
    }
    let count = |action| table.trace.iter().filter(|e| e.action == action).count();
    let outcome = Outcome {
        completed: table.finished == n,
        acquisitions: count(ResourceAction::Took),
        releases: count(ResourceAction::Returned),
        meals: table.meals,
        resource_trace: table.trace,
        max_concurrent_meals: table.max_eating,
        reason: summary.reason,
        ended_at: summary.ended_at,
    };
    if !outcome.completed {
        info!("dining: stopped at {} without finishing ({:?})", outcome.ended_at, outcome.reason);
    }
    Ok(outcome)
}
