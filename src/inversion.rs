//! # Priority Inversion Harness
//!
//! Three periodic threads: L and H share one critical section, M burns CPU
//! and touches nothing shared.
//!
//! ```text
//!   prio   thread   body (every period)
//!   ────   ──────   ────────────────────────────────────────
//!    10      H      enter ─► work(critical_section) ─► exit
//!    20      M      work(medium_work)
//!    30      L      enter ─► work(critical_section) ─► exit
//! ```
//!
//! With a plain blocking lock, M preempts L while L holds the lock and H
//! waits for all of M's burst. With an inheriting mutex L runs at H's
//! priority until it unlocks, so H waits at most one critical section. A
//! non-preemptible section also bounds H's wait but stalls every thread for
//! the section's duration, which shows up in H's release latency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::clock::{Ticks, Timeout};
use crate::error::{ConfigError, KernelError, RunError};
use crate::kernel::{HaltReason, Kernel};
use crate::mutex::{Mutex, MutexMode};
use crate::semaphore::Semaphore;
use crate::thread::ThreadConfig;

/// How the shared critical section is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    /// Binary semaphore. No inheritance.
    Blocking,
    /// Priority-inheriting mutex.
    Inheriting,
    /// Preemption disabled for the section's duration.
    NonPreemptible,
}

#[derive(Debug, Clone)]
pub struct InversionConfig {
    /// CPU ticks spent inside the critical section.
    pub critical_section: Ticks,
    /// CPU ticks per burst of M.
    pub medium_work: Ticks,
    /// Sleep after each iteration.
    pub period: Ticks,
    /// H and M are released this long after L.
    pub start_offset: Ticks,
    pub low_priority: u8,
    pub medium_priority: u8,
    pub high_priority: u8,
    /// H waits longer than this are logged as warnings.
    pub wait_threshold: Ticks,
}

impl Default for InversionConfig {
    fn default() -> Self {
        Self {
            critical_section: 500,
            medium_work: 10_000,
            period: 500,
            start_offset: 10,
            low_priority: 30,
            medium_priority: 20,
            high_priority: 10,
            wait_threshold: 550,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub strategy: LockStrategy,
    /// Longest time H spent between asking for the lock and getting it.
    pub max_wait_h: Ticks,
    pub max_wait_l: Ticks,
    /// Longest time from H's release (end of its sleep) to entering the
    /// critical section.
    pub max_latency_h: Ticks,
    pub h_entries: u64,
    pub l_entries: u64,
    /// Completed bursts of M.
    pub m_bursts: u64,
    /// Number of H waits above the threshold.
    pub threshold_exceeded: u64,
    pub reason: HaltReason,
    pub ended_at: Ticks,
}

enum Guard {
    Blocking(Semaphore),
    Inheriting(Mutex),
    NonPreemptible,
}

impl Guard {
    fn new(kernel: &Kernel, strategy: LockStrategy) -> Result<Self, ConfigError> {
        Ok(match strategy {
            LockStrategy::Blocking => Guard::Blocking(Semaphore::new(kernel, 1, 1)?),
            LockStrategy::Inheriting => Guard::Inheriting(Mutex::new(kernel, MutexMode::PriorityInheriting)?),
            LockStrategy::NonPreemptible => Guard::NonPreemptible,
        })
    }

    /// Run `body` inside the critical section.
    fn critical<R>(&self, kernel: &Kernel, body: impl FnOnce() -> Result<R, KernelError>) -> Result<R, KernelError> {
        match self {
            Guard::Blocking(sem) => {
                sem.take(Timeout::Forever)?;
                let out = body();
                sem.give()?;
                out
            }
            Guard::Inheriting(m) => {
                m.lock()?;
                let out = body();
                m.unlock()?;
                out
            }
            Guard::NonPreemptible => kernel.non_preemptible(body)?,
        }
    }
}

#[derive(Default)]
struct Stats {
    max_wait: AtomicU64,
    max_latency: AtomicU64,
    entries: AtomicU64,
}

struct Harness {
    config: InversionConfig,
    guard: Guard,
    high: Stats,
    low: Stats,
    m_bursts: AtomicU64,
    exceeded: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Low,
    High,
}

fn contender(kernel: &Kernel, (role, h): (Role, Arc<Harness>)) -> Result<(), KernelError> {
    let cfg = &h.config;
    let stats = match role {
        Role::High => &h.high,
        Role::Low => &h.low,
    };
    let mut release = match role {
        Role::High => cfg.start_offset,
        Role::Low => 0,
    };
    kernel.sleep_until(release)?;

    loop {
        let asked = kernel.now();
        h.guard.critical(kernel, || {
            let entered = kernel.now();
            let wait = entered - asked;
            stats.max_wait.fetch_max(wait, Ordering::Relaxed);
            stats.max_latency.fetch_max(entered - release, Ordering::Relaxed);
            stats.entries.fetch_add(1, Ordering::Relaxed);
            if role == Role::High && wait > cfg.wait_threshold {
                h.exceeded.fetch_add(1, Ordering::Relaxed);
                warn!("inversion: H waited {} ticks for the lock (threshold {})", wait, cfg.wait_threshold);
            } else {
                debug!("inversion: {:?} waited {} ticks", role, wait);
            }
            kernel.work(cfg.critical_section)
        })?;
        release = kernel.now() + cfg.period;
        kernel.sleep_until(release)?;
    }
}

fn medium(kernel: &Kernel, h: Arc<Harness>) -> Result<(), KernelError> {
    kernel.sleep_until(h.config.start_offset)?;
    loop {
        kernel.work(h.config.medium_work)?;
        h.m_bursts.fetch_add(1, Ordering::Relaxed);
        kernel.sleep(h.config.period)?;
    }
}

/// Run the harness for `duration` ticks with default timing.
pub fn run(strategy: LockStrategy, duration: Ticks) -> Result<Report, RunError> {
    run_with(strategy, duration, InversionConfig::default())
}

pub fn run_with(strategy: LockStrategy, duration: Ticks, config: InversionConfig) -> Result<Report, RunError> {
    if !(config.high_priority < config.medium_priority && config.medium_priority < config.low_priority) {
        return Err(ConfigError::InvalidParameter("priorities must rank H above M above L").into());
    }
    if config.critical_section == 0 || duration == 0 {
        return Err(ConfigError::InvalidParameter("critical section and duration must be non-zero").into());
    }

    let kernel = Kernel::new();
    let harness = Arc::new(Harness {
        guard: Guard::new(&kernel, strategy)?,
        high: Stats::default(),
        low: Stats::default(),
        m_bursts: AtomicU64::new(0),
        exceeded: AtomicU64::new(0),
        config,
    });
    let cfg = &harness.config;

    kernel.spawn(
        ThreadConfig::new("task_l", cfg.low_priority),
        contender,
        (Role::Low, harness.clone()),
    )?;
    kernel.spawn(
        ThreadConfig::new("task_h", cfg.high_priority),
        contender,
        (Role::High, harness.clone()),
    )?;
    kernel.spawn(ThreadConfig::new("task_m", cfg.medium_priority), medium, harness.clone())?;

    info!("inversion: {:?} for {} ticks", strategy, duration);
    let summary = kernel.run(Some(duration))?;

    let report = Report {
        strategy,
        max_wait_h: harness.high.max_wait.load(Ordering::Relaxed),
        max_wait_l: harness.low.max_wait.load(Ordering::Relaxed),
        max_latency_h: harness.high.max_latency.load(Ordering::Relaxed),
        h_entries: harness.high.entries.load(Ordering::Relaxed),
        l_entries: harness.low.entries.load(Ordering::Relaxed),
        m_bursts: harness.m_bursts.load(Ordering::Relaxed),
        threshold_exceeded: harness.exceeded.load(Ordering::Relaxed),
        reason: summary.reason,
        ended_at: summary.ended_at,
    };
    info!(
        "inversion: {:?}: H max wait {}, H max latency {}, L max wait {}",
        strategy, report.max_wait_h, report.max_latency_h, report.max_wait_l
    );
    Ok(report)
}
