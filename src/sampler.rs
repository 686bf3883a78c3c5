//! # Periodic Sampler
//!
//! A timer callback reads an [`Adc`] every period and fills fixed-size
//! blocks of a ring. When a block is complete it gives a counting
//! semaphore; a processing thread then averages the block and publishes the
//! result under a mutex.
//!
//! ```text
//!   timer ──sample──► ring[head][n] ── block full ──► give(blocks_ready)
//!                                                          │
//!   processing thread ◄── take(blocks_ready) ◄─────────────┘
//!     average ring[tail] ─► lock(avg) ─► publish ─► unlock(avg)
//! ```
//!
//! The ring keeps one block free to tell "full" from "empty". While it is
//! full the callback drops samples and counts them.

use std::sync::Arc;

use log::{debug, warn};

use crate::clock::{Ticks, Timeout};
use crate::error::{ConfigError, KernelError};
use crate::kernel::Kernel;
use crate::mutex::{Mutex, MutexMode};
use crate::semaphore::Semaphore;
use crate::sync::{self, Guarded};
use crate::thread::{ThreadConfig, ThreadId};
use crate::timer::{IsrContext, Timer};

/// Analog input read from timer context.
pub trait Adc: Send + 'static {
    /// One raw conversion.
    fn sample(&mut self) -> u16;
}

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub period: Ticks,
    /// Samples per block.
    pub block_len: usize,
    /// Blocks in the ring, at least 2.
    pub blocks: usize,
    /// Priority of the processing thread.
    pub priority: u8,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            period: 100,
            block_len: 10,
            blocks: 4,
            priority: 10,
        }
    }
}

struct Ring {
    data: Vec<Vec<u16>>,
    head: usize,
    tail: usize,
    filled: usize,
    dropped: u64,
}

impl Ring {
    fn is_full(&self) -> bool {
        (self.head + 1) % self.data.len() == self.tail
    }

    /// Store one sample. Returns true when it completed a block.
    fn push(&mut self, value: u16) -> bool {
        let block_len = self.data[self.head].len();
        self.data[self.head][self.filled] = value;
        self.filled += 1;
        if self.filled < block_len {
            return false;
        }
        self.head = (self.head + 1) % self.data.len();
        self.filled = 0;
        true
    }

    /// Average of the oldest complete block, which is then released.
    fn pop_average(&mut self) -> Option<f32> {
        if self.head == self.tail {
            return None;
        }
        let block = &self.data[self.tail];
        let sum: u32 = block.iter().map(|&v| u32::from(v)).sum();
        let avg = sum as f32 / block.len() as f32;
        self.tail = (self.tail + 1) % self.data.len();
        Some(avg)
    }
}

#[derive(Default)]
struct Published {
    latest: Option<f32>,
    history: Vec<f32>,
}

struct Shared {
    ring: Guarded<Ring>,
    blocks_ready: Semaphore,
    avg_lock: Mutex,
    published: Guarded<Published>,
}

/// Handle to a running sampler.
#[derive(Clone)]
pub struct Sampler {
    kernel: Kernel,
    shared: Arc<Shared>,
    timer: Timer,
    thread: ThreadId,
}

impl Sampler {
    /// Create the ring, spawn the processing thread and start sampling.
    pub fn start<A: Adc>(kernel: &Kernel, mut adc: A, config: SamplerConfig) -> Result<Self, ConfigError> {
        if config.blocks < 2 {
            return Err(ConfigError::InvalidParameter("sampler ring needs at least two blocks"));
        }
        if config.block_len == 0 || config.period == 0 {
            return Err(ConfigError::InvalidParameter("sampler block length and period must be non-zero"));
        }
        let blocks = u32::try_from(config.blocks).map_err(|_| ConfigError::InvalidParameter("too many sampler blocks"))?;

        let shared = Arc::new(Shared {
            ring: sync::guarded(Ring {
                data: vec![vec![0; config.block_len]; config.blocks],
                head: 0,
                tail: 0,
                filled: 0,
                dropped: 0,
            }),
            blocks_ready: Semaphore::new(kernel, 0, blocks)?,
            avg_lock: Mutex::new(kernel, MutexMode::PriorityInheriting)?,
            published: sync::guarded(Published::default()),
        });

        // Timer first: a failure here must not leave a parked thread behind.
        let isr_shared = shared.clone();
        let timer = Timer::new(kernel, move |isr: &IsrContext<'_>| {
            on_sample(isr, &isr_shared, &mut adc);
        })?;
        timer.start(config.period, Some(config.period))?;

        let thread = match kernel.spawn(
            ThreadConfig::new("adc_processing", config.priority),
            process,
            shared.clone(),
        ) {
            Ok(thread) => thread,
            Err(e) => {
                timer.stop();
                return Err(e);
            }
        };

        Ok(Self {
            kernel: kernel.clone(),
            shared,
            timer,
            thread,
        })
    }

    /// Latest published average, read under the average mutex. Must be
    /// called from a kernel thread.
    pub fn average(&self) -> Result<Option<f32>, KernelError> {
        self.shared.avg_lock.lock()?;
        let latest = sync::with_guarded(&self.shared.published, |p| p.latest);
        self.shared.avg_lock.unlock()?;
        Ok(latest)
    }

    /// Every average published so far, oldest first.
    ///
    /// From a kernel thread this reads under the average mutex. Outside the
    /// kernel, typically after `run` has returned, it is a plain snapshot.
    pub fn history(&self) -> Result<Vec<f32>, KernelError> {
        let read = || sync::with_guarded(&self.shared.published, |p| p.history.clone());
        if self.kernel.current().is_none() {
            return Ok(read());
        }
        self.shared.avg_lock.lock()?;
        let history = read();
        self.shared.avg_lock.unlock()?;
        Ok(history)
    }

    /// Samples dropped because the ring was full.
    pub fn dropped(&self) -> u64 {
        sync::with_guarded(&self.shared.ring, |r| r.dropped)
    }

    pub fn stop(&self) {
        self.timer.stop();
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

fn on_sample<A: Adc>(isr: &IsrContext<'_>, shared: &Shared, adc: &mut A) {
    let block_done = sync::with_guarded(&shared.ring, |ring| {
        if ring.is_full() {
            ring.dropped += 1;
            return None;
        }
        Some(ring.push(adc.sample()))
    });
    match block_done {
        None => warn!("sampler: ring full at {}, dropping sample", isr.now()),
        Some(true) => {
            if let Err(e) = isr.give(&shared.blocks_ready) {
                warn!("sampler: block signal lost: {}", e);
            }
        }
        Some(false) => {}
    }
}

fn process(_kernel: &Kernel, shared: Arc<Shared>) -> Result<(), KernelError> {
    loop {
        shared.blocks_ready.take(Timeout::Forever)?;
        let Some(avg) = sync::with_guarded(&shared.ring, Ring::pop_average) else {
            continue;
        };
        shared.avg_lock.lock()?;
        sync::with_guarded(&shared.published, |p| {
            p.latest = Some(avg);
            p.history.push(avg);
        });
        shared.avg_lock.unlock()?;
        debug!("sampler: block average {}", avg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::HaltReason;
    use std::sync::Mutex as StdMutex;

    struct Ramp(u16);

    impl Adc for Ramp {
        fn sample(&mut self) -> u16 {
            let v = self.0;
            self.0 += 1;
            v
        }
    }

    fn config() -> SamplerConfig {
        SamplerConfig {
            period: 10,
            block_len: 4,
            blocks: 3,
            priority: 5,
        }
    }

    #[test]
    fn test_ring_full_and_empty() {
        let mut ring = Ring {
            data: vec![vec![0; 2]; 2],
            head: 0,
            tail: 0,
            filled: 0,
            dropped: 0,
        };
        assert_eq!(ring.pop_average(), None);
        assert!(!ring.push(4));
        assert!(ring.push(6));
        assert!(ring.is_full());
        assert_eq!(ring.pop_average(), Some(5.0));
        assert!(!ring.is_full());
    }

    #[test]
    fn test_block_averages_are_published() {
        let kernel = Kernel::new();
        let sampler = Sampler::start(&kernel, Ramp(0), config()).unwrap();

        let summary = kernel.run(Some(125)).unwrap();
        assert_eq!(summary.reason, HaltReason::TimeLimit);
        assert_eq!(sampler.history().unwrap(), [1.5, 5.5, 9.5]);
        assert_eq!(sampler.dropped(), 0);
    }

    #[test]
    fn test_starved_processing_drops_samples() {
        let kernel = Kernel::new();
        let sampler = Sampler::start(
            &kernel,
            Ramp(0),
            SamplerConfig {
                block_len: 2,
                blocks: 2,
                priority: 20,
                ..config()
            },
        )
        .unwrap();
        kernel
            .spawn(ThreadConfig::new("hog", 10), |k, _| k.work(100), ())
            .unwrap();

        kernel.run(Some(125)).unwrap();
        assert_eq!(sampler.dropped(), 8);
        assert_eq!(sampler.history().unwrap(), [0.5, 2.5]);
    }

    #[test]
    fn test_average_read_from_thread() {
        let kernel = Kernel::new();
        let sampler = Sampler::start(&kernel, Ramp(0), config()).unwrap();
        let seen = Arc::new(StdMutex::new(None));

        kernel
            .spawn(
                ThreadConfig::new("reader", 8),
                |k, (sampler, seen): (Sampler, Arc<StdMutex<Option<_>>>)| {
                    k.sleep(45)?;
                    *seen.lock().unwrap() = Some(sampler.average()?);
                    Ok(())
                },
                (sampler.clone(), seen.clone()),
            )
            .unwrap();

        kernel.run(Some(50)).unwrap();
        assert_eq!(seen.lock().unwrap().take(), Some(Some(1.5)));
    }

    #[test]
    fn test_history_from_thread_reads_under_lock() {
        let kernel = Kernel::new();
        let sampler = Sampler::start(&kernel, Ramp(0), config()).unwrap();
        let seen = Arc::new(StdMutex::new(std::vec::Vec::new()));

        kernel
            .spawn(
                ThreadConfig::new("reader", 8),
                |k, (sampler, seen): (Sampler, Arc<StdMutex<std::vec::Vec<f32>>>)| {
                    k.sleep(85)?;
                    *seen.lock().unwrap() = sampler.history()?;
                    Ok(())
                },
                (sampler.clone(), seen.clone()),
            )
            .unwrap();

        kernel.run(Some(90)).unwrap();
        assert_eq!(*seen.lock().unwrap(), [1.5, 5.5]);
    }

    #[test]
    fn test_history_from_timer_context_is_rejected() {
        let kernel = Kernel::new();
        let sampler = Sampler::start(&kernel, Ramp(0), config()).unwrap();
        let result = Arc::new(StdMutex::new(None));

        let (cb_sampler, cb_result) = (sampler.clone(), result.clone());
        let timer = Timer::new(&kernel, move |_| {
            *cb_result.lock().unwrap() = Some(cb_sampler.history());
        })
        .unwrap();
        timer.start(3, None).unwrap();
        kernel
            .spawn(ThreadConfig::new("busy", 20), |k, _| k.work(5), ())
            .unwrap();

        kernel.run(Some(8)).unwrap();
        assert_eq!(result.lock().unwrap().take(), Some(Err(KernelError::InIsr)));
    }

    #[test]
    fn test_failed_start_leaves_no_thread() {
        let kernel = Kernel::new();
        for _ in 0..crate::config::MAX_TIMERS {
            Timer::new(&kernel, |_| {}).unwrap();
        }
        assert!(Sampler::start(&kernel, Ramp(0), config()).is_err());
        let summary = kernel.run(None).unwrap();
        assert!(summary.threads.is_empty());
    }
}
