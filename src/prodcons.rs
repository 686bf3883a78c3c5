//! # Producer / Consumer
//!
//! Producers write a fixed number of items into a [`BoundedQueue`] and
//! exit; consumers drain it forever. A setup thread spawns every worker and
//! waits on a "started" rendezvous after each spawn. Worker parameters are
//! moved into the threads, so the rendezvous only orders startup.
//!
//! The run ends once the producers are done and every consumer is blocked
//! on the empty queue.

use std::sync::Arc;

use log::{debug, error, info};

use crate::clock::{Ticks, Timeout};
use crate::config::MAX_THREADS;
use crate::error::{ConfigError, KernelError, RunError};
use crate::kernel::{HaltReason, Kernel};
use crate::queue::BoundedQueue;
use crate::semaphore::Semaphore;
use crate::sync::{self, Guarded};
use crate::thread::ThreadConfig;

#[derive(Debug, Clone)]
pub struct ProdConsConfig {
    pub producers: usize,
    /// Items written by each producer.
    pub writes: u32,
    pub consumers: usize,
    /// Shared by the setup thread and every worker.
    pub priority: u8,
    /// Sleep after each write or read.
    pub delay: Ticks,
    pub run_limit: Option<Ticks>,
}

impl Default for ProdConsConfig {
    fn default() -> Self {
        Self {
            producers: 5,
            writes: 3,
            consumers: 2,
            priority: 10,
            delay: 1,
            run_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Item {
    pub producer: usize,
    pub seq: u32,
}

#[derive(Debug, Clone)]
pub struct ProdConsReport {
    pub produced: u64,
    /// Items in the order they were dequeued.
    pub consumed: Vec<Item>,
    /// Items dequeued by each consumer.
    pub per_consumer: Vec<usize>,
    pub high_water: usize,
    pub capacity: usize,
    pub reason: HaltReason,
    pub ended_at: Ticks,
}

#[derive(Default)]
struct Ledger {
    produced: u64,
    consumed: Vec<Item>,
    per_consumer: Vec<usize>,
    spawn_error: Option<ConfigError>,
}

struct Shop<const N: usize> {
    config: ProdConsConfig,
    queue: BoundedQueue<Item, N>,
    started: Semaphore,
    ledger: Guarded<Ledger>,
}

fn producer<const N: usize>(kernel: &Kernel, (id, shop): (usize, Arc<Shop<N>>)) -> Result<(), KernelError> {
    shop.started.give()?;
    for seq in 0..shop.config.writes {
        let item = Item { producer: id, seq };
        shop.queue.send(item)?;
        sync::with_guarded(&shop.ledger, |l| l.produced += 1);
        debug!("producer {}: wrote {}", id, seq);
        kernel.sleep(shop.config.delay)?;
    }
    Ok(())
}

fn consumer<const N: usize>(kernel: &Kernel, (id, shop): (usize, Arc<Shop<N>>)) -> Result<(), KernelError> {
    shop.started.give()?;
    loop {
        let item = shop.queue.recv()?;
        sync::with_guarded(&shop.ledger, |l| {
            l.consumed.push(item);
            l.per_consumer[id] += 1;
        });
        debug!("consumer {}: read {:?}", id, item);
        kernel.sleep(shop.config.delay)?;
    }
}

fn setup<const N: usize>(kernel: &Kernel, shop: Arc<Shop<N>>) -> Result<(), KernelError> {
    let priority = shop.config.priority;
    let workers = (0..shop.config.producers)
        .map(|i| (ThreadConfig::new("producer", priority), true, i))
        .chain((0..shop.config.consumers).map(|i| (ThreadConfig::new("consumer", priority), false, i)));

    for (config, is_producer, i) in workers {
        let spawned = if is_producer {
            kernel.spawn(config, producer::<N>, (i, shop.clone()))
        } else {
            kernel.spawn(config, consumer::<N>, (i, shop.clone()))
        };
        if let Err(e) = spawned {
            error!("prodcons: failed to start {} {}: {}", config.name, i, e);
            sync::with_guarded(&shop.ledger, |l| l.spawn_error = Some(e));
            return Ok(());
        }
        shop.started.take(Timeout::Forever)?;
    }
    info!("prodcons: all tasks created");
    Ok(())
}

/// Run the producer/consumer scenario over a queue of capacity `N`.
pub fn run<const N: usize>(config: ProdConsConfig) -> Result<ProdConsReport, RunError> {
    if config.producers == 0 || config.consumers == 0 {
        return Err(ConfigError::InvalidParameter("need at least one producer and one consumer").into());
    }
    if config.producers + config.consumers + 1 > MAX_THREADS {
        return Err(ConfigError::ThreadTableFull {
            capacity: MAX_THREADS,
        }
        .into());
    }

    let kernel = Kernel::new();
    let shop = Arc::new(Shop::<N> {
        queue: BoundedQueue::new(&kernel)?,
        started: Semaphore::binary(&kernel)?,
        ledger: sync::guarded(Ledger {
            per_consumer: vec![0; config.consumers],
            ..Ledger::default()
        }),
        config,
    });

    kernel.spawn(
        ThreadConfig::new("setup", shop.config.priority),
        setup::<N>,
        shop.clone(),
    )?;
    let summary = kernel.run(shop.config.run_limit)?;

    let ledger = sync::with_guarded(&shop.ledger, std::mem::take);
    if let Some(e) = ledger.spawn_error {
        return Err(e.into());
    }
    info!(
        "prodcons: {} produced, {} consumed, high water {}/{}",
        ledger.produced,
        ledger.consumed.len(),
        shop.queue.high_water_mark(),
        N
    );
    Ok(ProdConsReport {
        produced: ledger.produced,
        consumed: ledger.consumed,
        per_consumer: ledger.per_consumer,
        high_water: shop.queue.high_water_mark(),
        capacity: N,
        reason: summary.reason,
        ended_at: summary.ended_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot_queue_alternates() {
        let report = run::<1>(ProdConsConfig {
            producers: 2,
            writes: 4,
            consumers: 1,
            ..ProdConsConfig::default()
        })
        .unwrap();
        assert_eq!(report.produced, 8);
        assert_eq!(report.consumed.len(), 8);
        assert_eq!(report.high_water, 1);
        assert_eq!(report.reason, HaltReason::Idle { blocked: 1 });
    }

    #[test]
    fn test_each_producer_sequence_is_in_order() {
        let report = run::<2>(ProdConsConfig::default()).unwrap();
        for p in 0..5 {
            let seqs: Vec<u32> = report
                .consumed
                .iter()
                .filter(|i| i.producer == p)
                .map(|i| i.seq)
                .collect();
            assert_eq!(seqs, [0, 1, 2]);
        }
    }

    #[test]
    fn test_empty_roles_rejected() {
        let config = ProdConsConfig {
            consumers: 0,
            ..ProdConsConfig::default()
        };
        assert!(matches!(run::<4>(config), Err(RunError::Config(_))));
    }
}
