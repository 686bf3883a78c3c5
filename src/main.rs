//! # rtsync Demo
//!
//! Runs every scenario once and logs what happened:
//!
//! | Scenario | What it shows |
//! |----------|---------------|
//! | Dining philosophers | hierarchy and arbitrator complete; unordered pickup deadlocks |
//! | Producer / consumer | a bounded queue neither loses nor duplicates items |
//! | Priority inversion | inheritance bounds H's wait; a plain lock does not |
//! | ADC sampler | timer-driven blocks averaged by a thread |
//!
//! Set `RUST_LOG=debug` to follow individual threads.

use log::{error, info};

use rtsync::inversion::{self, LockStrategy};
use rtsync::philosophers::{self, ArbitrationScope, Policy};
use rtsync::prodcons::{self, ProdConsConfig};
use rtsync::sampler::{Adc, Sampler, SamplerConfig};
use rtsync::{Kernel, RunError, ThreadConfig};

/// Triangle wave standing in for a real converter.
struct Triangle {
    value: u16,
    rising: bool,
}

impl Adc for Triangle {
    fn sample(&mut self) -> u16 {
        let v = self.value;
        match (self.rising, self.value) {
            (true, 1023) => self.rising = false,
            (false, 0) => self.rising = true,
            _ => {}
        }
        self.value = if self.rising { self.value + 31 } else { self.value - 31 };
        v
    }
}

fn dining() -> Result<(), RunError> {
    for policy in [
        Policy::Hierarchy,
        Policy::Arbitrator(ArbitrationScope::WholeMeal),
        Policy::Arbitrator(ArbitrationScope::AcquisitionOnly),
        Policy::Unordered,
    ] {
        let outcome = philosophers::run(policy, 5)?;
        info!(
            "dining {:?}: completed={} meals={:?} took={} returned={} ({:?} at {})",
            policy,
            outcome.completed,
            outcome.meals,
            outcome.acquisitions,
            outcome.releases,
            outcome.reason,
            outcome.ended_at
        );
    }
    Ok(())
}

fn producer_consumer() -> Result<(), RunError> {
    let report = prodcons::run::<5>(ProdConsConfig::default())?;
    info!(
        "prodcons: produced {} consumed {} per consumer {:?} high water {}/{}",
        report.produced,
        report.consumed.len(),
        report.per_consumer,
        report.high_water,
        report.capacity
    );
    Ok(())
}

fn priority_inversion() -> Result<(), RunError> {
    for strategy in [
        LockStrategy::Blocking,
        LockStrategy::Inheriting,
        LockStrategy::NonPreemptible,
    ] {
        let report = inversion::run(strategy, 30_000)?;
        info!(
            "inversion {:?}: H wait {} latency {} entries {}, L entries {}, M bursts {}, over threshold {}",
            strategy,
            report.max_wait_h,
            report.max_latency_h,
            report.h_entries,
            report.l_entries,
            report.m_bursts,
            report.threshold_exceeded
        );
    }
    Ok(())
}

fn adc_sampler() -> Result<(), RunError> {
    let kernel = Kernel::new();
    let adc = Triangle {
        value: 0,
        rising: true,
    };
    let sampler = Sampler::start(&kernel, adc, SamplerConfig::default())?;

    kernel.spawn(
        ThreadConfig::new("display", 20),
        |k, sampler: Sampler| loop {
            k.sleep(1_000)?;
            match sampler.average()? {
                Some(avg) => info!("sampler: average {:.1} at {}", avg, k.now()),
                None => info!("sampler: no block yet at {}", k.now()),
            }
        },
        sampler.clone(),
    )?;

    let summary = kernel.run(Some(10_000))?;
    info!(
        "sampler: {} blocks, {} dropped, {} context switches",
        sampler.history()?.len(),
        sampler.dropped(),
        summary.context_switches
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let scenarios: [(&str, fn() -> Result<(), RunError>); 4] = [
        ("dining philosophers", dining),
        ("producer/consumer", producer_consumer),
        ("priority inversion", priority_inversion),
        ("adc sampler", adc_sampler),
    ];
    let mut failed = false;
    for (name, scenario) in scenarios {
        info!("=== {} ===", name);
        if let Err(e) = scenario() {
            error!("{}: {}", name, e);
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
}
