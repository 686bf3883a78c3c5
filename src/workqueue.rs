//! # Work Queue
//!
//! A dedicated thread draining a bounded queue of jobs. Timer callbacks
//! submit work here instead of doing it themselves; the jobs then run in
//! ordinary thread context where blocking is allowed.

use log::debug;

use crate::error::{ConfigError, KernelError};
use crate::kernel::Kernel;
use crate::queue::BoundedQueue;
use crate::thread::{ThreadConfig, ThreadId};

/// Deferred job. Runs on the work queue's thread.
pub type Job = Box<dyn FnOnce(&Kernel) + Send>;

#[derive(Clone)]
pub struct WorkQueue<const N: usize> {
    jobs: BoundedQueue<Job, N>,
    thread: ThreadId,
}

impl<const N: usize> WorkQueue<N> {
    /// Create the queue and spawn its worker thread.
    pub fn start(kernel: &Kernel, config: ThreadConfig) -> Result<Self, ConfigError> {
        let jobs: BoundedQueue<Job, N> = BoundedQueue::new(kernel)?;
        let thread = kernel.spawn(config, worker::<N>, jobs.clone())?;
        debug!("workq: {} started with {} slots", config.name, N);
        Ok(Self { jobs, thread })
    }

    /// Queue a job from thread context, blocking while the queue is full.
    pub fn submit<F>(&self, job: F) -> Result<(), KernelError>
    where
        F: FnOnce(&Kernel) + Send + 'static,
    {
        self.jobs.send(Box::new(job))
    }

    pub(crate) fn submit_in_isr(&self, job: Job) -> Result<(), Job> {
        self.jobs.post_in_isr(job)
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }
}

fn worker<const N: usize>(kernel: &Kernel, jobs: BoundedQueue<Job, N>) -> Result<(), KernelError> {
    loop {
        let job = jobs.recv()?;
        job(kernel);
    }
}
