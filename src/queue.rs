//! # Bounded Queue
//!
//! Fixed-capacity FIFO built from two counting semaphores and a mutex:
//!
//! ```text
//!   send:  take(not_full) ─► lock(guard) ─► push ─► unlock(guard) ─► give(not_empty)
//!   recv:  take(not_empty) ─► lock(guard) ─► pop ─► unlock(guard) ─► give(not_full)
//! ```
//!
//! `not_full` starts at the capacity and `not_empty` at zero, so their
//! counts always sum to the capacity minus the items in flight. Storage is
//! a `heapless::Deque`; the length can never exceed `N`.
//!
//! Timer callbacks post without the guard. They cannot be preempted by a
//! thread, and every storage access is a critical section.

use std::sync::Arc;

use heapless::Deque;

use crate::clock::Timeout;
use crate::error::{ConfigError, KernelError};
use crate::kernel::Kernel;
use crate::mutex::{Mutex, MutexMode};
use crate::semaphore::Semaphore;
use crate::sync::{self, Guarded};

struct Storage<T, const N: usize> {
    items: Deque<T, N>,
    high_water: usize,
}

struct Inner<T, const N: usize> {
    storage: Guarded<Storage<T, N>>,
    not_empty: Semaphore,
    not_full: Semaphore,
    guard: Mutex,
}

/// Error from [`BoundedQueue::try_send`].
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// No free slot; the item is returned.
    Full(T),
    Kernel(KernelError),
}

/// Handle to a bounded message queue. Clones refer to the same queue.
pub struct BoundedQueue<T, const N: usize> {
    inner: Arc<Inner<T, N>>,
}

impl<T, const N: usize> Clone for BoundedQueue<T, N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send, const N: usize> BoundedQueue<T, N> {
    /// # Errors
    /// `ZeroCapacity` if `N == 0`, or a table-exhaustion error for the
    /// underlying semaphores and mutex.
    pub fn new(kernel: &Kernel) -> Result<Self, ConfigError> {
        if N == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let capacity = u32::try_from(N).map_err(|_| ConfigError::InvalidParameter("queue capacity exceeds u32"))?;
        Ok(Self {
            inner: Arc::new(Inner {
                storage: sync::guarded(Storage {
                    items: Deque::new(),
                    high_water: 0,
                }),
                not_empty: Semaphore::new(kernel, 0, capacity)?,
                not_full: Semaphore::new(kernel, capacity, capacity)?,
                guard: Mutex::new(kernel, MutexMode::Plain)?,
            }),
        })
    }

    fn push(&self, item: T) -> Result<(), T> {
        sync::with_guarded(&self.inner.storage, |s| {
            s.items.push_back(item)?;
            s.high_water = s.high_water.max(s.items.len());
            Ok(())
        })
    }

    fn pop(&self) -> Option<T> {
        sync::with_guarded(&self.inner.storage, |s| s.items.pop_front())
    }

    /// Store `item` after a `not_full` unit was taken. A failed lock hands
    /// the unit back.
    fn push_guarded(&self, item: T) -> Result<(), KernelError> {
        if let Err(e) = self.inner.guard.lock() {
            let _ = self.inner.not_full.give();
            return Err(e);
        }
        let pushed = self.push(item);
        self.inner.guard.unlock()?;
        pushed.map_err(|_| KernelError::QueueInconsistent)?;
        self.inner.not_empty.give()
    }

    /// Append `item`, blocking while the queue is full.
    pub fn send(&self, item: T) -> Result<(), KernelError> {
        self.inner.not_full.take(Timeout::Forever)?;
        self.push_guarded(item)
    }

    /// Append `item` only if there is room right now.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        match self.inner.not_full.take(Timeout::NoWait) {
            Ok(()) => self.push_guarded(item).map_err(TrySendError::Kernel),
            Err(KernelError::WouldBlock) => Err(TrySendError::Full(item)),
            Err(e) => Err(TrySendError::Kernel(e)),
        }
    }

    /// Remove the oldest item, blocking while the queue is empty.
    pub fn recv(&self) -> Result<T, KernelError> {
        self.recv_timeout(Timeout::Forever)
    }

    pub fn recv_timeout(&self, timeout: Timeout) -> Result<T, KernelError> {
        self.inner.not_empty.take(timeout)?;
        if let Err(e) = self.inner.guard.lock() {
            let _ = self.inner.not_empty.give();
            return Err(e);
        }
        let item = self.pop();
        self.inner.guard.unlock()?;
        let item = item.ok_or(KernelError::QueueInconsistent)?;
        self.inner.not_full.give()?;
        Ok(item)
    }

    /// Post from timer context. Returns the item if the queue is full.
    pub(crate) fn post_in_isr(&self, item: T) -> Result<(), T> {
        if !self.inner.not_full.try_take_in_isr() {
            return Err(item);
        }
        self.push(item)?;
        // not_full was just taken, so not_empty has room.
        let _ = self.inner.not_empty.give_in_isr();
        Ok(())
    }

    pub fn len(&self) -> usize {
        sync::with_guarded(&self.inner.storage, |s| s.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Largest length ever observed.
    pub fn high_water_mark(&self) -> usize {
        sync::with_guarded(&self.inner.storage, |s| s.high_water)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::HaltReason;
    use crate::thread::ThreadConfig;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_fifo_order_and_capacity_bound() {
        let kernel = Kernel::new();
        let q: BoundedQueue<u32, 3> = BoundedQueue::new(&kernel).unwrap();
        let received = Arc::new(StdMutex::new(std::vec::Vec::new()));

        kernel
            .spawn(
                ThreadConfig::new("producer", 5),
                |_, q: BoundedQueue<u32, 3>| {
                    for i in 0..10 {
                        q.send(i)?;
                    }
                    Ok(())
                },
                q.clone(),
            )
            .unwrap();
        kernel
            .spawn(
                ThreadConfig::new("consumer", 6),
                |k, (q, received): (BoundedQueue<u32, 3>, Arc<StdMutex<std::vec::Vec<u32>>>)| {
                    for _ in 0..10 {
                        let item = q.recv()?;
                        received.lock().unwrap().push(item);
                        k.work(1)?;
                    }
                    Ok(())
                },
                (q.clone(), received.clone()),
            )
            .unwrap();

        let summary = kernel.run(None).unwrap();
        assert_eq!(summary.reason, HaltReason::AllTerminated);
        assert_eq!(*received.lock().unwrap(), (0..10).collect::<std::vec::Vec<_>>());
        assert_eq!(q.high_water_mark(), 3);
        assert!(q.is_empty());
    }

    #[test]
    fn test_try_send_returns_item_when_full() {
        let kernel = Kernel::new();
        let q: BoundedQueue<&'static str, 1> = BoundedQueue::new(&kernel).unwrap();
        let result = Arc::new(StdMutex::new(None));

        kernel
            .spawn(
                ThreadConfig::new("sender", 5),
                |_, (q, result): (BoundedQueue<&'static str, 1>, Arc<StdMutex<Option<_>>>)| {
                    q.try_send("first").map_err(|_| KernelError::QueueInconsistent)?;
                    *result.lock().unwrap() = Some(q.try_send("second"));
                    Ok(())
                },
                (q.clone(), result.clone()),
            )
            .unwrap();

        kernel.run(None).unwrap();
        assert_eq!(
            result.lock().unwrap().take(),
            Some(Err(TrySendError::Full("second")))
        );
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_recv_timeout_on_empty_queue() {
        let kernel = Kernel::new();
        let q: BoundedQueue<u8, 2> = BoundedQueue::new(&kernel).unwrap();
        let result = Arc::new(StdMutex::new(None));

        kernel
            .spawn(
                ThreadConfig::new("receiver", 5),
                |k, (q, result): (BoundedQueue<u8, 2>, Arc<StdMutex<Option<_>>>)| {
                    let r = q.recv_timeout(Timeout::Ticks(3));
                    *result.lock().unwrap() = Some((r, k.now()));
                    Ok(())
                },
                (q.clone(), result.clone()),
            )
            .unwrap();

        kernel.run(None).unwrap();
        assert_eq!(result.lock().unwrap().take(), Some((Err(KernelError::Timeout), 3)));
    }

    #[test]
    fn test_rejected_send_keeps_capacity() {
        let kernel = Kernel::new();
        let q: BoundedQueue<u8, 2> = BoundedQueue::new(&kernel).unwrap();
        let results = Arc::new(StdMutex::new(std::vec::Vec::new()));

        kernel
            .spawn(
                ThreadConfig::new("sender", 5),
                |k, (q, results): (BoundedQueue<u8, 2>, Arc<StdMutex<std::vec::Vec<_>>>)| {
                    let inside = k.non_preemptible(|| q.try_send(1))?;
                    let mut results = results.lock().unwrap();
                    results.push(inside);
                    for item in 2..5 {
                        results.push(q.try_send(item));
                    }
                    Ok(())
                },
                (q.clone(), results.clone()),
            )
            .unwrap();

        kernel.run(None).unwrap();
        assert_eq!(
            *results.lock().unwrap(),
            [
                Err(TrySendError::Kernel(KernelError::PreemptionDisabled)),
                Ok(()),
                Ok(()),
                Err(TrySendError::Full(4)),
            ]
        );
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_rejected_recv_keeps_item() {
        let kernel = Kernel::new();
        let q: BoundedQueue<u8, 2> = BoundedQueue::new(&kernel).unwrap();
        let results = Arc::new(StdMutex::new(std::vec::Vec::new()));

        kernel
            .spawn(
                ThreadConfig::new("receiver", 5),
                |k, (q, results): (BoundedQueue<u8, 2>, Arc<StdMutex<std::vec::Vec<_>>>)| {
                    q.send(7)?;
                    let inside = k.non_preemptible(|| q.recv_timeout(Timeout::NoWait))?;
                    let mut results = results.lock().unwrap();
                    results.push(inside);
                    results.push(q.recv_timeout(Timeout::NoWait));
                    results.push(q.recv_timeout(Timeout::NoWait));
                    Ok(())
                },
                (q.clone(), results.clone()),
            )
            .unwrap();

        kernel.run(None).unwrap();
        assert_eq!(
            *results.lock().unwrap(),
            [Err(KernelError::PreemptionDisabled), Ok(7), Err(KernelError::WouldBlock)]
        );
        assert!(q.is_empty());
    }
}
