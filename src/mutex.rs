//! # Mutex
//!
//! Binary lock with a FIFO wait queue and an optional priority-inheritance
//! mode.
//!
//! Ownership is handed directly to the head waiter on `unlock`, so a woken
//! thread never has to race for the lock again. Handoff is FIFO regardless
//! of priority; inheritance only changes which thread the *scheduler* runs,
//! never the order of the wait queue.
//!
//! ## Priority Inheritance
//!
//! The effective priority of a thread is the highest precedence among its
//! base priority and every thread waiting on a priority-inheriting mutex it
//! owns. It is recomputed whenever a waiter joins or leaves such a mutex and
//! on every unlock. If the boosted owner is itself blocked on another
//! inheriting mutex, the boost is propagated along the chain.

use heapless::Vec;
use log::debug;

use crate::clock::Timeout;
use crate::config::{MAX_MUTEXES, MAX_THREADS};
use crate::error::{ConfigError, KernelError};
use crate::kernel::{Acquire, Kernel, KernelState};
use crate::thread::{ThreadId, WaitObject, WakeReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId(pub(crate) usize);

/// Locking protocol, fixed when the mutex is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexMode {
    #[default]
    Plain,
    PriorityInheriting,
}

pub(crate) struct MutexState {
    pub owner: Option<ThreadId>,
    pub waiters: Vec<ThreadId, MAX_THREADS>,
    pub mode: MutexMode,
    pub acquisitions: u64,
    pub contentions: u64,
}

impl KernelState {
    pub(crate) fn mutex_create(&mut self, mode: MutexMode) -> Result<MutexId, ConfigError> {
        let id = MutexId(self.mutexes.len());
        self.mutexes
            .push(MutexState {
                owner: None,
                waiters: Vec::new(),
                mode,
                acquisitions: 0,
                contentions: 0,
            })
            .map_err(|_| ConfigError::ObjectTableFull {
                kind: "mutex",
                capacity: MAX_MUTEXES,
            })?;
        Ok(id)
    }

    fn mutex_grant(&mut self, id: MutexId, to: ThreadId) {
        let m = &mut self.mutexes[id.0];
        m.owner = Some(to);
        m.acquisitions += 1;
        // Callers check for room before granting or queueing.
        let _ = self.sched.tcb_mut(to).held.push(id);
    }

    pub(crate) fn mutex_lock(&mut self, id: MutexId, me: ThreadId, timeout: Timeout) -> Result<Acquire, KernelError> {
        let owner = match self.mutexes[id.0].owner {
            Some(owner) if owner == me => return Err(KernelError::Relock(me)),
            owner => owner,
        };
        if self.sched.tcb(me).held.is_full() {
            return Err(KernelError::TooManyHeld(me));
        }

        let Some(owner) = owner else {
            self.mutex_grant(id, me);
            return Ok(Acquire::Now);
        };
        if timeout.is_poll() {
            return Err(KernelError::WouldBlock);
        }

        let deadline = timeout.deadline(self.sched.clock.now());
        let m = &mut self.mutexes[id.0];
        m.contentions += 1;
        // A blocked thread is queued at most once.
        let _ = m.waiters.push(me);
        let inherit = m.mode == MutexMode::PriorityInheriting;
        self.block_on(me, WaitObject::Mutex(id), deadline);
        if inherit {
            self.refresh_priority(owner);
        }
        Ok(Acquire::Blocked)
    }

    /// Release `id`, handing it to the head waiter. Returns the new owner.
    pub(crate) fn mutex_unlock(&mut self, id: MutexId, me: ThreadId) -> Result<Option<ThreadId>, KernelError> {
        let owner = self.mutexes[id.0].owner;
        if owner != Some(me) {
            return Err(KernelError::NotOwner { caller: me, owner });
        }
        self.sched.tcb_mut(me).held.retain(|&m| m != id);

        let m = &mut self.mutexes[id.0];
        m.owner = None;
        let next = if m.waiters.is_empty() {
            None
        } else {
            Some(m.waiters.remove(0))
        };

        if let Some(next) = next {
            self.mutex_grant(id, next);
            self.wake(next, WakeReason::Acquired);
        }
        self.refresh_priority(me);
        if let Some(next) = next {
            self.refresh_priority(next);
        }
        Ok(next)
    }

    /// Drop `waiter` from the queue of `id` after its wait timed out.
    pub(crate) fn mutex_cancel_wait(&mut self, id: MutexId, waiter: ThreadId) {
        let m = &mut self.mutexes[id.0];
        m.waiters.retain(|&t| t != waiter);
        if m.mode == MutexMode::PriorityInheriting {
            if let Some(owner) = m.owner {
                self.refresh_priority(owner);
            }
        }
    }

    /// Recompute the effective priority of `tid` and of every owner further
    /// along its inheritance chain.
    pub(crate) fn refresh_priority(&mut self, tid: ThreadId) {
        let mut next = Some(tid);
        // A chain visits each thread at most once.
        for _ in 0..MAX_THREADS {
            let Some(t) = next else {
                break;
            };
            let tcb = self.sched.tcb(t);
            let mut priority = tcb.base_priority;
            for m in tcb.held.iter() {
                let m = &self.mutexes[m.0];
                if m.mode != MutexMode::PriorityInheriting {
                    continue;
                }
                for w in m.waiters.iter() {
                    priority = priority.min(self.sched.tcb(*w).effective_priority);
                }
            }
            if priority == tcb.effective_priority {
                break;
            }

            debug!(
                "mutex: {} priority {} -> {}",
                tcb.config.name, tcb.effective_priority, priority
            );
            self.sched.set_effective_priority(t, priority);
            next = match self.sched.tcb(t).waiting_on {
                Some(WaitObject::Mutex(m)) if self.mutexes[m.0].mode == MutexMode::PriorityInheriting => {
                    self.mutexes[m.0].owner
                }
                _ => None,
            };
        }
    }
}

/// Handle to a kernel mutex. Clones refer to the same lock.
///
/// Locking is explicit: there is no guard object, so an owner that returns
/// early must unlock on every path.
#[derive(Clone)]
pub struct Mutex {
    kernel: Kernel,
    id: MutexId,
}

impl Mutex {
    pub fn new(kernel: &Kernel, mode: MutexMode) -> Result<Self, ConfigError> {
        let id = kernel.with(|k| k.mutex_create(mode))?;
        Ok(Self {
            kernel: kernel.clone(),
            id,
        })
    }

    pub fn id(&self) -> MutexId {
        self.id
    }

    pub fn mode(&self) -> MutexMode {
        self.kernel.with(|k| k.mutexes[self.id.0].mode)
    }

    /// Block until the calling thread owns the mutex.
    pub fn lock(&self) -> Result<(), KernelError> {
        self.lock_timeout(Timeout::Forever)
    }

    /// Wait at most `timeout` for the mutex.
    ///
    /// # Errors
    /// `Relock` if the caller already owns it, `WouldBlock` for a failed
    /// poll, `Timeout` if a bounded wait expired.
    pub fn lock_timeout(&self, timeout: Timeout) -> Result<(), KernelError> {
        let me = self.kernel.wait_context(timeout)?;
        let outcome = self.kernel.with(|k| k.mutex_lock(self.id, me, timeout))?;
        self.kernel.finish_wait(me, outcome)
    }

    /// Take the mutex if it is free. Never blocks.
    pub fn try_lock(&self) -> Result<bool, KernelError> {
        match self.lock_timeout(Timeout::NoWait) {
            Ok(()) => Ok(true),
            Err(KernelError::WouldBlock) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Release the mutex. Only the owner may unlock; any other caller gets
    /// `NotOwner` and the mutex is left untouched.
    pub fn unlock(&self) -> Result<(), KernelError> {
        let me = self.kernel.thread_context()?;
        let next = self.kernel.with(|k| k.mutex_unlock(self.id, me))?;
        if let Some(next) = next {
            debug!("mutex: {:?} handed from {:?} to {:?}", self.id, me, next);
        }
        self.kernel.preempt_point(Some(me));
        Ok(())
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.kernel.with(|k| k.mutexes[self.id.0].owner)
    }

    /// Number of times ownership was granted.
    pub fn acquisitions(&self) -> u64 {
        self.kernel.with(|k| k.mutexes[self.id.0].acquisitions)
    }

    /// Number of lock attempts that had to wait.
    pub fn contentions(&self) -> u64 {
        self.kernel.with(|k| k.mutexes[self.id.0].contentions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::HaltReason;
    use crate::thread::ThreadConfig;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn test_contended_lock_is_mutually_exclusive() {
        let kernel = Kernel::new();
        let m = Mutex::new(&kernel, MutexMode::Plain).unwrap();
        let inside = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicU32::new(0));

        for name in ["a", "b", "c"] {
            let state = (m.clone(), inside.clone(), violations.clone());
            kernel
                .spawn(
                    ThreadConfig::new(name, 10).with_time_slice(2),
                    |k, (m, inside, violations)| {
                        for _ in 0..5 {
                            m.lock()?;
                            if inside.swap(true, Ordering::SeqCst) {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            k.work(3)?;
                            inside.store(false, Ordering::SeqCst);
                            m.unlock()?;
                        }
                        Ok(())
                    },
                    state,
                )
                .unwrap();
        }

        let summary = kernel.run(None).unwrap();
        assert_eq!(summary.reason, HaltReason::AllTerminated);
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(m.acquisitions(), 15);
        assert!(m.contentions() > 0);
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn test_handoff_is_fifo_not_priority() {
        let kernel = Kernel::new();
        let m = Mutex::new(&kernel, MutexMode::Plain).unwrap();
        let order = Arc::new(StdMutex::new(std::vec::Vec::new()));

        kernel
            .spawn(
                ThreadConfig::new("holder", 5),
                |k, m: Mutex| {
                    m.lock()?;
                    k.sleep(10)?;
                    m.unlock()
                },
                m.clone(),
            )
            .unwrap();
        for (name, priority, delay) in [("first", 6, 1), ("second", 4, 2)] {
            kernel
                .spawn(
                    ThreadConfig::new(name, priority),
                    move |k, (m, order): (Mutex, Arc<StdMutex<std::vec::Vec<&'static str>>>)| {
                        k.sleep(delay)?;
                        m.lock()?;
                        order.lock().unwrap().push(name);
                        m.unlock()
                    },
                    (m.clone(), order.clone()),
                )
                .unwrap();
        }

        kernel.run(None).unwrap();
        assert_eq!(*order.lock().unwrap(), ["first", "second"]);
    }

    #[test]
    fn test_unlock_by_non_owner_is_rejected() {
        let kernel = Kernel::new();
        let m = Mutex::new(&kernel, MutexMode::Plain).unwrap();
        let result = Arc::new(StdMutex::new(None));

        let owner = kernel
            .spawn(
                ThreadConfig::new("owner", 5),
                |k, m: Mutex| {
                    m.lock()?;
                    k.sleep(5)?;
                    m.unlock()
                },
                m.clone(),
            )
            .unwrap();
        kernel
            .spawn(
                ThreadConfig::new("intruder", 6),
                |_, (m, result): (Mutex, Arc<StdMutex<Option<_>>>)| {
                    *result.lock().unwrap() = Some((m.unlock(), m.owner()));
                    Ok(())
                },
                (m.clone(), result.clone()),
            )
            .unwrap();

        kernel.run(None).unwrap();
        let (err, owner_after) = result.lock().unwrap().take().unwrap();
        assert!(matches!(
            err,
            Err(KernelError::NotOwner { owner: Some(o), .. }) if o == owner
        ));
        assert_eq!(owner_after, Some(owner));
    }

    #[test]
    fn test_relock_and_try_lock() {
        let kernel = Kernel::new();
        let m = Mutex::new(&kernel, MutexMode::Plain).unwrap();
        let seen = Arc::new(StdMutex::new(std::vec::Vec::new()));

        kernel
            .spawn(
                ThreadConfig::new("owner", 5),
                |k, (m, seen): (Mutex, Arc<StdMutex<std::vec::Vec<_>>>)| {
                    assert!(m.try_lock()?);
                    seen.lock().unwrap().push(m.lock());
                    k.sleep(3)?;
                    m.unlock()
                },
                (m.clone(), seen.clone()),
            )
            .unwrap();
        kernel
            .spawn(
                ThreadConfig::new("poller", 6),
                |_, (m, seen): (Mutex, Arc<StdMutex<std::vec::Vec<_>>>)| {
                    let got = m.try_lock()?;
                    seen.lock().unwrap().push(if got { Ok(()) } else { Err(KernelError::WouldBlock) });
                    Ok(())
                },
                (m.clone(), seen.clone()),
            )
            .unwrap();

        kernel.run(None).unwrap();
        let results = seen.lock().unwrap();
        assert!(matches!(results[0], Err(KernelError::Relock(_))));
        assert_eq!(results[1], Err(KernelError::WouldBlock));
    }

    #[test]
    fn test_bounded_lock_times_out() {
        let kernel = Kernel::new();
        let m = Mutex::new(&kernel, MutexMode::PriorityInheriting).unwrap();
        let outcome = Arc::new(StdMutex::new(None));

        let holder = kernel
            .spawn(
                ThreadConfig::new("holder", 20),
                |k, m: Mutex| {
                    m.lock()?;
                    k.work(20)?;
                    m.unlock()
                },
                m.clone(),
            )
            .unwrap();
        kernel
            .spawn(
                ThreadConfig::new("waiter", 10),
                |k, (m, outcome): (Mutex, Arc<StdMutex<Option<_>>>)| {
                    k.sleep(1)?;
                    let r = m.lock_timeout(Timeout::Ticks(5));
                    *outcome.lock().unwrap() = Some((r, k.now()));
                    Ok(())
                },
                (m.clone(), outcome.clone()),
            )
            .unwrap();

        kernel.run(None).unwrap();
        assert_eq!(outcome.lock().unwrap().take(), Some((Err(KernelError::Timeout), 6)));
        // The boost is withdrawn once the waiter gives up.
        assert_eq!(kernel.thread_info(holder).unwrap().effective_priority, 20);
    }

    #[test]
    fn test_inheritance_boosts_and_restores_owner() {
        let kernel = Kernel::new();
        let m = Mutex::new(&kernel, MutexMode::PriorityInheriting).unwrap();
        let boosted = Arc::new(AtomicU8::new(0));
        let restored = Arc::new(AtomicU8::new(0));

        kernel
            .spawn(
                ThreadConfig::new("high", 10),
                |k, m: Mutex| {
                    k.sleep(1)?;
                    m.lock()?;
                    m.unlock()
                },
                m.clone(),
            )
            .unwrap();
        kernel
            .spawn(
                ThreadConfig::new("low", 30),
                |k, (m, boosted, restored): (Mutex, Arc<AtomicU8>, Arc<AtomicU8>)| {
                    let me = k.current().ok_or(KernelError::NotInThread)?;
                    m.lock()?;
                    k.work(5)?;
                    let info = k.thread_info(me).ok_or(KernelError::NoSuchThread(me))?;
                    boosted.store(info.effective_priority, Ordering::SeqCst);
                    m.unlock()?;
                    let info = k.thread_info(me).ok_or(KernelError::NoSuchThread(me))?;
                    restored.store(info.effective_priority, Ordering::SeqCst);
                    Ok(())
                },
                (m.clone(), boosted.clone(), restored.clone()),
            )
            .unwrap();

        kernel.run(None).unwrap();
        assert_eq!(boosted.load(Ordering::SeqCst), 10);
        assert_eq!(restored.load(Ordering::SeqCst), 30);
    }

    #[test]
    fn test_inheritance_is_transitive() {
        let kernel = Kernel::new();
        let m1 = Mutex::new(&kernel, MutexMode::PriorityInheriting).unwrap();
        let m2 = Mutex::new(&kernel, MutexMode::PriorityInheriting).unwrap();
        let boosted = Arc::new(AtomicU8::new(0));

        kernel
            .spawn(
                ThreadConfig::new("high", 10),
                |k, m2: Mutex| {
                    k.sleep(2)?;
                    m2.lock()?;
                    m2.unlock()
                },
                m2.clone(),
            )
            .unwrap();
        kernel
            .spawn(
                ThreadConfig::new("mid", 20),
                |k, (m1, m2): (Mutex, Mutex)| {
                    k.sleep(1)?;
                    m2.lock()?;
                    m1.lock()?;
                    m1.unlock()?;
                    m2.unlock()
                },
                (m1.clone(), m2.clone()),
            )
            .unwrap();
        kernel
            .spawn(
                ThreadConfig::new("low", 30),
                |k, (m1, boosted): (Mutex, Arc<AtomicU8>)| {
                    let me = k.current().ok_or(KernelError::NotInThread)?;
                    m1.lock()?;
                    k.work(10)?;
                    let info = k.thread_info(me).ok_or(KernelError::NoSuchThread(me))?;
                    boosted.store(info.effective_priority, Ordering::SeqCst);
                    m1.unlock()
                },
                (m1.clone(), boosted.clone()),
            )
            .unwrap();

        let summary = kernel.run(None).unwrap();
        assert_eq!(summary.reason, HaltReason::AllTerminated);
        assert_eq!(boosted.load(Ordering::SeqCst), 10);
        assert!(summary.threads.iter().all(|t| t.effective_priority == t.base_priority));
    }

    #[test]
    fn test_departing_waiter_leaves_next_highest_boost() {
        let kernel = Kernel::new();
        let m = Mutex::new(&kernel, MutexMode::PriorityInheriting).unwrap();
        let trace = Arc::new(StdMutex::new(std::vec::Vec::new()));

        let low = kernel
            .spawn(
                ThreadConfig::new("low", 30),
                |k, (m, trace): (Mutex, Arc<StdMutex<std::vec::Vec<u8>>>)| {
                    let me = k.current().ok_or(KernelError::NotInThread)?;
                    m.lock()?;
                    k.work(4)?;
                    let info = k.thread_info(me).ok_or(KernelError::NoSuchThread(me))?;
                    trace.lock().unwrap().push(info.effective_priority);
                    k.work(6)?;
                    m.unlock()
                },
                (m.clone(), trace.clone()),
            )
            .unwrap();
        let timed_out = Arc::new(StdMutex::new(None));
        kernel
            .spawn(
                ThreadConfig::new("high", 10),
                move |k, (m, trace, timed_out): (Mutex, Arc<StdMutex<std::vec::Vec<u8>>>, Arc<StdMutex<Option<_>>>)| {
                    k.sleep(2)?;
                    *timed_out.lock().unwrap() = Some((m.lock_timeout(Timeout::Ticks(3)), k.now()));
                    let info = k.thread_info(low).ok_or(KernelError::NoSuchThread(low))?;
                    trace.lock().unwrap().push(info.effective_priority);
                    Ok(())
                },
                (m.clone(), trace.clone(), timed_out.clone()),
            )
            .unwrap();
        kernel
            .spawn(
                ThreadConfig::new("mid", 20),
                move |k, (m, trace): (Mutex, Arc<StdMutex<std::vec::Vec<u8>>>)| {
                    k.sleep(1)?;
                    m.lock()?;
                    let info = k.thread_info(low).ok_or(KernelError::NoSuchThread(low))?;
                    trace.lock().unwrap().push(info.effective_priority);
                    m.unlock()
                },
                (m.clone(), trace.clone()),
            )
            .unwrap();

        let summary = kernel.run(None).unwrap();
        assert_eq!(summary.reason, HaltReason::AllTerminated);
        assert_eq!(timed_out.lock().unwrap().take(), Some((Err(KernelError::Timeout), 5)));
        // Boosted by high, then held at mid's level once high gives up,
        // and back to base only after the unlock.
        assert_eq!(*trace.lock().unwrap(), [10, 20, 30]);
    }
}
