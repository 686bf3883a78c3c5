//! # Scheduler
//!
//! Core scheduling state for rtsync: the thread table, one FIFO ready queue
//! per priority level, the clock, and the identity of the running thread.
//!
//! ## Scheduling Algorithm
//!
//! 1. **Select**: the head of the highest-precedence non-empty ready queue
//!    runs. Lower numeric priority wins.
//! 2. **Preempt**: whenever a thread becomes ready with higher precedence
//!    than the running one, the running thread is requeued at the *head* of
//!    its level and the newcomer runs. The kernel checks this right after
//!    every wakeup, not only on the tick.
//! 3. **Round-robin**: every tick charges the running thread's slice. When
//!    the slice is exhausted and a peer of equal priority is ready, the
//!    running thread moves to the *tail* of its level.
//! 4. **Non-preemptible sections**: while preemption is disabled, neither
//!    rule 2 nor rule 3 fires; pending decisions are taken when it is
//!    re-enabled.
//!
//! This type is pure state. Blocking, host-thread hand-off and timer
//! processing live in [`kernel`](crate::kernel).

use core::array;

use heapless::Vec;
use log::trace;

use crate::clock::{Clock, Ticks};
use crate::config::{LOWEST_PRIORITY, MAX_THREADS, NUM_PRIORITIES};
use crate::error::ConfigError;
use crate::thread::{ThreadConfig, ThreadControlBlock, ThreadId, ThreadState};

type ReadyQueue = Vec<ThreadId, MAX_THREADS>;

pub struct Scheduler {
    /// Thread table. A thread's index is its `ThreadId`; slots are never
    /// reused.
    pub threads: Vec<ThreadControlBlock, MAX_THREADS>,

    /// One FIFO per priority level, indexed by effective priority.
    ready: [ReadyQueue; NUM_PRIORITIES],

    /// Thread holding the CPU, `None` while idle.
    pub current: Option<ThreadId>,

    pub clock: Clock,

    /// Nesting depth of non-preemptible sections.
    preempt_disabled: u32,

    /// Number of times the CPU changed hands.
    pub context_switches: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            threads: Vec::new(),
            ready: array::from_fn(|_| Vec::new()),
            current: None,
            clock: Clock::new(),
            preempt_disabled: 0,
            context_switches: 0,
        }
    }

    /// Register a new thread and queue it as ready.
    ///
    /// # Returns
    /// - `Ok(id)`: the slot of the new thread
    /// - `Err(_)`: the priority is out of range or the table is full
    pub fn create_thread(&mut self, config: ThreadConfig) -> Result<ThreadId, ConfigError> {
        if config.priority > LOWEST_PRIORITY {
            return Err(ConfigError::InvalidPriority {
                priority: config.priority,
                lowest: LOWEST_PRIORITY,
            });
        }
        let id = ThreadId(self.threads.len());
        self.threads
            .push(ThreadControlBlock::new(id, config))
            .map_err(|_| ConfigError::ThreadTableFull {
                capacity: MAX_THREADS,
            })?;
        self.make_ready(id);
        Ok(id)
    }

    /// Retire a thread that never ran, e.g. because its host thread could
    /// not be created.
    pub fn discard(&mut self, id: ThreadId) {
        self.remove_ready(id);
        self.threads[id.0].state = ThreadState::Terminated;
    }

    #[inline]
    pub fn tcb(&self, id: ThreadId) -> &ThreadControlBlock {
        &self.threads[id.0]
    }

    #[inline]
    pub fn tcb_mut(&mut self, id: ThreadId) -> &mut ThreadControlBlock {
        &mut self.threads[id.0]
    }

    pub fn get(&self, id: ThreadId) -> Option<&ThreadControlBlock> {
        self.threads.get(id.0)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadControlBlock> {
        self.threads.get_mut(id.0)
    }

    // -----------------------------------------------------------------------
    // Ready queues
    // -----------------------------------------------------------------------

    /// Queue a thread at the tail of its priority level.
    pub fn make_ready(&mut self, id: ThreadId) {
        self.enqueue(id, false);
    }

    /// Queue a thread at the head of its priority level. Used for a thread
    /// that was preempted, so it resumes before its peers.
    pub fn make_ready_front(&mut self, id: ThreadId) {
        self.enqueue(id, true);
    }

    fn enqueue(&mut self, id: ThreadId, front: bool) {
        let tcb = &mut self.threads[id.0];
        if tcb.suspended {
            tcb.state = ThreadState::Suspended;
            return;
        }
        tcb.state = ThreadState::Ready;
        tcb.queued_front = front;
        let queue = &mut self.ready[tcb.effective_priority as usize];
        if queue.contains(&id) {
            return;
        }
        // A thread is queued at most once, so MAX_THREADS slots always suffice.
        let _ = if front {
            queue.insert(0, id)
        } else {
            queue.push(id)
        };
    }

    pub fn remove_ready(&mut self, id: ThreadId) {
        let level = self.threads[id.0].effective_priority as usize;
        self.ready[level].retain(|&t| t != id);
    }

    /// Highest-precedence ready thread, without dequeuing it.
    pub fn highest_ready(&self) -> Option<ThreadId> {
        self.ready.iter().find_map(|q| q.first().copied())
    }

    /// Number of threads queued at `priority`.
    pub fn ready_at(&self, priority: u8) -> usize {
        self.ready[priority as usize].len()
    }

    /// Dequeue the highest-precedence ready thread and make it current.
    ///
    /// Returns `None` when nothing is ready; the caller then idles.
    pub fn pick_next(&mut self) -> Option<ThreadId> {
        let level = self.ready.iter().position(|q| !q.is_empty())?;
        let id = self.ready[level].remove(0);

        if self.current != Some(id) {
            self.context_switches += 1;
            trace!(
                "sched: {:?} -> {} ({:?}) at {}",
                self.current,
                self.threads[id.0].config.name,
                id,
                self.clock.now()
            );
        }

        let tcb = &mut self.threads[id.0];
        tcb.state = ThreadState::Running;
        tcb.stats.dispatches += 1;
        if tcb.ticks_remaining == 0 {
            tcb.reset_slice();
        }
        self.current = Some(id);
        Some(id)
    }

    /// Change a thread's effective priority, moving it between ready queues
    /// if it is queued. A thread queued at the head of its old level goes to
    /// the head of the new one.
    pub fn set_effective_priority(&mut self, id: ThreadId, priority: u8) {
        if self.threads[id.0].effective_priority == priority {
            return;
        }
        let queued = self.threads[id.0].state == ThreadState::Ready;
        if queued {
            self.remove_ready(id);
        }
        self.threads[id.0].effective_priority = priority;
        if queued {
            let front = self.threads[id.0].queued_front;
            self.enqueue(id, front);
        }
    }

    // -----------------------------------------------------------------------
    // Preemption
    // -----------------------------------------------------------------------

    pub fn disable_preemption(&mut self) {
        self.preempt_disabled += 1;
    }

    pub fn enable_preemption(&mut self) {
        self.preempt_disabled = self.preempt_disabled.saturating_sub(1);
    }

    #[inline]
    pub fn preemption_enabled(&self) -> bool {
        self.preempt_disabled == 0
    }

    /// Decide whether the running thread must give up the CPU.
    ///
    /// A higher-precedence ready thread always wins. With `slice_check`, an
    /// exhausted slice also yields to a ready peer of equal priority. When
    /// this returns `true` the running thread has already been requeued and
    /// the caller must reschedule.
    pub fn preempt_current(&mut self, slice_check: bool) -> bool {
        if !self.preemption_enabled() {
            return false;
        }
        let Some(cur) = self.current else {
            return false;
        };
        if self.threads[cur.0].state != ThreadState::Running {
            return false;
        }
        let priority = self.threads[cur.0].effective_priority;

        let higher = self
            .highest_ready()
            .map_or(false, |h| self.threads[h.0].outranks(priority));
        if higher {
            self.threads[cur.0].stats.preemptions += 1;
            self.make_ready_front(cur);
            return true;
        }

        if slice_check && self.threads[cur.0].ticks_remaining == 0 {
            self.threads[cur.0].reset_slice();
            if self.ready_at(priority) > 0 {
                self.threads[cur.0].stats.preemptions += 1;
                self.make_ready(cur);
                return true;
            }
        }
        false
    }

    // -----------------------------------------------------------------------
    // Time
    // -----------------------------------------------------------------------

    /// Advance the clock by one tick and charge it to the running thread.
    pub fn tick(&mut self) -> Ticks {
        let now = self.clock.tick();
        if let Some(cur) = self.current {
            let tcb = &mut self.threads[cur.0];
            if tcb.state == ThreadState::Running {
                tcb.stats.cpu_ticks += 1;
                tcb.ticks_remaining = tcb.ticks_remaining.saturating_sub(1);
            }
        }
        now
    }

    /// Threads whose sleep or bounded wait has expired by `now`.
    pub fn due_wakeups(&self, now: Ticks) -> Vec<ThreadId, MAX_THREADS> {
        let mut due = Vec::new();
        for tcb in self.threads.iter() {
            let waiting = matches!(tcb.state, ThreadState::Sleeping | ThreadState::Blocked);
            if waiting && tcb.wake_at.map_or(false, |t| t <= now) {
                let _ = due.push(tcb.id);
            }
        }
        due
    }

    /// Earliest pending sleep or wait deadline.
    pub fn next_deadline(&self) -> Option<Ticks> {
        self.threads
            .iter()
            .filter(|t| t.is_live())
            .filter_map(|t| t.wake_at)
            .min()
    }

    pub fn live_threads(&self) -> usize {
        self.threads.iter().filter(|t| t.is_live()).count()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sched_with(priorities: &[u8]) -> (Scheduler, std::vec::Vec<ThreadId>) {
        let mut s = Scheduler::new();
        let ids = priorities
            .iter()
            .map(|&p| s.create_thread(ThreadConfig::new("t", p)).unwrap())
            .collect();
        (s, ids)
    }

    #[test]
    fn test_highest_precedence_runs_first() {
        let (mut s, ids) = sched_with(&[30, 10, 20]);
        assert_eq!(s.pick_next(), Some(ids[1]));
        assert_eq!(s.tcb(ids[1]).state, ThreadState::Running);
        assert_eq!(s.current, Some(ids[1]));
    }

    #[test]
    fn test_invalid_priority_rejected() {
        let mut s = Scheduler::new();
        let err = s
            .create_thread(ThreadConfig::new("bad", LOWEST_PRIORITY + 1))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPriority { .. }));
    }

    #[test]
    fn test_thread_table_capacity_is_fatal() {
        let mut s = Scheduler::new();
        for _ in 0..MAX_THREADS {
            s.create_thread(ThreadConfig::new("t", 5)).unwrap();
        }
        assert_eq!(
            s.create_thread(ThreadConfig::new("extra", 5)),
            Err(ConfigError::ThreadTableFull {
                capacity: MAX_THREADS
            })
        );
    }

    #[test]
    fn test_higher_ready_preempts_to_front() {
        let (mut s, ids) = sched_with(&[20, 20]);
        assert_eq!(s.pick_next(), Some(ids[0]));

        let hi = s.create_thread(ThreadConfig::new("hi", 5)).unwrap();
        assert!(s.preempt_current(false));
        // Preempted thread resumes ahead of its equal-priority peer.
        assert_eq!(s.pick_next(), Some(hi));
        s.tcb_mut(hi).state = ThreadState::Terminated;
        assert_eq!(s.pick_next(), Some(ids[0]));
    }

    #[test]
    fn test_round_robin_on_slice_expiry() {
        let mut s = Scheduler::new();
        let a = s
            .create_thread(ThreadConfig::new("a", 10).with_time_slice(2))
            .unwrap();
        let b = s
            .create_thread(ThreadConfig::new("b", 10).with_time_slice(2))
            .unwrap();

        assert_eq!(s.pick_next(), Some(a));
        s.tick();
        assert!(!s.preempt_current(true));
        s.tick();
        assert!(s.preempt_current(true));
        assert_eq!(s.pick_next(), Some(b));
        assert_eq!(s.tcb(a).state, ThreadState::Ready);
    }

    #[test]
    fn test_slice_expiry_without_peer_keeps_running() {
        let (mut s, ids) = sched_with(&[10, 20]);
        s.pick_next();
        for _ in 0..crate::config::DEFAULT_TIME_SLICE {
            s.tick();
        }
        assert!(!s.preempt_current(true));
        assert_eq!(s.current, Some(ids[0]));
        assert_eq!(s.tcb(ids[0]).stats.cpu_ticks, 10);
    }

    #[test]
    fn test_disabled_preemption_defers_decision() {
        let (mut s, _) = sched_with(&[20]);
        s.pick_next();
        s.disable_preemption();
        s.create_thread(ThreadConfig::new("hi", 1)).unwrap();
        assert!(!s.preempt_current(true));
        s.enable_preemption();
        assert!(s.preempt_current(true));
    }

    #[test]
    fn test_priority_change_moves_ready_thread() {
        let (mut s, ids) = sched_with(&[10, 30]);
        s.set_effective_priority(ids[1], 5);
        assert_eq!(s.highest_ready(), Some(ids[1]));
        assert_eq!(s.ready_at(30), 0);
        assert_eq!(s.ready_at(5), 1);
    }

    #[test]
    fn test_priority_change_keeps_preempted_thread_at_front() {
        let (mut s, ids) = sched_with(&[20, 25]);
        assert_eq!(s.pick_next(), Some(ids[0]));

        let hi = s.create_thread(ThreadConfig::new("hi", 5)).unwrap();
        assert!(s.preempt_current(false));
        s.set_effective_priority(ids[0], 25);
        assert_eq!(s.ready_at(25), 2);

        assert_eq!(s.pick_next(), Some(hi));
        s.tcb_mut(hi).state = ThreadState::Terminated;
        // Still ahead of the thread already waiting at its new level.
        assert_eq!(s.pick_next(), Some(ids[0]));
    }

    #[test]
    fn test_boosted_thread_joins_tail_of_new_level() {
        let (mut s, ids) = sched_with(&[10, 30]);
        s.set_effective_priority(ids[1], 10);
        assert_eq!(s.pick_next(), Some(ids[0]));
    }

    #[test]
    fn test_suspended_thread_is_not_queued() {
        let (mut s, ids) = sched_with(&[10]);
        s.remove_ready(ids[0]);
        s.tcb_mut(ids[0]).suspended = true;
        s.make_ready(ids[0]);
        assert_eq!(s.tcb(ids[0]).state, ThreadState::Suspended);
        assert_eq!(s.pick_next(), None);
    }

    #[test]
    fn test_due_wakeups_and_next_deadline() {
        let (mut s, ids) = sched_with(&[10, 10]);
        for (id, at) in ids.iter().zip([7u64, 3]) {
            s.remove_ready(*id);
            let tcb = s.tcb_mut(*id);
            tcb.state = ThreadState::Sleeping;
            tcb.wake_at = Some(at);
        }
        assert_eq!(s.next_deadline(), Some(3));
        assert_eq!(s.due_wakeups(5).as_slice(), &[ids[1]]);
        assert_eq!(s.due_wakeups(7).len(), 2);
    }
}
