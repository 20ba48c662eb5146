//! Ready queues
//!
//! Fixed-priority preemptive selection: one FIFO per priority level and a
//! bitmap of the non-empty levels, so picking the next thread is a single
//! `trailing_zeros`. A preempted thread goes back to the head of its level,
//! a yielding or time-sliced one to the tail.

use alloc::collections::VecDeque;

use crate::config::PRIORITY_LEVELS;
use crate::thread::{Priority, ThreadId};

/// Ready-queue scheduler
///
/// Holds only ready threads; the running thread is tracked separately in
/// `current` and is never in a ready queue.
pub struct Scheduler {
    /// One FIFO per priority level, most urgent level first
    ready: [VecDeque<ThreadId>; PRIORITY_LEVELS],
    /// Bit `n` set when level `n` is non-empty
    ready_mask: u64,
    /// Running thread
    current: ThreadId,
    /// Ticks left in the running thread's time slice
    slice_left: u32,
    /// Total context switches
    pub context_switches: u32,
}

impl Scheduler {
    /// Empty scheduler with the idle thread running
    pub const fn new() -> Self {
        Self {
            ready: [const { VecDeque::new() }; PRIORITY_LEVELS],
            ready_mask: 0,
            current: ThreadId::IDLE,
            slice_left: 0,
            context_switches: 0,
        }
    }

    /// Append to the tail of the thread's level
    pub fn push_back(&mut self, tid: ThreadId, prio: Priority) {
        let level = prio.level();
        self.ready[level].push_back(tid);
        self.ready_mask |= 1 << level;
    }

    /// Insert at the head of the thread's level (preempted threads)
    pub fn push_front(&mut self, tid: ThreadId, prio: Priority) {
        let level = prio.level();
        self.ready[level].push_front(tid);
        self.ready_mask |= 1 << level;
    }

    /// Take a thread out of its ready queue; returns whether it was there
    pub fn remove(&mut self, tid: ThreadId, prio: Priority) -> bool {
        let level = prio.level();
        let queue = &mut self.ready[level];
        let Some(pos) = queue.iter().position(|&t| t == tid) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            self.ready_mask &= !(1 << level);
        }
        true
    }

    /// Dequeue the head of the most urgent non-empty level
    pub fn pop_highest(&mut self) -> Option<ThreadId> {
        if self.ready_mask == 0 {
            return None;
        }
        let level = self.ready_mask.trailing_zeros() as usize;
        let tid = self.ready[level].pop_front();
        if self.ready[level].is_empty() {
            self.ready_mask &= !(1 << level);
        }
        tid
    }

    /// Priority of the most urgent ready thread
    pub fn highest_ready(&self) -> Option<Priority> {
        if self.ready_mask == 0 {
            None
        } else {
            Some(Priority::from_level(self.ready_mask.trailing_zeros() as usize))
        }
    }

    /// Is any thread ready at exactly this priority?
    pub fn has_ready_at(&self, prio: Priority) -> bool {
        self.ready_mask & (1 << prio.level()) != 0
    }

    /// Number of ready threads
    pub fn ready_count(&self) -> usize {
        self.ready.iter().map(VecDeque::len).sum()
    }

    /// Ready threads at one level in queue order
    pub fn ready_at(&self, prio: Priority) -> impl Iterator<Item = ThreadId> + '_ {
        self.ready[prio.level()].iter().copied()
    }

    pub fn current(&self) -> ThreadId {
        self.current
    }

    pub fn set_current(&mut self, tid: ThreadId) {
        self.current = tid;
    }

    /// Start a fresh time slice
    pub fn reset_slice(&mut self, ticks: u32) {
        self.slice_left = ticks;
    }

    /// Consume one tick of the slice; true when it just ran out
    pub fn tick_slice(&mut self) -> bool {
        if self.slice_left == 0 {
            return false;
        }
        self.slice_left -= 1;
        self.slice_left == 0
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
