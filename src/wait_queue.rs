//! Wait queues
//!
//! An ordered list of blocked threads attached to one kernel object. Mutex
//! queues are priority ordered (FIFO among equals); every other primitive
//! releases in arrival order. Each entry carries a snapshot of the waiter's
//! priority so ordering never has to look back into the TCB table.

use alloc::collections::VecDeque;

use crate::thread::{Priority, ThreadId};

object_id!(
    /// Handle of a wait queue in the kernel arena
    WaitQueueId
);

/// Release order of a wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOrder {
    /// Arrival order
    Fifo,
    /// Most urgent first, arrival order among equals
    Priority,
}

/// A blocked thread and its priority when it was (re)queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub tid: ThreadId,
    pub prio: Priority,
}

/// Queue of threads blocked on one object
#[derive(Debug)]
pub struct WaitQueue {
    order: WaitOrder,
    waiters: VecDeque<Waiter>,
}

impl WaitQueue {
    pub const fn new(order: WaitOrder) -> Self {
        Self {
            order,
            waiters: VecDeque::new(),
        }
    }

    pub fn order(&self) -> WaitOrder {
        self.order
    }

    /// Enqueue a waiter according to the queue's order
    pub fn push(&mut self, tid: ThreadId, prio: Priority) {
        let waiter = Waiter { tid, prio };
        match self.order {
            WaitOrder::Fifo => self.waiters.push_back(waiter),
            WaitOrder::Priority => {
                // first entry strictly less urgent than the newcomer
                let pos = self
                    .waiters
                    .iter()
                    .position(|w| prio.is_higher_than(w.prio))
                    .unwrap_or(self.waiters.len());
                self.waiters.insert(pos, waiter);
            }
        }
    }

    /// Dequeue the next waiter to release
    pub fn pop_front(&mut self) -> Option<Waiter> {
        self.waiters.pop_front()
    }

    pub fn head(&self) -> Option<Waiter> {
        self.waiters.front().copied()
    }

    /// Priority of the next waiter (the most urgent one for priority queues)
    pub fn head_priority(&self) -> Option<Priority> {
        self.head().map(|w| w.prio)
    }

    /// Remove a specific thread; returns whether it was queued
    pub fn remove(&mut self, tid: ThreadId) -> bool {
        match self.waiters.iter().position(|w| w.tid == tid) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Update a waiter's priority after a priority change.
    ///
    /// Priority-ordered queues re-sort the entry (it goes behind waiters of
    /// equal priority); FIFO queues keep its position.
    pub fn reposition(&mut self, tid: ThreadId, prio: Priority) {
        match self.order {
            WaitOrder::Fifo => {
                if let Some(w) = self.waiters.iter_mut().find(|w| w.tid == tid) {
                    w.prio = prio;
                }
            }
            WaitOrder::Priority => {
                if self.remove(tid) {
                    self.push(tid, prio);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Waiter> + '_ {
        self.waiters.iter()
    }

    /// Waiting thread ids in release order
    pub fn tids(&self) -> alloc::vec::Vec<ThreadId> {
        self.waiters.iter().map(|w| w.tid).collect()
    }

    pub fn contains(&self, tid: ThreadId) -> bool {
        self.waiters.iter().any(|w| w.tid == tid)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
