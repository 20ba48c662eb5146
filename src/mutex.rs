//! Mutex with priority inheritance
//!
//! Recursive ownership with a priority-ordered wait queue. While a more
//! urgent thread waits, the owner runs at that thread's priority; the boost
//! follows chains of owners that are themselves blocked on mutexes.
//!
//! The inherited priority is never stored incrementally. It is recomputed
//! from the owner's base priority and the head waiter of every mutex it
//! owns, so a timeout or abort of any waiter cannot leave a stale boost.

use log::{debug, trace};

use crate::error::{KResult, KernelError};
use crate::kernel::{Handoff, Kernel, Wait, Wakeup};
use crate::thread::{Pend, Priority, ThreadId, ThreadState};
use crate::timer::Timeout;
use crate::wait_queue::{WaitOrder, WaitQueueId};

object_id!(
    /// Handle of a mutex
    MutexId
);

/// Mutex state
#[derive(Debug)]
pub struct Mutex {
    /// Owning thread
    pub(crate) owner: Option<ThreadId>,
    /// Recursive lock count (0 iff unowned)
    pub(crate) count: u32,
    /// Priority-ordered waiters
    pub(crate) waiters: WaitQueueId,
}

impl Kernel {
    pub fn mutex_init(&mut self) -> KResult<MutexId> {
        let id = crate::macros::next_index(self.mutexes.len())?;
        let waiters = self.new_wait_queue(WaitOrder::Priority)?;
        self.mutexes.push(Mutex {
            owner: None,
            count: 0,
            waiters,
        });
        debug!("mutex {id} created");
        Ok(MutexId(id))
    }

    /// Lock the mutex, waiting up to `timeout`.
    ///
    /// The owner may lock again; each lock needs a matching unlock.
    pub fn mutex_lock(&mut self, id: MutexId, timeout: Timeout) -> KResult<Wait<()>> {
        self.check_object(id.index() < self.mutexes.len(), "mutex_lock")?;
        self.require_thread_context("mutex_lock")?;
        let cur = self.current();
        let m = &mut self.mutexes[id.index()];
        match m.owner {
            None => {
                m.owner = Some(cur);
                m.count = 1;
                trace!("mutex {} locked by {cur}", id.0);
                return Ok(Wait::Ready(()));
            }
            Some(owner) if owner == cur => {
                m.count = m.count.checked_add(1).ok_or(KernelError::ResourceExhausted)?;
                return Ok(Wait::Ready(()));
            }
            Some(_) => {}
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("mutex_lock", timeout)?;

        let m = &self.mutexes[id.index()];
        let (owner, waiters) = (m.owner, m.waiters);
        self.block_current(
            Pend::MutexLock {
                mutex: id,
                relock: None,
            },
            Some(waiters),
            timeout,
        );
        if let Some(owner) = owner {
            self.refresh_priority(owner);
        }
        self.switch_away();
        Ok(Wait::Pending)
    }

    /// Release one level of ownership; the last unlock hands the mutex to
    /// the most urgent waiter
    pub fn mutex_unlock(&mut self, id: MutexId) -> KResult<()> {
        self.check_object(id.index() < self.mutexes.len(), "mutex_unlock")?;
        self.require_thread_context("mutex_unlock")?;
        let cur = self.current();
        let m = &mut self.mutexes[id.index()];
        if m.owner != Some(cur) {
            return Err(self.misuse("mutex_unlock", KernelError::InvalidState));
        }
        m.count -= 1;
        if m.count > 0 {
            return Ok(());
        }
        self.mutex_release(id);
        self.reschedule();
        Ok(())
    }

    pub fn mutex_owner(&self, id: MutexId) -> Option<ThreadId> {
        self.mutexes.get(id.index()).and_then(|m| m.owner)
    }

    pub fn mutex_lock_count(&self, id: MutexId) -> u32 {
        self.mutexes.get(id.index()).map_or(0, |m| m.count)
    }

    /// Drop ownership entirely and pass the mutex to the next waiter
    pub(crate) fn mutex_release(&mut self, id: MutexId) {
        let m = &mut self.mutexes[id.index()];
        let prev = m.owner.take();
        m.count = 0;
        let waiters = m.waiters;

        if let Some(w) = self.wait_queues[waiters.index()].pop_front() {
            let relock = match self.threads[w.tid.index()].pend.take() {
                Some(Pend::MutexLock { relock, .. }) => relock,
                _ => None,
            };
            let m = &mut self.mutexes[id.index()];
            m.owner = Some(w.tid);
            m.count = 1;
            trace!("mutex {} handed to {}", id.0, w.tid);
            self.wake(w.tid, relock.unwrap_or(Ok(Handoff::Done)));
            self.refresh_priority(w.tid);
        }
        if let Some(prev) = prev {
            self.refresh_priority(prev);
        }
    }

    /// Acquire `mutex` for a thread leaving a condvar wait.
    ///
    /// Free: the thread takes it and is readied with `result`. Owned: the
    /// thread queues on the mutex and gets `result` once it owns it.
    pub(crate) fn relock_for(&mut self, tid: ThreadId, mutex: MutexId, result: Wakeup) {
        let m = &mut self.mutexes[mutex.index()];
        let Some(owner) = m.owner else {
            m.owner = Some(tid);
            m.count = 1;
            self.wake(tid, result);
            return;
        };
        let waiters = m.waiters;
        let prio = self.threads[tid.index()].priority;
        self.wait_queues[waiters.index()].push(tid, prio);
        let t = &mut self.threads[tid.index()];
        t.state = ThreadState::Blocked;
        t.pend = Some(Pend::MutexLock {
            mutex,
            relock: Some(result),
        });
        t.pended_on = Some(waiters);
        t.deadline = None;
        self.refresh_priority(owner);
    }

    /// Most urgent head waiter over every mutex `tid` owns
    pub(crate) fn inherited_priority(&self, tid: ThreadId) -> Option<Priority> {
        self.mutexes
            .iter()
            .filter(|m| m.owner == Some(tid))
            .filter_map(|m| self.wait_queues[m.waiters.index()].head_priority())
            .reduce(Priority::most_urgent)
    }

    /// Recompute a thread's effective priority and push the change along
    /// the chain of mutex owners it is blocked behind
    pub(crate) fn refresh_priority(&mut self, mut tid: ThreadId) {
        loop {
            let base = self.threads[tid.index()].base_priority;
            let effective = match self.inherited_priority(tid) {
                Some(p) => base.most_urgent(p),
                None => base,
            };
            if effective == self.threads[tid.index()].priority {
                return;
            }
            self.set_effective_priority(tid, effective);

            let next = match &self.threads[tid.index()].pend {
                Some(Pend::MutexLock { mutex, .. }) => self.mutexes[mutex.index()].owner,
                _ => None,
            };
            match next {
                Some(owner) if owner != tid => tid = owner,
                _ => return,
            }
        }
    }
}
