//! Counting semaphore
//!
//! `give` is interrupt-safe and hands the unit straight to the longest
//! waiting thread when there is one, so the count never rises while threads
//! are queued.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::error::{KResult, KernelError};
use crate::kernel::{Handoff, Kernel, Wait};
use crate::poll::PollTarget;
use crate::thread::{Pend, ThreadId};
use crate::timer::Timeout;
use crate::wait_queue::{WaitOrder, WaitQueueId};

object_id!(
    /// Handle of a semaphore
    SemId
);

/// Semaphore state
#[derive(Debug)]
pub struct Semaphore {
    /// Available units
    pub(crate) count: u32,
    /// Upper bound of `count`
    pub(crate) limit: u32,
    pub(crate) waiters: WaitQueueId,
    /// Threads polling for availability
    pub(crate) pollers: Vec<ThreadId>,
}

impl Kernel {
    /// Create a semaphore; needs `limit >= 1` and `initial <= limit`
    pub fn sem_init(&mut self, initial: u32, limit: u32) -> KResult<SemId> {
        if limit == 0 || initial > limit {
            return Err(self.misuse("sem_init", KernelError::InvalidState));
        }
        let id = crate::macros::next_index(self.semaphores.len())?;
        let waiters = self.new_wait_queue(WaitOrder::Fifo)?;
        self.semaphores.push(Semaphore {
            count: initial,
            limit,
            waiters,
            pollers: Vec::new(),
        });
        debug!("sem {id} created ({initial}/{limit})");
        Ok(SemId(id))
    }

    /// Release one unit (interrupt-safe)
    pub fn sem_give(&mut self, id: SemId) -> KResult<()> {
        self.check_object(id.index() < self.semaphores.len(), "sem_give")?;
        let waiters = self.semaphores[id.index()].waiters;
        if let Some(w) = self.wait_queues[waiters.index()].pop_front() {
            self.wake(w.tid, Ok(Handoff::Done));
        } else {
            let s = &mut self.semaphores[id.index()];
            s.count = s.count.saturating_add(1).min(s.limit);
            self.poll_notify(PollTarget::Sem(id));
        }
        self.reschedule();
        Ok(())
    }

    /// Acquire one unit, waiting up to `timeout`
    pub fn sem_take(&mut self, id: SemId, timeout: Timeout) -> KResult<Wait<()>> {
        self.check_object(id.index() < self.semaphores.len(), "sem_take")?;
        let s = &mut self.semaphores[id.index()];
        if s.count > 0 {
            s.count -= 1;
            return Ok(Wait::Ready(()));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("sem_take", timeout)?;
        let waiters = self.semaphores[id.index()].waiters;
        self.pend_current(Pend::SemTake, Some(waiters), timeout);
        Ok(Wait::Pending)
    }

    pub fn sem_count(&self, id: SemId) -> Option<u32> {
        self.semaphores.get(id.index()).map(|s| s.count)
    }

    /// Zero the count and cancel every waiter
    pub fn sem_reset(&mut self, id: SemId) -> KResult<()> {
        self.check_object(id.index() < self.semaphores.len(), "sem_reset")?;
        let s = &mut self.semaphores[id.index()];
        s.count = 0;
        let waiters = s.waiters;
        let mut cancelled = 0;
        while let Some(w) = self.wait_queues[waiters.index()].pop_front() {
            self.wake(w.tid, Err(KernelError::Cancelled));
            cancelled += 1;
        }
        if cancelled > 0 {
            warn!("sem {}: reset cancelled {cancelled} waiter(s)", id.0);
        }
        self.reschedule();
        Ok(())
    }
}
