//! Condition variable
//!
//! `condvar_wait` releases the mutex and blocks in one step. When the wait
//! ends (signal or timeout) the kernel re-acquires the mutex for the waiter
//! through the mutex's own hand-off path before the waiter is readied.

use log::debug;

use crate::error::{KResult, KernelError};
use crate::kernel::{Handoff, Kernel, Wait};
use crate::mutex::MutexId;
use crate::thread::Pend;
use crate::timer::Timeout;
use crate::wait_queue::{WaitOrder, WaitQueueId};

object_id!(
    /// Handle of a condition variable
    CondvarId
);

#[derive(Debug)]
pub struct Condvar {
    pub(crate) waiters: WaitQueueId,
}

impl Kernel {
    pub fn condvar_init(&mut self) -> KResult<CondvarId> {
        let id = crate::macros::next_index(self.condvars.len())?;
        let waiters = self.new_wait_queue(WaitOrder::Fifo)?;
        self.condvars.push(Condvar { waiters });
        debug!("condvar {id} created");
        Ok(CondvarId(id))
    }

    /// Release `mutex`, wait for a signal, and own `mutex` again on return.
    ///
    /// The caller must hold `mutex` exactly once.
    pub fn condvar_wait(
        &mut self,
        id: CondvarId,
        mutex: MutexId,
        timeout: Timeout,
    ) -> KResult<Wait<()>> {
        self.check_object(id.index() < self.condvars.len(), "condvar_wait")?;
        self.check_object(mutex.index() < self.mutexes.len(), "condvar_wait")?;
        self.require_thread_context("condvar_wait")?;
        let cur = self.current();
        let m = &self.mutexes[mutex.index()];
        if m.owner != Some(cur) || m.count != 1 {
            return Err(self.misuse("condvar_wait", KernelError::InvalidState));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("condvar_wait", timeout)?;

        self.mutex_release(mutex);
        let waiters = self.condvars[id.index()].waiters;
        self.pend_current(Pend::CondvarWait { mutex }, Some(waiters), timeout);
        Ok(Wait::Pending)
    }

    /// Wake the longest-waiting thread
    pub fn condvar_signal(&mut self, id: CondvarId) -> KResult<()> {
        self.check_object(id.index() < self.condvars.len(), "condvar_signal")?;
        let waiters = self.condvars[id.index()].waiters;
        if let Some(w) = self.wait_queues[waiters.index()].pop_front() {
            self.resume_condvar_waiter(w.tid);
        }
        self.reschedule();
        Ok(())
    }

    /// Wake every waiter; returns how many were woken
    pub fn condvar_broadcast(&mut self, id: CondvarId) -> KResult<usize> {
        self.check_object(id.index() < self.condvars.len(), "condvar_broadcast")?;
        let waiters = self.condvars[id.index()].waiters;
        let mut woken = 0;
        while let Some(w) = self.wait_queues[waiters.index()].pop_front() {
            self.resume_condvar_waiter(w.tid);
            woken += 1;
        }
        self.reschedule();
        Ok(woken)
    }

    fn resume_condvar_waiter(&mut self, tid: crate::thread::ThreadId) {
        let t = &mut self.threads[tid.index()];
        t.pended_on = None;
        t.deadline = None;
        if let Some(Pend::CondvarWait { mutex }) = t.pend.take() {
            self.relock_for(tid, mutex, Ok(Handoff::Done));
        }
    }
}
