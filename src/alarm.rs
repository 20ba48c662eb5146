//! Kernel timers
//!
//! One-shot or periodic alarms driven by the tick. Expiry callbacks run in
//! interrupt context, so they may give, post or put but never block.
//! Threads can wait for the next expiry with `alarm_status_sync`.

use alloc::vec::Vec;

use log::{debug, trace};

use crate::error::{KResult, KernelError};
use crate::kernel::{Handoff, Kernel, Wait};
use crate::thread::Pend;
use crate::timer::{self, Timeout};
use crate::wait_queue::{WaitOrder, WaitQueueId};

object_id!(
    /// Handle of a kernel timer
    AlarmId
);

/// Alarm callback, run from the tick interrupt
pub type AlarmFn = fn(&mut Kernel, AlarmId);

/// Kernel timer state
#[derive(Debug)]
pub struct Alarm {
    pub(crate) expiry_fn: Option<AlarmFn>,
    pub(crate) stop_fn: Option<AlarmFn>,
    /// Absolute tick of the next expiry (None = stopped)
    pub(crate) expiry: Option<u64>,
    /// Re-arm interval (0 = one-shot)
    pub(crate) period: u64,
    /// Expiries since the status was last read
    pub(crate) status: u32,
    pub(crate) waiters: WaitQueueId,
}

impl Kernel {
    pub fn alarm_init(
        &mut self,
        expiry_fn: Option<AlarmFn>,
        stop_fn: Option<AlarmFn>,
    ) -> KResult<AlarmId> {
        let id = crate::macros::next_index(self.alarms.len())?;
        let waiters = self.new_wait_queue(WaitOrder::Fifo)?;
        self.alarms.push(Alarm {
            expiry_fn,
            stop_fn,
            expiry: None,
            period: 0,
            status: 0,
            waiters,
        });
        debug!("alarm {id} created");
        Ok(AlarmId(id))
    }

    /// Arm the alarm to expire after `duration` ticks, then every `period`
    /// ticks (0 = one-shot). Restarting resets the status.
    pub fn alarm_start(&mut self, id: AlarmId, duration: u64, period: u64) -> KResult<()> {
        self.check_object(id.index() < self.alarms.len(), "alarm_start")?;
        let now = self.timer.now();
        let expiry = now.saturating_add(duration.max(1));
        let a = &mut self.alarms[id.index()];
        a.expiry = Some(expiry);
        a.period = period;
        a.status = 0;
        trace!("alarm {} armed for tick {expiry}", id.0);
        Ok(())
    }

    /// Disarm the alarm; runs the stop callback if it was running
    pub fn alarm_stop(&mut self, id: AlarmId) -> KResult<()> {
        self.check_object(id.index() < self.alarms.len(), "alarm_stop")?;
        let a = &mut self.alarms[id.index()];
        if a.expiry.take().is_none() {
            return Ok(());
        }
        let stop_fn = a.stop_fn;
        let waiters = a.waiters;
        if let Some(f) = stop_fn {
            f(self, id);
        }
        while let Some(w) = self.wait_queues[waiters.index()].pop_front() {
            self.wake(w.tid, Ok(Handoff::Count(0)));
        }
        self.reschedule();
        Ok(())
    }

    /// Read and reset the expiry count
    pub fn alarm_status_get(&mut self, id: AlarmId) -> KResult<u32> {
        self.check_object(id.index() < self.alarms.len(), "alarm_status_get")?;
        Ok(core::mem::take(&mut self.alarms[id.index()].status))
    }

    /// Wait for the next expiry unless some are already counted; returns
    /// the expiry count (0 if the alarm is or gets stopped)
    pub fn alarm_status_sync(&mut self, id: AlarmId, timeout: Timeout) -> KResult<Wait<u32>> {
        self.check_object(id.index() < self.alarms.len(), "alarm_status_sync")?;
        let a = &mut self.alarms[id.index()];
        if a.status > 0 {
            return Ok(Wait::Ready(core::mem::take(&mut a.status)));
        }
        if a.expiry.is_none() {
            return Ok(Wait::Ready(0));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("alarm_status_sync", timeout)?;
        let waiters = self.alarms[id.index()].waiters;
        self.pend_current(Pend::AlarmSync, Some(waiters), timeout);
        Ok(Wait::Pending)
    }

    /// Ticks until the next expiry (None when stopped)
    pub fn alarm_remaining(&self, id: AlarmId) -> Option<u64> {
        let expiry = self.alarms.get(id.index())?.expiry?;
        Some(timer::remaining(self.timer.now(), expiry))
    }

    /// Expire every alarm due at `now`, in (expiry, id) order
    pub(crate) fn process_alarms(&mut self, now: u64) {
        let mut due: Vec<(u64, AlarmId)> = self
            .alarms
            .iter()
            .enumerate()
            .filter_map(|(i, a)| match a.expiry {
                Some(e) if e <= now => Some((e, AlarmId(i as u16))),
                _ => None,
            })
            .collect();
        due.sort_unstable();

        for (_, id) in due {
            // an earlier callback may have stopped or restarted this alarm
            let a = &mut self.alarms[id.index()];
            let expiry = match a.expiry {
                Some(e) if e <= now => e,
                _ => continue,
            };
            a.status = a.status.saturating_add(1);
            a.expiry = (a.period > 0).then(|| expiry.saturating_add(a.period));
            let expiry_fn = a.expiry_fn;
            trace!("alarm {} expired (status {})", id.0, a.status);
            if let Some(f) = expiry_fn {
                f(self, id);
            }

            let a = &mut self.alarms[id.index()];
            let waiters = a.waiters;
            if self.wait_queues[waiters.index()].is_empty() {
                continue;
            }
            let status = core::mem::take(&mut a.status);
            while let Some(w) = self.wait_queues[waiters.index()].pop_front() {
                self.wake(w.tid, Ok(Handoff::Count(status)));
            }
        }
    }
}
