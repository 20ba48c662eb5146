//! Workqueues: deferred work in thread context
//!
//! A workqueue is a kernel thread draining a list of submitted work items,
//! one handler per step, in submission order. Submitting is interrupt-safe,
//! so an interrupt can push the slow half of its job to a thread where
//! handlers may block. Delayed work is queued by the tick once its delay
//! has elapsed.
//!
//! A work item is pending from submission until its handler starts; it may
//! be resubmitted from inside its own handler.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use log::{debug, trace};

use crate::error::KResult;
use crate::kernel::{Handoff, Kernel};
use crate::thread::{Flow, Pend, Priority, ThreadId, ThreadOptions, ThreadSpec};
use crate::timer::{self, Timeout};
use crate::wait_queue::{WaitOrder, WaitQueueId};

object_id!(
    /// Handle of a workqueue
    WorkqId
);

object_id!(
    /// Handle of a work item
    WorkId
);

/// Work handler, run on the workqueue thread
pub type WorkFn = fn(&mut Kernel, WorkId);

#[derive(Debug)]
pub struct Work {
    pub(crate) handler: WorkFn,
    /// Workqueue it was last submitted or scheduled to
    pub(crate) target: Option<WorkqId>,
    /// In a workqueue's pending list
    pub(crate) queued: bool,
    /// Tick at which delayed work is queued
    pub(crate) due: Option<u64>,
}

impl Work {
    fn is_pending(&self) -> bool {
        self.queued || self.due.is_some()
    }
}

#[derive(Debug)]
pub struct Workqueue {
    pub(crate) thread: ThreadId,
    pub(crate) pending: VecDeque<WorkId>,
    /// Holds the workqueue thread while there is nothing to run
    pub(crate) idle: WaitQueueId,
}

/// Entry of every workqueue thread; the thread argument is the queue index
fn workqueue_thread(k: &mut Kernel) -> Flow {
    let cur = k.current();
    let _ = k.take_wakeup(cur);
    let Some(queue) = k.thread(cur).map(|t| WorkqId(t.arg() as u16)) else {
        return Flow::Continue;
    };
    match k.workq_next(queue) {
        Some(work) => {
            let handler = k.works[work.index()].handler;
            trace!("workq {} runs work {}", queue.0, work.0);
            handler(k, work);
        }
        None => k.workq_idle(queue),
    }
    Flow::Continue
}

impl Kernel {
    /// Start a workqueue served by a new essential thread at `priority`
    pub fn workq_start(&mut self, name: &[u8], priority: Priority) -> KResult<WorkqId> {
        let id = crate::macros::next_index(self.workqueues.len())?;
        let idle = self.new_wait_queue(WaitOrder::Fifo)?;
        let spec = ThreadSpec::new(name, priority)
            .entry(workqueue_thread)
            .arg(id as usize)
            .options(ThreadOptions::ESSENTIAL)
            .delay(Timeout::Forever);
        let thread = self.spawn_with(spec)?;
        self.workqueues.push(Workqueue {
            thread,
            pending: VecDeque::new(),
            idle,
        });
        debug!("workq {id} started on {thread}");
        self.thread_start(thread)?;
        Ok(WorkqId(id))
    }

    pub fn workq_thread(&self, queue: WorkqId) -> Option<ThreadId> {
        self.workqueues.get(queue.index()).map(|q| q.thread)
    }

    /// Work items waiting for the workqueue thread
    pub fn workq_len(&self, queue: WorkqId) -> Option<usize> {
        self.workqueues.get(queue.index()).map(|q| q.pending.len())
    }

    pub fn work_init(&mut self, handler: WorkFn) -> KResult<WorkId> {
        let id = crate::macros::next_index(self.works.len())?;
        self.works.push(Work {
            handler,
            target: None,
            queued: false,
            due: None,
        });
        Ok(WorkId(id))
    }

    /// Queue `work` on `queue` (interrupt-safe).
    ///
    /// Returns false, changing nothing, if the item is already pending.
    pub fn work_submit(&mut self, queue: WorkqId, work: WorkId) -> KResult<bool> {
        self.check_work(queue, work, "work_submit")?;
        if self.works[work.index()].is_pending() {
            return Ok(false);
        }
        self.work_enqueue(queue, work);
        self.reschedule();
        Ok(true)
    }

    /// Queue `work` on `queue` after `delay` ticks (0 = now;
    /// interrupt-safe). Returns false if the item is already pending.
    pub fn work_schedule(&mut self, queue: WorkqId, work: WorkId, delay: u64) -> KResult<bool> {
        self.check_work(queue, work, "work_schedule")?;
        if self.works[work.index()].is_pending() {
            return Ok(false);
        }
        if delay == 0 {
            self.work_enqueue(queue, work);
            self.reschedule();
            return Ok(true);
        }
        let due = self.timer.now().saturating_add(delay);
        let w = &mut self.works[work.index()];
        w.target = Some(queue);
        w.due = Some(due);
        trace!("work {} due at tick {due}", work.0);
        Ok(true)
    }

    /// Withdraw pending work. Returns whether it was pending; a handler
    /// already running is not affected.
    pub fn work_cancel(&mut self, work: WorkId) -> KResult<bool> {
        self.check_object(work.index() < self.works.len(), "work_cancel")?;
        let w = &mut self.works[work.index()];
        if w.due.take().is_some() {
            return Ok(true);
        }
        if !w.queued {
            return Ok(false);
        }
        w.queued = false;
        if let Some(q) = w.target {
            self.workqueues[q.index()].pending.retain(|&p| p != work);
        }
        Ok(true)
    }

    /// Queued, or waiting out its delay
    pub fn work_is_pending(&self, work: WorkId) -> bool {
        self.works.get(work.index()).is_some_and(Work::is_pending)
    }

    /// Ticks until delayed work is queued (None unless delayed)
    pub fn work_remaining(&self, work: WorkId) -> Option<u64> {
        let due = self.works.get(work.index())?.due?;
        Some(timer::remaining(self.timer.now(), due))
    }

    /// Queue every delayed item due at `now`, in (due, id) order
    pub(crate) fn process_work_delays(&mut self, now: u64) {
        let mut due: Vec<(u64, WorkId)> = self
            .works
            .iter()
            .enumerate()
            .filter_map(|(i, w)| match w.due {
                Some(d) if d <= now => Some((d, WorkId(i as u16))),
                _ => None,
            })
            .collect();
        due.sort_unstable();
        for (_, work) in due {
            if let Some(queue) = self.works[work.index()].target {
                self.work_enqueue(queue, work);
            }
        }
    }

    fn check_work(&mut self, queue: WorkqId, work: WorkId, op: &str) -> KResult<()> {
        let exists = queue.index() < self.workqueues.len() && work.index() < self.works.len();
        self.check_object(exists, op)
    }

    fn work_enqueue(&mut self, queue: WorkqId, work: WorkId) {
        let w = &mut self.works[work.index()];
        w.target = Some(queue);
        w.queued = true;
        w.due = None;
        let q = &mut self.workqueues[queue.index()];
        q.pending.push_back(work);
        let idle = q.idle;
        if let Some(waiter) = self.wait_queues[idle.index()].pop_front() {
            self.wake(waiter.tid, Ok(Handoff::Done));
        }
    }

    /// Next item for the workqueue thread; it stops being pending
    fn workq_next(&mut self, queue: WorkqId) -> Option<WorkId> {
        let work = self.workqueues.get_mut(queue.index())?.pending.pop_front()?;
        self.works[work.index()].queued = false;
        Some(work)
    }

    /// Park the workqueue thread until work is submitted
    fn workq_idle(&mut self, queue: WorkqId) {
        if let Err(e) = self.check_blocking("workq_idle", Timeout::Forever) {
            trace!("workq {} cannot idle: {e}", queue.0);
            return;
        }
        let idle = self.workqueues[queue.index()].idle;
        self.pend_current(Pend::WorkqIdle, Some(idle), Timeout::Forever);
    }
}
