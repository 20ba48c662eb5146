//! Poll: wait for any of several objects to become ready
//!
//! A polling thread is not queued on any wait queue. It registers itself in
//! the poller list of each object it watches; whenever one of those objects
//! gains something (a semaphore unit, a queued item, posted event bits) the
//! kernel re-evaluates the poller's whole event set and wakes it if anything
//! is ready. Polling reports readiness only and never consumes.

use alloc::vec::Vec;

use bitflags::bitflags;
use log::trace;

use crate::config::MAX_POLL_EVENTS;
use crate::error::{KResult, KernelError};
use crate::event::EventId;
use crate::kernel::{Handoff, Kernel, Wait};
use crate::msgq::MsgqId;
use crate::queue::QueueId;
use crate::semaphore::SemId;
use crate::thread::{Pend, ThreadId};
use crate::timer::Timeout;

/// One condition in a poll set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// The semaphore count is non-zero
    SemAvailable(SemId),
    /// The message queue holds at least one item
    MsgqNotEmpty(MsgqId),
    /// The FIFO/LIFO holds at least one buffer
    QueueNotEmpty(QueueId),
    /// Any bit of `mask` is set in the event object
    Events { event: EventId, mask: u32 },
}

bitflags! {
    /// Readiness reported for one poll event
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollState: u8 {
        const SEM_AVAILABLE = 1 << 0;
        const MSGQ_DATA_AVAILABLE = 1 << 1;
        const QUEUE_DATA_AVAILABLE = 1 << 2;
        const EVENTS_POSTED = 1 << 3;
        /// A wait on the queue was cancelled
        const CANCELLED = 1 << 4;
    }
}

/// Object whose readiness changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollTarget {
    Sem(SemId),
    Msgq(MsgqId),
    Queue(QueueId),
    Event(EventId),
}

impl PollEvent {
    fn target(self) -> PollTarget {
        match self {
            PollEvent::SemAvailable(id) => PollTarget::Sem(id),
            PollEvent::MsgqNotEmpty(id) => PollTarget::Msgq(id),
            PollEvent::QueueNotEmpty(id) => PollTarget::Queue(id),
            PollEvent::Events { event, .. } => PollTarget::Event(event),
        }
    }
}

impl Kernel {
    /// Wait until at least one event in `events` is ready.
    ///
    /// Returns one [`PollState`] per event, in the order given.
    pub fn poll(&mut self, events: &[PollEvent], timeout: Timeout) -> KResult<Wait<Vec<PollState>>> {
        if events.is_empty() || events.len() > MAX_POLL_EVENTS {
            return Err(self.misuse("poll", KernelError::InvalidState));
        }
        for ev in events {
            let exists = self.poller_list(ev.target()).is_some();
            self.check_object(exists, "poll")?;
        }
        let states = self.poll_states(events);
        if states.iter().any(|s| !s.is_empty()) {
            return Ok(Wait::Ready(states));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("poll", timeout)?;

        let cur = self.current();
        for ev in events {
            if let Some(list) = self.poller_list(ev.target()) {
                if !list.contains(&cur) {
                    list.push(cur);
                }
            }
        }
        self.pend_current(Pend::Poll(events.to_vec()), None, timeout);
        Ok(Wait::Pending)
    }

    fn poller_list(&mut self, target: PollTarget) -> Option<&mut Vec<ThreadId>> {
        match target {
            PollTarget::Sem(id) => self.semaphores.get_mut(id.index()).map(|o| &mut o.pollers),
            PollTarget::Msgq(id) => self.msgqs.get_mut(id.index()).map(|o| &mut o.pollers),
            PollTarget::Queue(id) => self.queues.get_mut(id.index()).map(|o| &mut o.pollers),
            PollTarget::Event(id) => self.events.get_mut(id.index()).map(|o| &mut o.pollers),
        }
    }

    fn poll_state(&self, ev: PollEvent) -> PollState {
        let ready = match ev {
            PollEvent::SemAvailable(id) => self.semaphores[id.index()].count > 0,
            PollEvent::MsgqNotEmpty(id) => !self.msgqs[id.index()].ring.is_empty(),
            PollEvent::QueueNotEmpty(id) => !self.queues[id.index()].items.is_empty(),
            PollEvent::Events { event, mask } => self.events[event.index()].flags & mask != 0,
        };
        if !ready {
            return PollState::empty();
        }
        match ev {
            PollEvent::SemAvailable(_) => PollState::SEM_AVAILABLE,
            PollEvent::MsgqNotEmpty(_) => PollState::MSGQ_DATA_AVAILABLE,
            PollEvent::QueueNotEmpty(_) => PollState::QUEUE_DATA_AVAILABLE,
            PollEvent::Events { .. } => PollState::EVENTS_POSTED,
        }
    }

    fn poll_states(&self, events: &[PollEvent]) -> Vec<PollState> {
        events.iter().map(|&ev| self.poll_state(ev)).collect()
    }

    /// Re-evaluate every thread polling `target`
    pub(crate) fn poll_notify(&mut self, target: PollTarget) {
        self.poll_signal(target, PollState::empty());
    }

    /// Release every thread polling a queue, flagging that queue `CANCELLED`
    pub(crate) fn poll_cancel(&mut self, queue: QueueId) {
        self.poll_signal(PollTarget::Queue(queue), PollState::CANCELLED);
    }

    fn poll_signal(&mut self, target: PollTarget, extra: PollState) {
        let pollers = match self.poller_list(target) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return,
        };
        for tid in pollers {
            let Some(Pend::Poll(events)) = &self.threads[tid.index()].pend else {
                continue;
            };
            let events = events.clone();
            let mut states = self.poll_states(&events);
            for (state, ev) in states.iter_mut().zip(&events) {
                if ev.target() == target {
                    *state |= extra;
                }
            }
            if states.iter().all(|s| s.is_empty()) {
                continue;
            }
            trace!("poll: {tid} ready");
            self.poll_unregister(tid, &events);
            self.wake(tid, Ok(Handoff::Polled(states)));
        }
    }

    /// Drop a thread from the poller lists of every object in `events`
    pub(crate) fn poll_unregister(&mut self, tid: ThreadId, events: &[PollEvent]) {
        for ev in events {
            if let Some(list) = self.poller_list(ev.target()) {
                list.retain(|&t| t != tid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use crate::queue::QueueKind;
    use crate::thread::{Priority, ThreadSpec};

    #[test]
    fn test_ready_without_blocking() {
        let mut k = Kernel::testing();
        let s = k.sem_init(1, 1).unwrap();
        let q = k.fifo_init().unwrap();
        let states = k
            .poll(&[PollEvent::SemAvailable(s), PollEvent::QueueNotEmpty(q)], Timeout::NoWait)
            .unwrap()
            .ready()
            .unwrap();
        assert_eq!(states, vec![PollState::SEM_AVAILABLE, PollState::empty()]);
        // polling does not consume
        assert_eq!(k.sem_count(s), Some(1));
    }

    #[test]
    fn test_nothing_ready_no_wait() {
        let mut k = Kernel::testing();
        let e = k.event_init().unwrap();
        let r = k.poll(&[PollEvent::Events { event: e, mask: 0x1 }], Timeout::NoWait);
        assert_eq!(r, Err(KernelError::WouldBlock));
    }

    #[test]
    fn test_bad_sets_rejected() {
        let mut k = Kernel::testing();
        assert_eq!(k.poll(&[], Timeout::NoWait), Err(KernelError::InvalidState));
        let s = k.sem_init(0, 1).unwrap();
        let many = vec![PollEvent::SemAvailable(s); MAX_POLL_EVENTS + 1];
        assert_eq!(k.poll(&many, Timeout::NoWait), Err(KernelError::InvalidState));
        let bogus = PollEvent::MsgqNotEmpty(MsgqId(9));
        assert_eq!(k.poll(&[bogus], Timeout::NoWait), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_woken_by_msgq_put() {
        let mut k = Kernel::testing();
        let q = k.msgq_init(1, 4).unwrap();
        let s = k.sem_init(0, 1).unwrap();
        let p = k.spawn_with(ThreadSpec::new(b"poller", Priority(2))).unwrap();
        let set = [PollEvent::SemAvailable(s), PollEvent::MsgqNotEmpty(q)];
        assert!(k.poll(&set, Timeout::Forever).unwrap().is_pending());
        k.msgq_put(q, &[1], Timeout::NoWait).unwrap();
        assert_eq!(k.current(), p);
        let states = k.take_wakeup(p).unwrap().unwrap().into_polled().unwrap();
        assert_eq!(states, vec![PollState::empty(), PollState::MSGQ_DATA_AVAILABLE]);
        assert!(k.semaphores[s.index()].pollers.is_empty());
        assert!(k.msgqs[q.index()].pollers.is_empty());
        assert_eq!(k.msgq_num_used(q), Some(1));
    }

    #[test]
    fn test_poll_timeout_unregisters() {
        let mut k = Kernel::testing();
        let e = k.event_init().unwrap();
        let p = k.spawn_with(ThreadSpec::new(b"poller", Priority(2))).unwrap();
        k.poll(&[PollEvent::Events { event: e, mask: 0x4 }], Timeout::Ticks(2)).unwrap();
        k.on_tick();
        k.on_tick();
        assert_eq!(k.take_wakeup(p), Some(Err(KernelError::TimedOut)));
        assert!(k.events[e.index()].pollers.is_empty());
    }

    #[test]
    fn test_cancelled_queue() {
        let mut k = Kernel::testing();
        let q = k.queue_init(QueueKind::Fifo).unwrap();
        let p = k.spawn_with(ThreadSpec::new(b"poller", Priority(2))).unwrap();
        k.poll(&[PollEvent::QueueNotEmpty(q)], Timeout::Forever).unwrap();
        k.queue_cancel_wait(q).unwrap();
        assert_eq!(k.current(), p);
        let states = k.take_wakeup(p).unwrap().unwrap().into_polled().unwrap();
        assert_eq!(states, vec![PollState::CANCELLED]);
    }

    #[test]
    fn test_event_bits_wake_poller() {
        let mut k = Kernel::testing();
        let e = k.event_init().unwrap();
        let p = k.spawn_with(ThreadSpec::new(b"poller", Priority(2))).unwrap();
        k.poll(&[PollEvent::Events { event: e, mask: 0x4 }], Timeout::Forever).unwrap();
        k.event_post(e, 0x1).unwrap();
        assert_eq!(k.current(), crate::thread::ThreadId::IDLE);
        k.event_post(e, 0x4).unwrap();
        assert_eq!(k.current(), p);
        assert_eq!(
            k.take_wakeup(p),
            Some(Ok(Handoff::Polled(vec![PollState::EVENTS_POSTED])))
        );
    }
}
