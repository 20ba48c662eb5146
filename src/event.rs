//! Event flags
//!
//! A 32-bit flag word. Waiters ask for any or all of a mask and may consume
//! the bits they matched. Posting walks the waiters in arrival order, so a
//! consuming waiter hides the bits it took from the waiters behind it.

use alloc::vec::Vec;

use log::{debug, trace};

use crate::error::{KResult, KernelError};
use crate::kernel::{Handoff, Kernel, Wait};
use crate::poll::PollTarget;
use crate::thread::{Pend, ThreadId};
use crate::timer::Timeout;
use crate::wait_queue::{WaitOrder, WaitQueueId};

object_id!(
    /// Handle of an event object
    EventId
);

/// Wait predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// At least one bit of the mask
    Any,
    /// Every bit of the mask
    All,
}

/// Event object state
#[derive(Debug)]
pub struct Event {
    pub(crate) flags: u32,
    pub(crate) waiters: WaitQueueId,
    pub(crate) pollers: Vec<ThreadId>,
}

/// Bits of `mask` present in `flags`, if they satisfy the predicate
fn matched(flags: u32, mask: u32, match_all: bool) -> Option<u32> {
    let hit = flags & mask;
    let ok = if match_all { hit == mask } else { hit != 0 };
    ok.then_some(hit)
}

impl Kernel {
    pub fn event_init(&mut self) -> KResult<EventId> {
        let id = crate::macros::next_index(self.events.len())?;
        let waiters = self.new_wait_queue(WaitOrder::Fifo)?;
        self.events.push(Event {
            flags: 0,
            waiters,
            pollers: Vec::new(),
        });
        debug!("event {id} created");
        Ok(EventId(id))
    }

    /// OR `mask` into the flags and release satisfied waiters
    /// (interrupt-safe)
    pub fn event_post(&mut self, id: EventId, mask: u32) -> KResult<()> {
        self.check_object(id.index() < self.events.len(), "event_post")?;
        self.events[id.index()].flags |= mask;
        self.release_event_waiters(id);
        Ok(())
    }

    /// Replace the whole flag word and release satisfied waiters
    pub fn event_set(&mut self, id: EventId, flags: u32) -> KResult<()> {
        self.check_object(id.index() < self.events.len(), "event_set")?;
        self.events[id.index()].flags = flags;
        self.release_event_waiters(id);
        Ok(())
    }

    pub fn event_clear(&mut self, id: EventId, mask: u32) -> KResult<()> {
        self.check_object(id.index() < self.events.len(), "event_clear")?;
        self.events[id.index()].flags &= !mask;
        Ok(())
    }

    pub fn event_flags(&self, id: EventId) -> Option<u32> {
        self.events.get(id.index()).map(|e| e.flags)
    }

    /// Wait until the flags satisfy `mask` under `mode`; returns the
    /// matched bits and clears them first when `clear` is set
    pub fn event_wait(
        &mut self,
        id: EventId,
        mask: u32,
        mode: Match,
        clear: bool,
        timeout: Timeout,
    ) -> KResult<Wait<u32>> {
        self.check_object(id.index() < self.events.len(), "event_wait")?;
        if mask == 0 {
            return Err(self.misuse("event_wait", KernelError::InvalidState));
        }
        let match_all = mode == Match::All;
        let e = &mut self.events[id.index()];
        if let Some(hit) = matched(e.flags, mask, match_all) {
            if clear {
                e.flags &= !hit;
            }
            return Ok(Wait::Ready(hit));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("event_wait", timeout)?;
        let waiters = self.events[id.index()].waiters;
        self.pend_current(
            Pend::EventWait {
                mask,
                match_all,
                clear,
            },
            Some(waiters),
            timeout,
        );
        Ok(Wait::Pending)
    }

    fn release_event_waiters(&mut self, id: EventId) {
        let waiters = self.events[id.index()].waiters;
        for tid in self.waiters(waiters) {
            let Some(Pend::EventWait {
                mask,
                match_all,
                clear,
            }) = self.threads[tid.index()].pend
            else {
                continue;
            };
            let e = &mut self.events[id.index()];
            let Some(hit) = matched(e.flags, mask, match_all) else {
                continue;
            };
            if clear {
                e.flags &= !hit;
            }
            trace!("event {}: {tid} released with {hit:#x}", id.0);
            self.wait_queues[waiters.index()].remove(tid);
            self.wake(tid, Ok(Handoff::Events(hit)));
        }
        self.poll_notify(PollTarget::Event(id));
        self.reschedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{Priority, ThreadSpec};

    fn spawn(k: &mut Kernel, name: &[u8], prio: i8) -> ThreadId {
        k.spawn_with(ThreadSpec::new(name, Priority(prio))).unwrap()
    }

    #[test]
    fn test_post_is_idempotent() {
        let mut k = Kernel::testing();
        let e = k.event_init().unwrap();
        k.event_post(e, 0b0110).unwrap();
        let once = k.event_flags(e);
        k.event_post(e, 0b0110).unwrap();
        assert_eq!(k.event_flags(e), once);
    }

    #[test]
    fn test_set_and_clear() {
        let mut k = Kernel::testing();
        let e = k.event_init().unwrap();
        k.event_set(e, 0xF0).unwrap();
        k.event_clear(e, 0x30).unwrap();
        assert_eq!(k.event_flags(e), Some(0xC0));
    }

    #[test]
    fn test_wait_any_immediate() {
        let mut k = Kernel::testing();
        let e = k.event_init().unwrap();
        k.event_post(e, 0b101).unwrap();
        assert_eq!(k.event_wait(e, 0b100, Match::Any, true, Timeout::NoWait), Ok(Wait::Ready(0b100)));
        assert_eq!(k.event_flags(e), Some(0b001));
        assert_eq!(
            k.event_wait(e, 0b110, Match::All, false, Timeout::NoWait),
            Err(KernelError::WouldBlock)
        );
    }

    #[test]
    fn test_all_waiter_needs_every_bit() {
        let mut k = Kernel::testing();
        let e = k.event_init().unwrap();
        let w = spawn(&mut k, b"w", 3);
        k.event_wait(e, 0b11, Match::All, false, Timeout::Forever).unwrap();
        k.event_post(e, 0b01).unwrap();
        assert_eq!(k.thread_state(w), Some(crate::thread::ThreadState::Blocked));
        k.event_post(e, 0b10).unwrap();
        assert_eq!(k.current(), w);
        assert_eq!(k.take_wakeup(w), Some(Ok(Handoff::Events(0b11))));
    }

    #[test]
    fn test_clear_hides_bits_from_later_waiters() {
        let mut k = Kernel::testing();
        let e = k.event_init().unwrap();
        let first = spawn(&mut k, b"first", 3);
        k.event_wait(e, 0b1, Match::Any, true, Timeout::Forever).unwrap();
        let second = spawn(&mut k, b"second", 3);
        k.event_wait(e, 0b1, Match::Any, false, Timeout::Forever).unwrap();
        k.event_post(e, 0b1).unwrap();
        assert_eq!(k.take_wakeup(first), Some(Ok(Handoff::Events(0b1))));
        assert_eq!(k.thread_state(second), Some(crate::thread::ThreadState::Blocked));
        assert_eq!(k.event_flags(e), Some(0));
    }

    #[test]
    fn test_zero_mask_rejected() {
        let mut k = Kernel::testing();
        let e = k.event_init().unwrap();
        assert_eq!(
            k.event_wait(e, 0, Match::Any, false, Timeout::NoWait),
            Err(KernelError::InvalidState)
        );
    }
}
