//! Message queue
//!
//! Fixed-size items copied into a ring of fixed-size slots. Writers block
//! while the ring is full, readers while it is empty. A put that finds a
//! waiting reader hands the item over directly; a get that frees a slot
//! refills it at once from the longest-waiting writer, so FIFO order holds
//! across blocked and buffered items.

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, warn};

use crate::error::{KResult, KernelError};
use crate::kernel::{Handoff, Kernel, Wait};
use crate::poll::PollTarget;
use crate::thread::{Pend, ThreadId};
use crate::timer::Timeout;
use crate::wait_queue::{WaitOrder, WaitQueueId};

object_id!(
    /// Handle of a message queue
    MsgqId
);

/// Ring of `capacity` slots of `item_size` bytes
///
/// One flat allocation; no slot is reserved, fullness comes from `used`.
#[derive(Debug)]
pub struct SlotRing {
    /// Slot storage
    buffer: Vec<u8>,
    /// Bytes per slot
    item_size: usize,
    /// Number of slots
    capacity: usize,
    /// Next slot to read
    read_idx: usize,
    /// Next slot to write
    write_idx: usize,
    /// Occupied slots
    used: usize,
}

impl SlotRing {
    pub fn new(item_size: usize, capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; item_size * capacity],
            item_size,
            capacity,
            read_idx: 0,
            write_idx: 0,
            used: 0,
        }
    }

    /// Copy an item into the next free slot.
    ///
    /// Returns false if the ring is full.
    pub fn push(&mut self, item: &[u8]) -> bool {
        if self.is_full() {
            return false;
        }
        let start = self.write_idx * self.item_size;
        self.buffer[start..start + self.item_size].copy_from_slice(item);
        self.write_idx = (self.write_idx + 1) % self.capacity;
        self.used += 1;
        true
    }

    /// Copy the oldest item out and free its slot
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let item = self.peek()?;
        self.read_idx = (self.read_idx + 1) % self.capacity;
        self.used -= 1;
        Some(item)
    }

    /// Copy the oldest item out, leaving it queued
    pub fn peek(&self) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        let start = self.read_idx * self.item_size;
        Some(self.buffer[start..start + self.item_size].to_vec())
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
        self.used = 0;
    }
}

/// Message queue state
#[derive(Debug)]
pub struct Msgq {
    pub(crate) ring: SlotRing,
    /// Writers blocked on a full ring
    pub(crate) writers: WaitQueueId,
    /// Readers blocked on an empty ring
    pub(crate) readers: WaitQueueId,
    pub(crate) pollers: Vec<ThreadId>,
}

impl Kernel {
    pub fn msgq_init(&mut self, item_size: usize, capacity: usize) -> KResult<MsgqId> {
        if item_size == 0 || capacity == 0 {
            return Err(self.misuse("msgq_init", KernelError::InvalidState));
        }
        let id = crate::macros::next_index(self.msgqs.len())?;
        let writers = self.new_wait_queue(WaitOrder::Fifo)?;
        let readers = self.new_wait_queue(WaitOrder::Fifo)?;
        self.msgqs.push(Msgq {
            ring: SlotRing::new(item_size, capacity),
            writers,
            readers,
            pollers: Vec::new(),
        });
        debug!("msgq {id} created ({capacity} x {item_size} bytes)");
        Ok(MsgqId(id))
    }

    /// Enqueue a copy of `item`, waiting up to `timeout` for space.
    ///
    /// Interrupt-safe with `NoWait`.
    pub fn msgq_put(&mut self, id: MsgqId, item: &[u8], timeout: Timeout) -> KResult<Wait<()>> {
        self.check_object(id.index() < self.msgqs.len(), "msgq_put")?;
        if item.len() != self.msgqs[id.index()].ring.item_size() {
            return Err(self.misuse("msgq_put", KernelError::InvalidState));
        }
        let q = &mut self.msgqs[id.index()];
        let readers = q.readers;
        if let Some(w) = self.wait_queues[readers.index()].pop_front() {
            self.wake(w.tid, Ok(Handoff::Data(item.to_vec())));
            self.reschedule();
            return Ok(Wait::Ready(()));
        }
        if q.ring.push(item) {
            self.poll_notify(PollTarget::Msgq(id));
            self.reschedule();
            return Ok(Wait::Ready(()));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("msgq_put", timeout)?;
        let writers = self.msgqs[id.index()].writers;
        self.pend_current(
            Pend::MsgqPut {
                item: item.to_vec(),
            },
            Some(writers),
            timeout,
        );
        Ok(Wait::Pending)
    }

    /// Dequeue the oldest item, waiting up to `timeout` for one
    pub fn msgq_get(&mut self, id: MsgqId, timeout: Timeout) -> KResult<Wait<Vec<u8>>> {
        self.check_object(id.index() < self.msgqs.len(), "msgq_get")?;
        let q = &mut self.msgqs[id.index()];
        if let Some(item) = q.ring.pop() {
            let writers = q.writers;
            if let Some(w) = self.wait_queues[writers.index()].pop_front() {
                if let Some(Pend::MsgqPut { item: queued }) = self.threads[w.tid.index()].pend.take()
                {
                    self.msgqs[id.index()].ring.push(&queued);
                }
                self.wake(w.tid, Ok(Handoff::Done));
                self.reschedule();
            }
            return Ok(Wait::Ready(item));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("msgq_get", timeout)?;
        let readers = self.msgqs[id.index()].readers;
        self.pend_current(Pend::MsgqGet, Some(readers), timeout);
        Ok(Wait::Pending)
    }

    /// Copy of the oldest item without removing it
    pub fn msgq_peek(&mut self, id: MsgqId) -> KResult<Vec<u8>> {
        self.check_object(id.index() < self.msgqs.len(), "msgq_peek")?;
        self.msgqs[id.index()]
            .ring
            .peek()
            .ok_or(KernelError::WouldBlock)
    }

    /// Discard every queued item; blocked writers are cancelled
    pub fn msgq_purge(&mut self, id: MsgqId) -> KResult<()> {
        self.check_object(id.index() < self.msgqs.len(), "msgq_purge")?;
        let q = &mut self.msgqs[id.index()];
        q.ring.clear();
        let writers = q.writers;
        let mut cancelled = 0;
        while let Some(w) = self.wait_queues[writers.index()].pop_front() {
            self.wake(w.tid, Err(KernelError::Cancelled));
            cancelled += 1;
        }
        if cancelled > 0 {
            warn!("msgq {}: purge cancelled {cancelled} writer(s)", id.0);
        }
        self.reschedule();
        Ok(())
    }

    pub fn msgq_num_used(&self, id: MsgqId) -> Option<usize> {
        self.msgqs.get(id.index()).map(|q| q.ring.len())
    }

    pub fn msgq_num_free(&self, id: MsgqId) -> Option<usize> {
        self.msgqs
            .get(id.index())
            .map(|q| q.ring.capacity() - q.ring.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{Priority, ThreadSpec};

    #[test]
    fn test_ring_push_pop() {
        let mut ring = SlotRing::new(2, 3);
        assert!(ring.is_empty());
        assert!(ring.push(&[1, 2]));
        assert!(ring.push(&[3, 4]));
        assert!(ring.push(&[5, 6]));
        assert!(ring.is_full());
        assert!(!ring.push(&[7, 8]));
        assert_eq!(ring.pop(), Some(vec![1, 2]));
        assert!(ring.push(&[7, 8]));
        assert_eq!(ring.pop(), Some(vec![3, 4]));
        assert_eq!(ring.pop(), Some(vec![5, 6]));
        assert_eq!(ring.peek(), Some(vec![7, 8]));
        assert_eq!(ring.pop(), Some(vec![7, 8]));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_ring_clear() {
        let mut ring = SlotRing::new(1, 4);
        ring.push(&[9]);
        ring.push(&[9]);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn test_put_get_fifo() {
        let mut k = Kernel::testing();
        let q = k.msgq_init(4, 3).unwrap();
        k.msgq_put(q, &1u32.to_le_bytes(), Timeout::NoWait).unwrap();
        k.msgq_put(q, &2u32.to_le_bytes(), Timeout::NoWait).unwrap();
        assert_eq!(k.msgq_num_used(q), Some(2));
        assert_eq!(k.msgq_num_free(q), Some(1));
        assert_eq!(k.msgq_peek(q), Ok(1u32.to_le_bytes().to_vec()));
        assert_eq!(k.msgq_get(q, Timeout::NoWait), Ok(Wait::Ready(1u32.to_le_bytes().to_vec())));
        assert_eq!(k.msgq_get(q, Timeout::NoWait), Ok(Wait::Ready(2u32.to_le_bytes().to_vec())));
        assert_eq!(k.msgq_get(q, Timeout::NoWait), Err(KernelError::WouldBlock));
        assert_eq!(k.msgq_peek(q), Err(KernelError::WouldBlock));
    }

    #[test]
    fn test_wrong_item_size() {
        let mut k = Kernel::testing();
        let q = k.msgq_init(4, 2).unwrap();
        assert_eq!(k.msgq_put(q, &[1, 2], Timeout::NoWait), Err(KernelError::InvalidState));
        assert_eq!(k.msgq_num_used(q), Some(0));
    }

    #[test]
    fn test_put_hands_to_waiting_reader() {
        let mut k = Kernel::testing();
        let q = k.msgq_init(2, 1).unwrap();
        let r = k.spawn_with(ThreadSpec::new(b"reader", Priority(2))).unwrap();
        assert!(k.msgq_get(q, Timeout::Forever).unwrap().is_pending());
        k.msgq_put(q, &[7, 7], Timeout::NoWait).unwrap();
        assert_eq!(k.current(), r);
        assert_eq!(k.take_wakeup(r), Some(Ok(Handoff::Data(vec![7, 7]))));
        assert_eq!(k.msgq_num_used(q), Some(0));
    }

    #[test]
    fn test_get_refills_from_blocked_writer() {
        let mut k = Kernel::testing();
        let q = k.msgq_init(1, 1).unwrap();
        k.msgq_put(q, &[1], Timeout::NoWait).unwrap();
        let w = k.spawn_with(ThreadSpec::new(b"writer", Priority(4))).unwrap();
        assert!(k.msgq_put(q, &[2], Timeout::Forever).unwrap().is_pending());
        assert_eq!(k.msgq_get(q, Timeout::NoWait), Ok(Wait::Ready(vec![1])));
        assert_eq!(k.current(), w);
        assert_eq!(k.take_wakeup(w), Some(Ok(Handoff::Done)));
        assert_eq!(k.msgq_get(q, Timeout::NoWait), Ok(Wait::Ready(vec![2])));
    }

    #[test]
    fn test_purge_cancels_writers() {
        let mut k = Kernel::testing();
        let q = k.msgq_init(1, 1).unwrap();
        k.msgq_put(q, &[1], Timeout::NoWait).unwrap();
        let w = k.spawn_with(ThreadSpec::new(b"writer", Priority(4))).unwrap();
        k.msgq_put(q, &[2], Timeout::Forever).unwrap();
        k.msgq_purge(q).unwrap();
        assert_eq!(k.msgq_num_used(q), Some(0));
        assert_eq!(k.take_wakeup(w), Some(Err(KernelError::Cancelled)));
    }

    #[test]
    fn test_put_timeout_leaves_queue_unchanged() {
        let mut k = Kernel::testing();
        let q = k.msgq_init(1, 1).unwrap();
        k.msgq_put(q, &[1], Timeout::NoWait).unwrap();
        let w = k.spawn_with(ThreadSpec::new(b"writer", Priority(4))).unwrap();
        k.msgq_put(q, &[2], Timeout::Ticks(5)).unwrap();
        for _ in 0..5 {
            k.on_tick();
        }
        assert_eq!(k.take_wakeup(w), Some(Err(KernelError::TimedOut)));
        assert_eq!(k.msgq_num_used(q), Some(1));
        assert_eq!(k.msgq_peek(q), Ok(vec![1]));
    }
}
