//! FIFO and LIFO queues of caller-owned buffers
//!
//! Buffers move by ownership: `queue_put` takes the `Vec`, `queue_get`
//! gives the same allocation back. Nothing is copied and `put` never blocks.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use log::{debug, warn};

use crate::error::{KResult, KernelError};
use crate::kernel::{Handoff, Kernel, Wait};
use crate::poll::PollTarget;
use crate::thread::{Pend, ThreadId};
use crate::timer::Timeout;
use crate::wait_queue::{WaitOrder, WaitQueueId};

object_id!(
    /// Handle of a FIFO or LIFO queue
    QueueId
);

/// Retrieval order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Oldest buffer first
    Fifo,
    /// Newest buffer first
    Lifo,
}

/// Queue state
#[derive(Debug)]
pub struct Queue {
    pub(crate) kind: QueueKind,
    /// Buffers in retrieval order
    pub(crate) items: VecDeque<Vec<u8>>,
    /// Consumers waiting for a buffer
    pub(crate) waiters: WaitQueueId,
    pub(crate) pollers: Vec<ThreadId>,
}

impl Kernel {
    pub fn queue_init(&mut self, kind: QueueKind) -> KResult<QueueId> {
        let id = crate::macros::next_index(self.queues.len())?;
        let waiters = self.new_wait_queue(WaitOrder::Fifo)?;
        self.queues.push(Queue {
            kind,
            items: VecDeque::new(),
            waiters,
            pollers: Vec::new(),
        });
        debug!("{kind:?} queue {id} created");
        Ok(QueueId(id))
    }

    pub fn fifo_init(&mut self) -> KResult<QueueId> {
        self.queue_init(QueueKind::Fifo)
    }

    pub fn lifo_init(&mut self) -> KResult<QueueId> {
        self.queue_init(QueueKind::Lifo)
    }

    /// Hand a buffer to the queue (interrupt-safe, never blocks)
    pub fn queue_put(&mut self, id: QueueId, buf: Vec<u8>) -> KResult<()> {
        self.check_object(id.index() < self.queues.len(), "queue_put")?;
        let waiters = self.queues[id.index()].waiters;
        if let Some(w) = self.wait_queues[waiters.index()].pop_front() {
            self.wake(w.tid, Ok(Handoff::Data(buf)));
            self.reschedule();
            return Ok(());
        }
        let q = &mut self.queues[id.index()];
        match q.kind {
            QueueKind::Fifo => q.items.push_back(buf),
            QueueKind::Lifo => q.items.push_front(buf),
        }
        self.poll_notify(PollTarget::Queue(id));
        self.reschedule();
        Ok(())
    }

    /// Take the next buffer, waiting up to `timeout` for one
    pub fn queue_get(&mut self, id: QueueId, timeout: Timeout) -> KResult<Wait<Vec<u8>>> {
        self.check_object(id.index() < self.queues.len(), "queue_get")?;
        if let Some(buf) = self.queues[id.index()].items.pop_front() {
            return Ok(Wait::Ready(buf));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("queue_get", timeout)?;
        let waiters = self.queues[id.index()].waiters;
        self.pend_current(Pend::QueueGet, Some(waiters), timeout);
        Ok(Wait::Pending)
    }

    /// Release the first waiting consumer (and any pollers) empty-handed
    pub fn queue_cancel_wait(&mut self, id: QueueId) -> KResult<()> {
        self.check_object(id.index() < self.queues.len(), "queue_cancel_wait")?;
        let waiters = self.queues[id.index()].waiters;
        if let Some(w) = self.wait_queues[waiters.index()].pop_front() {
            warn!("queue {}: wait of {} cancelled", id.0, w.tid);
            self.wake(w.tid, Err(KernelError::Cancelled));
        }
        self.poll_cancel(id);
        self.reschedule();
        Ok(())
    }

    pub fn queue_is_empty(&self, id: QueueId) -> Option<bool> {
        self.queues.get(id.index()).map(|q| q.items.is_empty())
    }

    pub fn queue_len(&self, id: QueueId) -> Option<usize> {
        self.queues.get(id.index()).map(|q| q.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use crate::thread::{Priority, ThreadSpec};

    #[test]
    fn test_fifo_order() {
        let mut k = Kernel::testing();
        let q = k.fifo_init().unwrap();
        k.queue_put(q, vec![1]).unwrap();
        k.queue_put(q, vec![2]).unwrap();
        k.queue_put(q, vec![3]).unwrap();
        assert_eq!(k.queue_len(q), Some(3));
        assert_eq!(k.queue_get(q, Timeout::NoWait), Ok(Wait::Ready(vec![1])));
        assert_eq!(k.queue_get(q, Timeout::NoWait), Ok(Wait::Ready(vec![2])));
        assert_eq!(k.queue_get(q, Timeout::NoWait), Ok(Wait::Ready(vec![3])));
        assert_eq!(k.queue_is_empty(q), Some(true));
    }

    #[test]
    fn test_lifo_order() {
        let mut k = Kernel::testing();
        let q = k.lifo_init().unwrap();
        k.queue_put(q, vec![1]).unwrap();
        k.queue_put(q, vec![2]).unwrap();
        assert_eq!(k.queue_get(q, Timeout::NoWait), Ok(Wait::Ready(vec![2])));
        assert_eq!(k.queue_get(q, Timeout::NoWait), Ok(Wait::Ready(vec![1])));
        assert_eq!(k.queue_get(q, Timeout::NoWait), Err(KernelError::WouldBlock));
    }

    #[test]
    fn test_buffer_moves_without_copy() {
        let mut k = Kernel::testing();
        let q = k.fifo_init().unwrap();
        let buf = vec![0xAAu8; 64];
        let ptr = buf.as_ptr();
        k.queue_put(q, buf).unwrap();
        let back = k.queue_get(q, Timeout::NoWait).unwrap().ready().unwrap();
        assert_eq!(back.as_ptr(), ptr);
    }

    #[test]
    fn test_put_from_isr_wakes_consumer() {
        let mut k = Kernel::testing();
        let q = k.fifo_init().unwrap();
        let c = k.spawn_with(ThreadSpec::new(b"consumer", Priority(3))).unwrap();
        k.queue_get(q, Timeout::Forever).unwrap();
        k.irq_enter();
        k.queue_put(q, vec![5, 5]).unwrap();
        assert_eq!(k.current(), crate::thread::ThreadId::IDLE);
        k.irq_exit().unwrap();
        assert_eq!(k.current(), c);
        assert_eq!(k.take_wakeup(c), Some(Ok(Handoff::Data(vec![5, 5]))));
        assert_eq!(k.queue_len(q), Some(0));
    }

    #[test]
    fn test_cancel_wait() {
        let mut k = Kernel::testing();
        let q = k.fifo_init().unwrap();
        let c = k.spawn_with(ThreadSpec::new(b"consumer", Priority(3))).unwrap();
        k.queue_get(q, Timeout::Forever).unwrap();
        k.queue_cancel_wait(q).unwrap();
        assert_eq!(k.current(), c);
        assert_eq!(k.take_wakeup(c), Some(Err(KernelError::Cancelled)));
    }
}
