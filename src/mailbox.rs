//! Mailbox: synchronous message exchange
//!
//! No buffering. A sender waits until a compatible receiver takes its
//! message and a receiver waits until a compatible sender shows up. Each
//! side may name the peer it will accept.

use alloc::vec::Vec;

use log::{debug, trace};

use crate::error::{KResult, KernelError};
use crate::kernel::{Handoff, Kernel, Wait};
use crate::thread::{Pend, ThreadId};
use crate::timer::Timeout;
use crate::wait_queue::{WaitOrder, WaitQueueId};

object_id!(
    /// Handle of a mailbox
    MailboxId
);

/// Peer filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Any,
    Thread(ThreadId),
}

impl Target {
    pub fn accepts(self, tid: ThreadId) -> bool {
        match self {
            Target::Any => true,
            Target::Thread(t) => t == tid,
        }
    }
}

/// Mailbox message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Application-defined word
    pub info: u32,
    /// Payload
    pub data: Vec<u8>,
    /// Receiver the sender will accept
    pub target: Target,
    /// Sending thread, filled in on delivery
    pub source: Option<ThreadId>,
}

impl Message {
    pub fn new(info: u32, data: Vec<u8>) -> Self {
        Self {
            info,
            data,
            target: Target::Any,
            source: None,
        }
    }

    pub fn to(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}

#[derive(Debug)]
pub struct Mailbox {
    /// Senders waiting for a receiver
    pub(crate) tx: WaitQueueId,
    /// Receivers waiting for a sender
    pub(crate) rx: WaitQueueId,
}

impl Kernel {
    pub fn mailbox_init(&mut self) -> KResult<MailboxId> {
        let id = crate::macros::next_index(self.mailboxes.len())?;
        let tx = self.new_wait_queue(WaitOrder::Fifo)?;
        let rx = self.new_wait_queue(WaitOrder::Fifo)?;
        self.mailboxes.push(Mailbox { tx, rx });
        debug!("mailbox {id} created");
        Ok(MailboxId(id))
    }

    /// Send `message` and wait until a receiver has taken it
    pub fn mailbox_send(
        &mut self,
        id: MailboxId,
        mut message: Message,
        timeout: Timeout,
    ) -> KResult<Wait<()>> {
        self.check_object(id.index() < self.mailboxes.len(), "mailbox_send")?;
        self.require_thread_context("mailbox_send")?;
        let cur = self.current();
        let rx = self.mailboxes[id.index()].rx;

        let receiver = self.waiters(rx).into_iter().find(|&r| {
            message.target.accepts(r)
                && matches!(
                    self.threads[r.index()].pend,
                    Some(Pend::MailboxReceive { source }) if source.accepts(cur)
                )
        });
        if let Some(r) = receiver {
            self.wait_queues[rx.index()].remove(r);
            message.source = Some(cur);
            trace!("mailbox {}: {cur} -> {r}", id.0);
            self.wake(r, Ok(Handoff::Message(message)));
            self.reschedule();
            return Ok(Wait::Ready(()));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("mailbox_send", timeout)?;
        let tx = self.mailboxes[id.index()].tx;
        self.pend_current(Pend::MailboxSend { message }, Some(tx), timeout);
        Ok(Wait::Pending)
    }

    /// Receive a message from a sender matching `source`
    pub fn mailbox_receive(
        &mut self,
        id: MailboxId,
        source: Target,
        timeout: Timeout,
    ) -> KResult<Wait<Message>> {
        self.check_object(id.index() < self.mailboxes.len(), "mailbox_receive")?;
        self.require_thread_context("mailbox_receive")?;
        let cur = self.current();
        let tx = self.mailboxes[id.index()].tx;

        let sender = self.waiters(tx).into_iter().find(|&s| {
            source.accepts(s)
                && matches!(
                    &self.threads[s.index()].pend,
                    Some(Pend::MailboxSend { message }) if message.target.accepts(cur)
                )
        });
        if let Some(s) = sender {
            self.wait_queues[tx.index()].remove(s);
            let Some(Pend::MailboxSend { mut message }) = self.threads[s.index()].pend.take() else {
                return Err(self.misuse("mailbox_receive", KernelError::InvalidState));
            };
            message.source = Some(s);
            trace!("mailbox {}: {s} -> {cur}", id.0);
            self.wake(s, Ok(Handoff::Done));
            self.reschedule();
            return Ok(Wait::Ready(message));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("mailbox_receive", timeout)?;
        let rx = self.mailboxes[id.index()].rx;
        self.pend_current(Pend::MailboxReceive { source }, Some(rx), timeout);
        Ok(Wait::Pending)
    }
}
