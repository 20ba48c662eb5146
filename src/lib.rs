//! rtkernel: preemptive real-time kernel core
//!
//! Priority-based preemptive scheduling with cooperative threads, time
//! slicing and a tick-driven timeout engine, plus the usual synchronization
//! and IPC objects built on one wait-queue abstraction:
//! - Threads with 16 cooperative and 16 preemptive priority levels
//! - Mutexes with transitive priority inheritance
//! - Counting semaphores, condition variables, event flags
//! - Message queues, FIFO/LIFO queues, synchronous mailboxes
//! - Multi-object poll, kernel timers, interrupt locks and spinlocks
//! - Fixed-block memory slabs and workqueues for deferred work
//!
//! The whole kernel is one [`Kernel`] value. Interrupts are simulated with
//! [`Kernel::irq_enter`] / [`Kernel::irq_exit`], time with
//! [`Kernel::on_tick`].

#![no_std]

extern crate alloc;

#[macro_use]
mod macros;

pub mod alarm;
pub mod atomic;
pub mod condvar;
pub mod config;
pub mod error;
pub mod event;
pub mod kernel;
pub mod mailbox;
pub mod msgq;
pub mod mutex;
pub mod poll;
pub mod queue;
pub mod scheduler;
pub mod semaphore;
pub mod slab;
pub mod spinlock;
pub mod thread;
pub mod timer;
pub mod wait_queue;
pub mod work;

pub use alarm::{AlarmFn, AlarmId};
pub use atomic::Atomic;
pub use condvar::CondvarId;
pub use config::{KernelConfig, MisusePolicy};
pub use error::{KResult, KernelError};
pub use event::{EventId, Match};
pub use kernel::{Handoff, Kernel, KernelStats, Wait, Wakeup};
pub use mailbox::{MailboxId, Message, Target};
pub use msgq::MsgqId;
pub use mutex::MutexId;
pub use poll::{PollEvent, PollState};
pub use queue::{QueueId, QueueKind};
pub use semaphore::SemId;
pub use slab::{SlabBlock, SlabId};
pub use spinlock::{IrqKey, SharedKernel, SpinKey, SpinlockId, UnlockError};
pub use thread::{Flow, Priority, ThreadEntry, ThreadId, ThreadOptions, ThreadSpec, ThreadState};
pub use timer::{SysTimer, Timeout};
pub use work::{WorkFn, WorkId, WorkqId};
