//! Threads: descriptors and lifecycle
//!
//! A thread is a slot in the kernel's fixed TCB table. Priorities are
//! signed: the negative band is cooperative (never preempted by the
//! scheduler), the non-negative band is preemptible, and lower numbers are
//! more urgent. Slot 0 holds the idle thread.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use log::{debug, warn};

use crate::config::{DEFAULT_STACK_SIZE, NUM_COOP_PRIORITIES, NUM_PREEMPT_PRIORITIES};
use crate::error::{KResult, KernelError};
use crate::kernel::{Handoff, Kernel, Wait, Wakeup};
use crate::mailbox::{Message, Target};
use crate::mutex::MutexId;
use crate::poll::PollEvent;
use crate::timer::Timeout;
use crate::wait_queue::WaitQueueId;

object_id!(
    /// Index of a thread in the TCB table
    ThreadId
);

impl ThreadId {
    /// The idle thread, always slot 0
    pub const IDLE: ThreadId = ThreadId(0);
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Thread priority (lower number = more urgent)
///
/// `-16..=-1` cooperative, `0..=15` preemptible, `16` idle only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(pub i8);

impl Priority {
    /// Most urgent cooperative priority
    pub const HIGHEST: Priority = Priority(-(NUM_COOP_PRIORITIES as i8));
    /// Least urgent priority available to application threads
    pub const LOWEST: Priority = Priority(NUM_PREEMPT_PRIORITIES as i8 - 1);
    /// Reserved for the idle thread
    pub const IDLE: Priority = Priority(NUM_PREEMPT_PRIORITIES as i8);

    /// `n`-th cooperative priority, `coop(0)` being the most urgent
    pub const fn coop(n: u8) -> Priority {
        Priority(n as i8 - NUM_COOP_PRIORITIES as i8)
    }

    /// `n`-th preemptible priority
    pub const fn preempt(n: u8) -> Priority {
        Priority(n as i8)
    }

    pub const fn is_cooperative(self) -> bool {
        self.0 < 0
    }

    /// Within the range application threads may use
    pub const fn is_valid(self) -> bool {
        self.0 >= Self::HIGHEST.0 && self.0 <= Self::LOWEST.0
    }

    /// Strictly more urgent than `other`
    pub const fn is_higher_than(self, other: Priority) -> bool {
        self.0 < other.0
    }

    /// Ready-queue level (0 = most urgent)
    pub const fn level(self) -> usize {
        (self.0 as i16 + NUM_COOP_PRIORITIES as i16) as usize
    }

    pub const fn from_level(level: usize) -> Priority {
        Priority((level as i16 - NUM_COOP_PRIORITIES as i16) as i8)
    }

    /// The more urgent of two priorities
    pub fn most_urgent(self, other: Priority) -> Priority {
        if other.is_higher_than(self) {
            other
        } else {
            self
        }
    }
}

/// Thread execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Slot is empty
    Inactive,
    /// Spawned with a start delay that has not elapsed
    Created,
    /// In a ready queue
    Ready,
    /// Currently executing
    Running,
    /// Waiting on an object, a sleep, or a poll set
    Blocked,
    /// Held off the CPU until resumed
    Suspended,
    /// Returned or aborted
    Terminated,
}

bitflags! {
    /// Thread creation options
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadOptions: u8 {
        /// The thread may not be aborted
        const ESSENTIAL = 1 << 0;
    }
}

/// What an entry function wants after running one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Thread entry, run once per simulated tick while the thread is current
pub type ThreadEntry = fn(&mut Kernel) -> Flow;

/// Saved execution context
#[derive(Debug, Default)]
pub struct Context {
    /// Nominal stack size
    pub stack_size: usize,
    /// Times this thread was switched in
    pub activations: u32,
    /// Completion value of the last wait, until taken
    pub(crate) swap: Option<Wakeup>,
}

/// What a blocked thread is waiting for
#[derive(Debug)]
pub(crate) enum Pend {
    Sleep,
    Join,
    MutexLock {
        mutex: MutexId,
        /// Set when re-acquiring on behalf of a condvar wait
        relock: Option<Wakeup>,
    },
    SemTake,
    CondvarWait {
        mutex: MutexId,
    },
    MsgqPut {
        item: Vec<u8>,
    },
    MsgqGet,
    QueueGet,
    MailboxSend {
        message: Message,
    },
    MailboxReceive {
        source: Target,
    },
    EventWait {
        mask: u32,
        match_all: bool,
        clear: bool,
    },
    Poll(Vec<PollEvent>),
    AlarmSync,
    SlabAlloc,
    WorkqIdle,
}

/// Thread control block
pub struct Thread {
    /// Name (8 ASCII chars max)
    pub(crate) name: [u8; 8],
    pub(crate) entry: Option<ThreadEntry>,
    pub(crate) arg: usize,
    /// Priority set by the user
    pub(crate) base_priority: Priority,
    /// Base, or boosted by priority inheritance
    pub(crate) priority: Priority,
    pub(crate) state: ThreadState,
    pub(crate) options: ThreadOptions,
    /// `sched_lock` nesting depth
    pub(crate) sched_locked: u32,
    pub(crate) context: Context,
    /// Wait queue the thread occupies while blocked
    pub(crate) pended_on: Option<WaitQueueId>,
    pub(crate) pend: Option<Pend>,
    /// Absolute tick of timeout (blocked) or start (created)
    pub(crate) deadline: Option<u64>,
    /// Threads waiting for this one to terminate
    pub(crate) join_queue: WaitQueueId,
}

impl Thread {
    /// Empty slot
    pub(crate) const fn empty(join_queue: WaitQueueId) -> Self {
        Self {
            name: [0u8; 8],
            entry: None,
            arg: 0,
            base_priority: Priority::IDLE,
            priority: Priority::IDLE,
            state: ThreadState::Inactive,
            options: ThreadOptions::empty(),
            sched_locked: 0,
            context: Context {
                stack_size: 0,
                activations: 0,
                swap: None,
            },
            pended_on: None,
            pend: None,
            deadline: None,
            join_queue,
        }
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Effective priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    pub fn options(&self) -> ThreadOptions {
        self.options
    }

    pub fn arg(&self) -> usize {
        self.arg
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    pub fn is_active(&self) -> bool {
        self.state != ThreadState::Inactive
    }

    /// May the scheduler take the CPU away from this thread?
    pub fn is_preemptible(&self) -> bool {
        !self.priority.is_cooperative() && self.sched_locked == 0
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name())
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("base_priority", &self.base_priority)
            .field("pended_on", &self.pended_on)
            .field("deadline", &self.deadline)
            .finish()
    }
}

fn pack_name(name: &[u8]) -> [u8; 8] {
    let mut n = [0u8; 8];
    let len = name.len().min(8);
    n[..len].copy_from_slice(&name[..len]);
    n
}

/// Thread creation parameters
#[derive(Debug, Clone)]
pub struct ThreadSpec {
    name: [u8; 8],
    priority: Priority,
    entry: Option<ThreadEntry>,
    stack_size: usize,
    delay: Timeout,
    options: ThreadOptions,
    arg: usize,
}

impl ThreadSpec {
    /// Thread with no entry function, starting immediately
    pub fn new(name: &[u8], priority: Priority) -> Self {
        Self {
            name: pack_name(name),
            priority,
            entry: None,
            stack_size: DEFAULT_STACK_SIZE,
            delay: Timeout::NoWait,
            options: ThreadOptions::empty(),
            arg: 0,
        }
    }

    pub fn entry(mut self, entry: ThreadEntry) -> Self {
        self.entry = Some(entry);
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Start delay; `Forever` leaves the thread dormant until `thread_start`
    pub fn delay(mut self, delay: Timeout) -> Self {
        self.delay = delay;
        self
    }

    pub fn options(mut self, options: ThreadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn arg(mut self, arg: usize) -> Self {
        self.arg = arg;
        self
    }
}

impl Kernel {
    /// Create a thread running `entry`
    pub fn spawn(
        &mut self,
        entry: ThreadEntry,
        priority: Priority,
        stack_size: usize,
        delay: Timeout,
    ) -> KResult<ThreadId> {
        self.spawn_with(
            ThreadSpec::new(b"thread", priority)
                .entry(entry)
                .stack_size(stack_size)
                .delay(delay),
        )
    }

    /// Create a thread from a full specification
    pub fn spawn_with(&mut self, spec: ThreadSpec) -> KResult<ThreadId> {
        if !spec.priority.is_valid() {
            return Err(self.misuse("spawn", KernelError::InvalidState));
        }
        let Some(slot) = (1..self.threads.len()).find(|&i| {
            let t = &self.threads[i];
            t.state == ThreadState::Inactive
                || (t.state == ThreadState::Terminated
                    && self.wait_queues[t.join_queue.index()].is_empty())
        }) else {
            warn!("spawn: thread table full ({} slots)", self.threads.len());
            return Err(KernelError::ResourceExhausted);
        };
        if self.threads[slot].state == ThreadState::Terminated {
            warn!("spawn: reusing slot of terminated thread T{slot}");
        }

        let tid = ThreadId(slot as u16);
        let now = self.timer.now();
        let t = &mut self.threads[slot];
        *t = Thread::empty(t.join_queue);
        t.name = spec.name;
        t.entry = spec.entry;
        t.arg = spec.arg;
        t.base_priority = spec.priority;
        t.priority = spec.priority;
        t.options = spec.options;
        t.context.stack_size = spec.stack_size;
        t.state = ThreadState::Created;
        debug!(
            "spawn {tid} '{}' prio {} delay {:?}",
            t.name(),
            spec.priority.0,
            spec.delay
        );

        match spec.delay {
            Timeout::Forever => {}
            d if d.is_no_wait() => {
                self.make_ready(tid);
                self.reschedule();
            }
            d => self.threads[slot].deadline = d.deadline(now),
        }
        Ok(tid)
    }

    /// Start a thread that is still dormant, cancelling any start delay
    pub fn thread_start(&mut self, tid: ThreadId) -> KResult<()> {
        self.check_thread(tid, "thread_start")?;
        if self.threads[tid.index()].state != ThreadState::Created {
            return Err(self.misuse("thread_start", KernelError::InvalidState));
        }
        self.threads[tid.index()].deadline = None;
        self.make_ready(tid);
        self.reschedule();
        Ok(())
    }

    /// The running thread
    pub fn current(&self) -> ThreadId {
        self.sched.current()
    }

    pub fn thread(&self, tid: ThreadId) -> Option<&Thread> {
        self.threads.get(tid.index()).filter(|t| t.is_active())
    }

    pub fn thread_state(&self, tid: ThreadId) -> Option<ThreadState> {
        self.thread(tid).map(Thread::state)
    }

    pub fn name(&self, tid: ThreadId) -> Option<&str> {
        self.thread(tid).map(Thread::name)
    }

    pub fn set_name(&mut self, tid: ThreadId, name: &[u8]) -> KResult<()> {
        self.check_thread(tid, "set_name")?;
        self.threads[tid.index()].name = pack_name(name);
        Ok(())
    }

    /// Effective priority
    pub fn priority(&self, tid: ThreadId) -> Option<Priority> {
        self.thread(tid).map(Thread::priority)
    }

    /// Change a thread's base priority; inheritance is re-applied on top
    pub fn set_priority(&mut self, tid: ThreadId, prio: Priority) -> KResult<()> {
        self.check_thread(tid, "set_priority")?;
        if tid == ThreadId::IDLE || !prio.is_valid() {
            return Err(self.misuse("set_priority", KernelError::InvalidState));
        }
        self.threads[tid.index()].base_priority = prio;
        self.refresh_priority(tid);
        self.reschedule();
        Ok(())
    }

    /// Give way to ready threads of equal or higher priority
    pub fn yield_now(&mut self) -> KResult<()> {
        self.require_thread_context("yield_now")?;
        let cur = self.current();
        let prio = self.threads[cur.index()].priority;
        let Some(best) = self.sched.highest_ready() else {
            return Ok(());
        };
        if !prio.is_higher_than(best) {
            self.threads[cur.index()].state = ThreadState::Ready;
            self.sched.push_back(cur, prio);
            self.switch_away();
        }
        Ok(())
    }

    /// Block the current thread for `timeout`; `NoWait` just yields
    pub fn sleep(&mut self, timeout: Timeout) -> KResult<Wait<()>> {
        if timeout.is_no_wait() {
            self.yield_now()?;
            return Ok(Wait::Ready(()));
        }
        self.check_blocking("sleep", timeout)?;
        self.pend_current(Pend::Sleep, None, timeout);
        Ok(Wait::Pending)
    }

    /// End a sleep early; no effect on threads that are not sleeping
    pub fn wakeup(&mut self, tid: ThreadId) -> KResult<()> {
        self.check_thread(tid, "wakeup")?;
        if matches!(self.threads[tid.index()].pend, Some(Pend::Sleep)) {
            self.unpend(tid);
            self.wake(tid, Ok(Handoff::Done));
            self.reschedule();
        }
        Ok(())
    }

    /// Take a thread off the CPU until `resume`
    pub fn suspend(&mut self, tid: ThreadId) -> KResult<()> {
        self.check_thread(tid, "suspend")?;
        if tid == ThreadId::IDLE {
            return Err(self.misuse("suspend", KernelError::InvalidState));
        }
        let t = &self.threads[tid.index()];
        let prio = t.priority;
        match t.state {
            ThreadState::Suspended => return Ok(()),
            ThreadState::Ready => {
                self.sched.remove(tid, prio);
            }
            ThreadState::Running => {}
            _ => return Err(self.misuse("suspend", KernelError::InvalidState)),
        }
        debug!("suspend {tid}");
        self.threads[tid.index()].state = ThreadState::Suspended;
        self.reschedule();
        Ok(())
    }

    pub fn resume(&mut self, tid: ThreadId) -> KResult<()> {
        self.check_thread(tid, "resume")?;
        if self.threads[tid.index()].state != ThreadState::Suspended {
            return Err(self.misuse("resume", KernelError::InvalidState));
        }
        debug!("resume {tid}");
        self.make_ready(tid);
        self.reschedule();
        Ok(())
    }

    /// Terminate any thread except idle and essential ones
    pub fn abort(&mut self, tid: ThreadId) -> KResult<()> {
        self.check_thread(tid, "abort")?;
        let t = &self.threads[tid.index()];
        if tid == ThreadId::IDLE || t.options.contains(ThreadOptions::ESSENTIAL) {
            return Err(self.misuse("abort", KernelError::InvalidState));
        }
        if t.state == ThreadState::Terminated {
            return Ok(());
        }
        self.terminate(tid);
        Ok(())
    }

    /// Terminate the current thread
    pub fn exit(&mut self) -> KResult<()> {
        self.require_thread_context("exit")?;
        let cur = self.current();
        self.abort(cur)
    }

    /// Wait for a thread to terminate
    pub fn join(&mut self, tid: ThreadId, timeout: Timeout) -> KResult<Wait<()>> {
        self.check_thread(tid, "join")?;
        if tid == self.current() {
            return Err(self.misuse("join", KernelError::InvalidState));
        }
        if self.threads[tid.index()].state == ThreadState::Terminated {
            return Ok(Wait::Ready(()));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("join", timeout)?;
        let queue = self.threads[tid.index()].join_queue;
        self.pend_current(Pend::Join, Some(queue), timeout);
        Ok(Wait::Pending)
    }

    /// Make the current thread non-preemptible until `sched_unlock`
    pub fn sched_lock(&mut self) -> KResult<()> {
        self.require_thread_context("sched_lock")?;
        let cur = self.current();
        self.threads[cur.index()].sched_locked += 1;
        Ok(())
    }

    pub fn sched_unlock(&mut self) -> KResult<()> {
        self.require_thread_context("sched_unlock")?;
        let cur = self.current();
        if self.threads[cur.index()].sched_locked == 0 {
            return Err(self.misuse("sched_unlock", KernelError::InvalidState));
        }
        self.threads[cur.index()].sched_locked -= 1;
        if self.threads[cur.index()].sched_locked == 0 {
            self.reschedule();
        }
        Ok(())
    }

    /// Move a thread to `Terminated` and release everything waiting on it
    pub(crate) fn terminate(&mut self, tid: ThreadId) {
        let t = &self.threads[tid.index()];
        let prio = t.priority;
        match t.state {
            ThreadState::Blocked => {
                self.unpend(tid);
            }
            ThreadState::Ready => {
                self.sched.remove(tid, prio);
            }
            _ => {}
        }
        debug!("terminate {tid}");

        let t = &mut self.threads[tid.index()];
        t.state = ThreadState::Terminated;
        t.deadline = None;
        t.pend = None;
        t.sched_locked = 0;
        let join_queue = t.join_queue;

        // a dead thread keeps no mutex: each passes to its next waiter
        let owned: Vec<MutexId> = (0..self.mutexes.len())
            .filter(|&i| self.mutexes[i].owner == Some(tid))
            .map(|i| MutexId(i as u16))
            .collect();
        if !owned.is_empty() {
            warn!("{tid} terminated while owning {} mutex(es)", owned.len());
        }
        for m in owned {
            self.mutex_release(m);
        }

        while let Some(w) = self.wait_queues[join_queue.index()].pop_front() {
            self.wake(w.tid, Ok(Handoff::Done));
        }
        self.reschedule();
    }
}
