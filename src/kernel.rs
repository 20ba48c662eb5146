//! Kernel: the single owner of all scheduling and object state
//!
//! Combines the TCB table, the ready queues, the tick source and the object
//! arenas into one explicit value. Operations act on behalf of the current
//! thread, or on behalf of an interrupt between `irq_enter` and `irq_exit`.
//!
//! A call that has to wait returns [`Wait::Pending`]: the caller is now
//! blocked and another thread is current. When the wait ends the result is
//! parked in the caller's TCB until it runs again and collects it with
//! [`Kernel::take_wakeup`].

use alloc::vec::Vec;

use log::{error, trace};

use crate::alarm::Alarm;
use crate::condvar::Condvar;
use crate::config::{KernelConfig, MisusePolicy};
use crate::error::{KResult, KernelError};
use crate::event::Event;
use crate::mailbox::{Mailbox, Message};
use crate::msgq::Msgq;
use crate::mutex::Mutex;
use crate::poll::PollState;
use crate::queue::Queue;
use crate::scheduler::Scheduler;
use crate::semaphore::Semaphore;
use crate::slab::{MemSlab, SlabBlock};
use crate::spinlock::Spinlock;
use crate::thread::{Pend, Priority, Thread, ThreadId, ThreadOptions, ThreadState};
use crate::timer::{SysTimer, Timeout};
use crate::wait_queue::{WaitOrder, WaitQueue, WaitQueueId};
use crate::work::{Work, Workqueue};

/// Outcome of an operation that may have to wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wait<T> {
    /// Completed without blocking
    Ready(T),
    /// The caller blocked; its result arrives through `take_wakeup`
    Pending,
}

impl<T> Wait<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Wait::Pending)
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Wait::Ready(v) => Some(v),
            Wait::Pending => None,
        }
    }
}

/// Value handed to a thread when its wait completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// Acquired, released, slept, joined or sent
    Done,
    /// A message-queue item or FIFO/LIFO buffer
    Data(Vec<u8>),
    /// A mailbox message
    Message(Message),
    /// Matched event bits
    Events(u32),
    /// One readiness state per polled event
    Polled(Vec<PollState>),
    /// Alarm expiry count
    Count(u32),
    /// A memory-slab block
    Block(SlabBlock),
}

impl Handoff {
    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            Handoff::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Handoff::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_events(self) -> Option<u32> {
        match self {
            Handoff::Events(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_polled(self) -> Option<Vec<PollState>> {
        match self {
            Handoff::Polled(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_count(self) -> Option<u32> {
        match self {
            Handoff::Count(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_block(self) -> Option<SlabBlock> {
        match self {
            Handoff::Block(b) => Some(b),
            _ => None,
        }
    }
}

/// Result stored in a thread's context when its wait ends
pub type Wakeup = KResult<Handoff>;

/// Real-time kernel
pub struct Kernel {
    /// Runtime configuration
    pub(crate) config: KernelConfig,
    /// TCB table, slot 0 is idle
    pub(crate) threads: Vec<Thread>,
    /// Ready queues and the running thread
    pub(crate) sched: Scheduler,
    /// System timer
    pub timer: SysTimer,
    /// Wait-queue arena; the first `max_threads` entries are join queues
    pub(crate) wait_queues: Vec<WaitQueue>,
    pub(crate) mutexes: Vec<Mutex>,
    pub(crate) semaphores: Vec<Semaphore>,
    pub(crate) condvars: Vec<Condvar>,
    pub(crate) msgqs: Vec<Msgq>,
    pub(crate) queues: Vec<Queue>,
    pub(crate) mailboxes: Vec<Mailbox>,
    pub(crate) events: Vec<Event>,
    pub(crate) alarms: Vec<Alarm>,
    pub(crate) spinlocks: Vec<Spinlock>,
    pub(crate) slabs: Vec<MemSlab>,
    pub(crate) workqueues: Vec<Workqueue>,
    pub(crate) works: Vec<Work>,
    /// Interrupt nesting depth
    pub(crate) irq_nesting: u32,
    /// `irq_lock` nesting depth
    pub(crate) irq_lock_depth: u32,
    /// Ticks latched while interrupts were masked
    pub(crate) pending_ticks: u32,
    /// A reschedule was deferred
    pub(crate) need_resched: bool,
    /// The running thread's time slice ran out
    pub(crate) slice_expired: bool,
    /// Total ticks processed
    pub total_ticks: u64,
}

impl Kernel {
    /// Create a kernel with the idle thread running
    pub fn new(config: KernelConfig) -> KResult<Self> {
        config.validate()?;
        let max = config.max_threads;
        let mut threads = Vec::with_capacity(max);
        let mut wait_queues = Vec::with_capacity(max);
        for i in 0..max {
            threads.push(Thread::empty(WaitQueueId(i as u16)));
            wait_queues.push(WaitQueue::new(WaitOrder::Fifo));
        }

        let idle = &mut threads[ThreadId::IDLE.index()];
        idle.name = *b"idle\0\0\0\0";
        idle.state = ThreadState::Running;
        idle.options = ThreadOptions::ESSENTIAL;
        idle.context.activations = 1;

        let mut sched = Scheduler::new();
        sched.reset_slice(config.time_slice_ticks);

        Ok(Self {
            config,
            threads,
            sched,
            timer: SysTimer::new(config.ticks_per_sec),
            wait_queues,
            mutexes: Vec::new(),
            semaphores: Vec::new(),
            condvars: Vec::new(),
            msgqs: Vec::new(),
            queues: Vec::new(),
            mailboxes: Vec::new(),
            events: Vec::new(),
            alarms: Vec::new(),
            spinlocks: Vec::new(),
            slabs: Vec::new(),
            workqueues: Vec::new(),
            works: Vec::new(),
            irq_nesting: 0,
            irq_lock_depth: 0,
            pending_ticks: 0,
            need_resched: false,
            slice_expired: false,
            total_ticks: 0,
        })
    }

    /// Create kernel for testing (1 kHz software tick, misuse reported)
    pub fn testing() -> Self {
        let config = KernelConfig::testing();
        match Self::new(config) {
            Ok(kernel) => kernel,
            Err(e) => panic!("testing configuration rejected: {e}"),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Current tick count
    pub fn now(&self) -> u64 {
        self.timer.now()
    }

    /// Inside an interrupt handler?
    pub fn in_interrupt(&self) -> bool {
        self.irq_nesting > 0
    }

    pub fn context_switches(&self) -> u32 {
        self.sched.context_switches
    }

    /// Collect the result of a thread's completed wait
    pub fn take_wakeup(&mut self, tid: ThreadId) -> Option<Wakeup> {
        self.threads.get_mut(tid.index())?.context.swap.take()
    }

    /// Interrupt entry notification
    pub fn irq_enter(&mut self) {
        self.irq_nesting += 1;
    }

    /// Interrupt exit notification; the outermost exit is a preemption point
    pub fn irq_exit(&mut self) -> KResult<()> {
        if self.irq_nesting == 0 {
            return Err(self.misuse("irq_exit", KernelError::InvalidState));
        }
        self.irq_nesting -= 1;
        if self.irq_nesting == 0 {
            self.reschedule();
        }
        Ok(())
    }

    /// Timer interrupt: one tick of time passes
    pub fn on_tick(&mut self) {
        if self.irq_lock_depth > 0 {
            self.pending_ticks += 1;
            trace!("tick latched ({} pending)", self.pending_ticks);
            return;
        }
        self.irq_nesting += 1;
        self.process_tick();
        self.irq_nesting -= 1;
        if self.irq_nesting == 0 {
            self.reschedule();
        }
    }

    /// Run the current thread's entry once.
    ///
    /// Returns false when the current thread has no entry (idle included).
    pub fn step(&mut self) -> bool {
        let cur = self.current();
        let Some(entry) = self.threads[cur.index()].entry else {
            return false;
        };
        if entry(self) == crate::thread::Flow::Exit
            && self.threads[cur.index()].state != ThreadState::Terminated
        {
            self.terminate(cur);
        }
        true
    }

    /// Simulate `ticks` ticks: each runs the current entry, then a tick
    pub fn run_for(&mut self, ticks: u64) -> KernelStats {
        let switches_before = self.sched.context_switches;
        let mut steps = 0u64;
        let mut idle_ticks = 0u64;

        for _ in 0..ticks {
            if self.current() == ThreadId::IDLE {
                idle_ticks += 1;
            }
            if self.step() {
                steps += 1;
            }
            self.on_tick();
        }

        KernelStats {
            ticks,
            steps,
            idle_ticks,
            context_switches: self.sched.context_switches.wrapping_sub(switches_before) as u64,
            uptime_ms: self.timer.uptime_ms(),
        }
    }

    // ---- misuse and context checks ----

    /// Log a programming error and apply the misuse policy
    pub(crate) fn misuse(&mut self, op: &str, err: KernelError) -> KernelError {
        let cur = self.current();
        error!("{op}: {err} (thread {cur}, irq nesting {})", self.irq_nesting);
        match self.config.misuse {
            MisusePolicy::Report => {}
            MisusePolicy::AbortThread => {
                let t = &self.threads[cur.index()];
                if !self.in_interrupt()
                    && cur != ThreadId::IDLE
                    && !t.options.contains(ThreadOptions::ESSENTIAL)
                    && t.state == ThreadState::Running
                {
                    self.terminate(cur);
                }
            }
            MisusePolicy::Panic => panic!("{op}: {err}"),
        }
        err
    }

    /// Reject unknown or empty-slot thread ids
    pub(crate) fn check_thread(&mut self, tid: ThreadId, op: &str) -> KResult<()> {
        if self.thread(tid).is_some() {
            Ok(())
        } else {
            Err(self.misuse(op, KernelError::InvalidState))
        }
    }

    /// Reject handles that do not name a live object
    pub(crate) fn check_object(&mut self, exists: bool, op: &str) -> KResult<()> {
        if exists {
            Ok(())
        } else {
            Err(self.misuse(op, KernelError::InvalidState))
        }
    }

    pub(crate) fn require_thread_context(&mut self, op: &str) -> KResult<()> {
        if self.in_interrupt() {
            return Err(self.misuse(op, KernelError::ContextViolation));
        }
        Ok(())
    }

    /// A wait with a real timeout needs a thread that may block
    pub(crate) fn check_blocking(&mut self, op: &str, timeout: Timeout) -> KResult<()> {
        if timeout.is_no_wait() {
            return Ok(());
        }
        if self.in_interrupt() || self.irq_lock_depth > 0 || self.current() == ThreadId::IDLE {
            return Err(self.misuse(op, KernelError::ContextViolation));
        }
        Ok(())
    }

    // ---- scheduling core ----

    /// Put a thread at the tail of its ready queue
    pub(crate) fn make_ready(&mut self, tid: ThreadId) {
        let t = &mut self.threads[tid.index()];
        t.state = ThreadState::Ready;
        self.sched.push_back(tid, t.priority);
        self.need_resched = true;
    }

    /// End a wait: store the result and ready the thread.
    ///
    /// The caller has already taken the thread off its wait queue.
    pub(crate) fn wake(&mut self, tid: ThreadId, result: Wakeup) {
        let t = &mut self.threads[tid.index()];
        trace!("wake {tid}: {result:?}");
        t.pend = None;
        t.pended_on = None;
        t.deadline = None;
        t.context.swap = Some(result);
        self.make_ready(tid);
    }

    /// Block the current thread without switching away yet
    pub(crate) fn block_current(&mut self, pend: Pend, queue: Option<WaitQueueId>, timeout: Timeout) {
        let cur = self.current();
        let now = self.timer.now();
        let prio = self.threads[cur.index()].priority;
        if let Some(q) = queue {
            self.wait_queues[q.index()].push(cur, prio);
        }
        let t = &mut self.threads[cur.index()];
        trace!("pend {cur} on {queue:?} until {:?}", timeout.deadline(now));
        t.state = ThreadState::Blocked;
        t.pend = Some(pend);
        t.pended_on = queue;
        t.deadline = timeout.deadline(now);
        t.context.swap = None;
    }

    /// Block the current thread and run the next one
    pub(crate) fn pend_current(&mut self, pend: Pend, queue: Option<WaitQueueId>, timeout: Timeout) {
        self.block_current(pend, queue, timeout);
        self.switch_away();
    }

    /// The current thread gives up the CPU; run the most urgent ready thread
    pub(crate) fn switch_away(&mut self) {
        let next = self.sched.pop_highest().unwrap_or(ThreadId::IDLE);
        self.switch_to(next);
    }

    fn switch_to(&mut self, next: ThreadId) {
        let prev = self.current();
        if next != prev {
            self.sched.context_switches = self.sched.context_switches.wrapping_add(1);
            self.threads[next.index()].context.activations += 1;
            trace!("switch {prev} -> {next}");
        }
        self.sched.set_current(next);
        self.threads[next.index()].state = ThreadState::Running;
        self.sched.reset_slice(self.config.time_slice_ticks);
        self.need_resched = false;
        self.slice_expired = false;
    }

    /// Preemption point
    pub(crate) fn reschedule(&mut self) {
        if self.in_interrupt() {
            self.need_resched = true;
            return;
        }
        let cur = self.current();
        let t = &self.threads[cur.index()];
        if t.state != ThreadState::Running {
            self.switch_away();
            return;
        }
        if self.irq_lock_depth > 0 {
            self.need_resched = true;
            return;
        }
        self.need_resched = false;
        if !t.is_preemptible() {
            self.slice_expired = false;
            return;
        }
        let prio = t.priority;
        if core::mem::take(&mut self.slice_expired) && self.sched.has_ready_at(prio) {
            trace!("time slice of {cur} expired");
            self.threads[cur.index()].state = ThreadState::Ready;
            self.sched.push_back(cur, prio);
            self.switch_away();
            return;
        }
        if let Some(best) = self.sched.highest_ready() {
            if best.is_higher_than(prio) {
                self.threads[cur.index()].state = ThreadState::Ready;
                self.sched.push_front(cur, prio);
                self.switch_away();
            }
        }
    }

    /// Change a thread's effective priority, keeping its queues ordered
    pub(crate) fn set_effective_priority(&mut self, tid: ThreadId, prio: Priority) {
        let t = &mut self.threads[tid.index()];
        let old = t.priority;
        if old == prio {
            return;
        }
        trace!("{tid} priority {} -> {}", old.0, prio.0);
        t.priority = prio;
        match t.state {
            ThreadState::Ready => {
                self.sched.remove(tid, old);
                self.sched.push_back(tid, prio);
            }
            ThreadState::Blocked => {
                if let Some(q) = t.pended_on {
                    self.wait_queues[q.index()].reposition(tid, prio);
                }
            }
            _ => {}
        }
    }

    /// Take a blocked thread out of whatever it waits on.
    ///
    /// Leaves it Blocked with no pend record; the caller decides how it
    /// resumes.
    pub(crate) fn unpend(&mut self, tid: ThreadId) -> Option<Pend> {
        let t = &mut self.threads[tid.index()];
        let pend = t.pend.take();
        let queue = t.pended_on.take();
        t.deadline = None;
        if let Some(q) = queue {
            self.wait_queues[q.index()].remove(tid);
        }
        match &pend {
            Some(Pend::MutexLock { mutex, .. }) => {
                if let Some(owner) = self.mutexes[mutex.index()].owner {
                    self.refresh_priority(owner);
                }
            }
            Some(Pend::Poll(events)) => self.poll_unregister(tid, events),
            _ => {}
        }
        pend
    }

    /// A blocked thread's deadline passed
    fn timeout_thread(&mut self, tid: ThreadId) {
        trace!("timeout {tid}");
        match self.unpend(tid) {
            Some(Pend::Sleep) => self.wake(tid, Ok(Handoff::Done)),
            Some(Pend::CondvarWait { mutex }) => {
                self.relock_for(tid, mutex, Err(KernelError::TimedOut))
            }
            _ => self.wake(tid, Err(KernelError::TimedOut)),
        }
    }

    /// Interrupt-context body of one timer tick
    fn process_tick(&mut self) {
        self.timer.advance(1);
        self.total_ticks += 1;
        let now = self.timer.now();

        let mut due: Vec<(u64, ThreadId)> = self
            .threads
            .iter()
            .enumerate()
            .filter_map(|(i, t)| match t.deadline {
                Some(d) if d <= now => Some((d, ThreadId(i as u16))),
                _ => None,
            })
            .collect();
        due.sort_unstable();
        for (_, tid) in due {
            // an earlier expiry may already have released this thread
            let t = &self.threads[tid.index()];
            if t.deadline.map_or(true, |d| d > now) {
                continue;
            }
            let state = t.state;
            match state {
                ThreadState::Created => {
                    self.threads[tid.index()].deadline = None;
                    self.make_ready(tid);
                }
                ThreadState::Blocked => self.timeout_thread(tid),
                _ => self.threads[tid.index()].deadline = None,
            }
        }

        self.process_alarms(now);
        self.process_work_delays(now);
        self.account_slice();
    }

    fn account_slice(&mut self) {
        if self.config.time_slice_ticks == 0 {
            return;
        }
        let cur = self.current();
        let t = &self.threads[cur.index()];
        let sliced = cur != ThreadId::IDLE
            && t.state == ThreadState::Running
            && t.is_preemptible()
            && !t.priority.is_higher_than(self.config.time_slice_ceiling);
        if sliced && self.sched.tick_slice() {
            self.sched.reset_slice(self.config.time_slice_ticks);
            self.slice_expired = true;
            self.need_resched = true;
        }
    }

    /// Deliver ticks latched while interrupts were masked
    pub(crate) fn deliver_pending_ticks(&mut self) {
        while self.pending_ticks > 0 && self.irq_lock_depth == 0 {
            self.pending_ticks -= 1;
            self.on_tick();
        }
    }

    pub(crate) fn new_wait_queue(&mut self, order: WaitOrder) -> KResult<WaitQueueId> {
        let id = crate::macros::next_index(self.wait_queues.len())?;
        self.wait_queues.push(WaitQueue::new(order));
        Ok(WaitQueueId(id))
    }

    /// Threads blocked on a wait queue, in release order
    pub(crate) fn waiters(&self, queue: WaitQueueId) -> Vec<ThreadId> {
        self.wait_queues[queue.index()].tids()
    }
}

/// Kernel execution statistics
#[derive(Debug, Clone)]
pub struct KernelStats {
    /// Ticks simulated
    pub ticks: u64,
    /// Entry-function steps executed
    pub steps: u64,
    /// Ticks that started with the idle thread current
    pub idle_ticks: u64,
    /// Context switches during the run
    pub context_switches: u64,
    /// Uptime at the end of the run
    pub uptime_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::thread::{Flow, ThreadSpec};

    fn counting_entry(k: &mut Kernel) -> Flow {
        let cur = k.current();
        k.threads[cur.index()].arg += 1;
        Flow::Continue
    }

    fn exit_after_three(k: &mut Kernel) -> Flow {
        let cur = k.current();
        k.threads[cur.index()].arg += 1;
        if k.threads[cur.index()].arg >= 3 {
            Flow::Exit
        } else {
            Flow::Continue
        }
    }

    #[test]
    fn test_kernel_creation() {
        let k = Kernel::testing();
        assert_eq!(k.current(), ThreadId::IDLE);
        assert_eq!(k.thread_state(ThreadId::IDLE), Some(ThreadState::Running));
        assert_eq!(k.now(), 0);
        assert!(!k.in_interrupt());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let r = Kernel::new(KernelConfig::testing().with_ticks_per_sec(0));
        assert!(matches!(r, Err(KernelError::InvalidState)));
    }

    #[test]
    fn test_irq_exit_unbalanced() {
        let mut k = Kernel::testing();
        assert_eq!(k.irq_exit(), Err(KernelError::InvalidState));
        k.irq_enter();
        assert!(k.in_interrupt());
        k.irq_exit().unwrap();
        assert!(!k.in_interrupt());
    }

    #[test]
    fn test_blocking_from_idle_rejected() {
        let mut k = Kernel::testing();
        assert_eq!(k.sleep(Timeout::Ticks(3)), Err(KernelError::ContextViolation));
        assert_eq!(k.current(), ThreadId::IDLE);
    }

    #[test]
    fn test_abort_thread_policy() {
        let cfg = KernelConfig::testing().with_misuse(MisusePolicy::AbortThread);
        let mut k = Kernel::new(cfg).unwrap();
        let t = k.spawn_with(ThreadSpec::new(b"bad", Priority(3))).unwrap();
        assert_eq!(k.sched_unlock(), Err(KernelError::InvalidState));
        assert_eq!(k.thread_state(t), Some(ThreadState::Terminated));
        assert_eq!(k.current(), ThreadId::IDLE);
    }

    #[test]
    #[should_panic]
    fn test_panic_policy() {
        let cfg = KernelConfig::testing().with_misuse(MisusePolicy::Panic);
        let mut k = Kernel::new(cfg).unwrap();
        let _ = k.irq_exit();
    }

    #[test]
    fn test_run_for_counts() {
        let mut k = Kernel::testing();
        let t = k
            .spawn_with(ThreadSpec::new(b"count", Priority(5)).entry(counting_entry))
            .unwrap();
        let stats = k.run_for(10);
        assert_eq!(stats.ticks, 10);
        assert_eq!(stats.steps, 10);
        assert_eq!(stats.idle_ticks, 0);
        assert_eq!(k.thread(t).unwrap().arg(), 10);
        assert_eq!(stats.uptime_ms, 10);
    }

    #[test]
    fn test_run_for_exit() {
        let mut k = Kernel::testing();
        let t = k
            .spawn_with(ThreadSpec::new(b"short", Priority(5)).entry(exit_after_three))
            .unwrap();
        let stats = k.run_for(6);
        assert_eq!(stats.steps, 3);
        assert_eq!(stats.idle_ticks, 3);
        assert_eq!(k.thread_state(t), Some(ThreadState::Terminated));
        assert_eq!(stats.context_switches, 1);
    }

    #[test]
    fn test_time_slicing_rotates() {
        let cfg = KernelConfig::testing().with_time_slice(2, Priority(0));
        let mut k = Kernel::new(cfg).unwrap();
        let a = k.spawn_with(ThreadSpec::new(b"a", Priority(4))).unwrap();
        let b = k.spawn_with(ThreadSpec::new(b"b", Priority(4))).unwrap();
        assert_eq!(k.current(), a);
        k.on_tick();
        assert_eq!(k.current(), a);
        k.on_tick();
        assert_eq!(k.current(), b);
        k.on_tick();
        k.on_tick();
        assert_eq!(k.current(), a);
    }

    #[test]
    fn test_time_slice_ceiling() {
        let cfg = KernelConfig::testing().with_time_slice(1, Priority(5));
        let mut k = Kernel::new(cfg).unwrap();
        let a = k.spawn_with(ThreadSpec::new(b"a", Priority(4))).unwrap();
        k.spawn_with(ThreadSpec::new(b"b", Priority(4))).unwrap();
        for _ in 0..5 {
            k.on_tick();
        }
        assert_eq!(k.current(), a);
    }

    #[test]
    fn test_handoff_accessors() {
        assert_eq!(Handoff::Data(alloc::vec![1, 2]).into_data(), Some(alloc::vec![1, 2]));
        assert_eq!(Handoff::Done.into_data(), None);
        assert_eq!(Handoff::Events(0b101).into_events(), Some(0b101));
        assert_eq!(Handoff::Count(3).into_count(), Some(3));
        assert_eq!(Wait::Ready(4).ready(), Some(4));
        assert!(Wait::<u8>::Pending.is_pending());
    }
}
