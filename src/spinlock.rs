//! Interrupt masking, spinlocks and the shared kernel handle
//!
//! On a single core a spinlock is an interrupt lock plus a held flag: while
//! it is held no tick or interrupt can run, so nothing can contend for it.
//! Ticks arriving while interrupts are masked are latched and delivered in
//! order when the outermost lock is released.

use log::{debug, trace};

use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;

/// Token returned by `irq_lock`, consumed by `irq_unlock`.
///
/// Keys must be released in the reverse order they were taken.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct IrqKey {
    depth: u32,
}

object_id!(
    /// Handle of a spinlock
    SpinlockId
);

#[derive(Debug, Default)]
pub struct Spinlock {
    pub(crate) held: bool,
}

/// Token for a held spinlock
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct SpinKey {
    lock: SpinlockId,
    irq: IrqKey,
}

/// A rejected unlock. Nothing changed; the key is handed back so it can
/// still be released in the right order.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct UnlockError<K> {
    pub error: KernelError,
    pub key: K,
}

impl<K> From<UnlockError<K>> for KernelError {
    fn from(e: UnlockError<K>) -> Self {
        e.error
    }
}

impl Kernel {
    /// Mask interrupts; nests
    pub fn irq_lock(&mut self) -> IrqKey {
        self.irq_lock_depth += 1;
        IrqKey {
            depth: self.irq_lock_depth,
        }
    }

    /// Undo the matching `irq_lock`.
    ///
    /// The outermost unlock delivers latched ticks and is a preemption
    /// point. A key released out of order is returned untouched.
    pub fn irq_unlock(&mut self, key: IrqKey) -> Result<(), UnlockError<IrqKey>> {
        if self.irq_lock_depth == 0 || key.depth != self.irq_lock_depth {
            let error = self.misuse("irq_unlock", KernelError::InvalidState);
            return Err(UnlockError { error, key });
        }
        self.irq_release();
        Ok(())
    }

    /// Drop one level of masking; the key was already checked
    fn irq_release(&mut self) {
        self.irq_lock_depth -= 1;
        if self.irq_lock_depth == 0 {
            if self.pending_ticks > 0 {
                trace!("delivering {} latched ticks", self.pending_ticks);
            }
            self.deliver_pending_ticks();
            self.reschedule();
        }
    }

    pub fn irq_locked(&self) -> bool {
        self.irq_lock_depth > 0
    }

    pub fn spinlock_init(&mut self) -> KResult<SpinlockId> {
        let id = crate::macros::next_index(self.spinlocks.len())?;
        self.spinlocks.push(Spinlock::default());
        debug!("spinlock {id} created");
        Ok(SpinlockId(id))
    }

    /// Take the lock with interrupts masked.
    ///
    /// Re-taking a held lock would spin forever on one core and is rejected.
    pub fn spin_lock(&mut self, id: SpinlockId) -> KResult<SpinKey> {
        self.check_object(id.index() < self.spinlocks.len(), "spin_lock")?;
        if self.spinlocks[id.index()].held {
            return Err(self.misuse("spin_lock", KernelError::InvalidState));
        }
        let irq = self.irq_lock();
        self.spinlocks[id.index()].held = true;
        Ok(SpinKey { lock: id, irq })
    }

    /// Release the lock and its interrupt mask. A key that does not match
    /// a held lock at the current masking depth is returned untouched.
    pub fn spin_unlock(&mut self, key: SpinKey) -> Result<(), UnlockError<SpinKey>> {
        let held = self.spinlocks.get(key.lock.index()).is_some_and(|s| s.held);
        if let Err(error) = self.check_object(held, "spin_unlock") {
            return Err(UnlockError { error, key });
        }
        if key.irq.depth != self.irq_lock_depth {
            let error = self.misuse("spin_unlock", KernelError::InvalidState);
            return Err(UnlockError { error, key });
        }
        self.spinlocks[key.lock.index()].held = false;
        self.irq_release();
        Ok(())
    }

    pub fn spin_is_locked(&self, id: SpinlockId) -> Option<bool> {
        self.spinlocks.get(id.index()).map(|s| s.held)
    }
}

/// Kernel shared between host threads
///
/// Every call takes the inner spin mutex for its whole duration, so each
/// one is atomic with respect to the others, the way a kernel call is
/// atomic with respect to interrupts on the target.
pub struct SharedKernel {
    inner: spin::Mutex<Kernel>,
}

impl SharedKernel {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            inner: spin::Mutex::new(kernel),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, Kernel> {
        self.inner.lock()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        f(&mut *self.inner.lock())
    }

    /// Deliver one timer tick
    pub fn tick(&self) {
        self.with(Kernel::on_tick);
    }

    /// Run `f` as an interrupt handler
    pub fn interrupt<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> KResult<R> {
        let mut k = self.inner.lock();
        k.irq_enter();
        let r = f(&mut *k);
        k.irq_exit()?;
        Ok(r)
    }

    pub fn into_inner(self) -> Kernel {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::thread::{Priority, ThreadSpec};
    use crate::timer::Timeout;
    use std::sync::Arc;
    use std::vec::Vec;

    fn unlock_both(k: &mut Kernel, inner: IrqKey, outer: IrqKey) -> KResult<()> {
        k.irq_unlock(inner)?;
        k.irq_unlock(outer)?;
        Ok(())
    }

    #[test]
    fn test_irq_lock_nesting() {
        let mut k = Kernel::testing();
        let outer = k.irq_lock();
        let inner = k.irq_lock();
        assert!(k.irq_locked());
        unlock_both(&mut k, inner, outer).unwrap();
        assert!(!k.irq_locked());

        let outer = k.irq_lock();
        let inner = k.irq_lock();
        assert_eq!(unlock_both(&mut k, outer, inner), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_irq_unlock_out_of_order() {
        let mut k = Kernel::testing();
        let outer = k.irq_lock();
        let inner = k.irq_lock();
        let rejected = k.irq_unlock(outer).unwrap_err();
        assert_eq!(rejected.error, KernelError::InvalidState);
        assert!(k.irq_locked());
        k.irq_unlock(inner).unwrap();
        assert!(k.irq_locked());

        // the returned key still releases the outer level
        k.on_tick();
        k.on_tick();
        assert_eq!(k.now(), 0);
        k.irq_unlock(rejected.key).unwrap();
        assert!(!k.irq_locked());
        assert_eq!(k.now(), 2);
    }

    #[test]
    fn test_spin_unlock_rejects_foreign_key() {
        let mut k = Kernel::testing();
        let mut other = Kernel::testing();
        let lock = k.spinlock_init().unwrap();
        let key = k.spin_lock(lock).unwrap();

        let rejected = other.spin_unlock(key).unwrap_err();
        assert_eq!(rejected.error, KernelError::InvalidState);
        assert!(!other.irq_locked());
        assert_eq!(k.spin_is_locked(lock), Some(true));

        k.spin_unlock(rejected.key).unwrap();
        assert_eq!(k.spin_is_locked(lock), Some(false));
        assert!(!k.irq_locked());
    }

    #[test]
    fn test_spin_unlock_under_nested_irq_lock() {
        let mut k = Kernel::testing();
        let lock = k.spinlock_init().unwrap();
        let key = k.spin_lock(lock).unwrap();
        let irq = k.irq_lock();
        let rejected = k.spin_unlock(key).unwrap_err();
        assert_eq!(rejected.error, KernelError::InvalidState);
        assert_eq!(k.spin_is_locked(lock), Some(true));
        k.irq_unlock(irq).unwrap();
        k.spin_unlock(rejected.key).unwrap();
        assert!(!k.irq_locked());
    }

    #[test]
    fn test_ticks_latched_while_locked() {
        let mut k = Kernel::testing();
        let t = k.spawn_with(ThreadSpec::new(b"sleeper", Priority(3))).unwrap();
        k.sleep(Timeout::Ticks(2)).unwrap();
        let key = k.irq_lock();
        k.on_tick();
        k.on_tick();
        k.on_tick();
        assert_eq!(k.now(), 0);
        assert_eq!(k.current(), crate::thread::ThreadId::IDLE);
        k.irq_unlock(key).unwrap();
        assert_eq!(k.now(), 3);
        assert_eq!(k.current(), t);
    }

    #[test]
    fn test_no_blocking_with_irqs_masked() {
        let mut k = Kernel::testing();
        k.spawn_with(ThreadSpec::new(b"t", Priority(3))).unwrap();
        let key = k.irq_lock();
        assert_eq!(k.sleep(Timeout::Ticks(1)), Err(KernelError::ContextViolation));
        k.irq_unlock(key).unwrap();
    }

    #[test]
    fn test_spinlock_defers_preemption() {
        let mut k = Kernel::testing();
        let s = k.sem_init(0, 1).unwrap();
        let lock = k.spinlock_init().unwrap();
        let hi = k.spawn_with(ThreadSpec::new(b"hi", Priority(1))).unwrap();
        k.sem_take(s, Timeout::Forever).unwrap();
        let lo = k.spawn_with(ThreadSpec::new(b"lo", Priority(6))).unwrap();
        assert_eq!(k.current(), lo);

        let key = k.spin_lock(lock).unwrap();
        assert_eq!(k.spin_is_locked(lock), Some(true));
        assert_eq!(k.spin_lock(lock), Err(KernelError::InvalidState));
        k.sem_give(s).unwrap();
        assert_eq!(k.current(), lo);
        k.spin_unlock(key).unwrap();
        assert_eq!(k.current(), hi);
        assert_eq!(k.spin_is_locked(lock), Some(false));
    }

    #[test]
    fn test_shared_kernel_across_host_threads() {
        let mut k = Kernel::testing();
        let s = k.sem_init(0, 1000).unwrap();
        let shared = Arc::new(SharedKernel::new(k));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        shared.interrupt(|k| k.sem_give(s)).unwrap().unwrap();
                        shared.tick();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let k = Arc::try_unwrap(shared).ok().unwrap().into_inner();
        assert_eq!(k.sem_count(s), Some(200));
        assert_eq!(k.now(), 200);
    }
}
