//! Memory slabs: fixed-size block allocation
//!
//! A slab carves one buffer into equal blocks handed out from a free list.
//! An allocation may wait for a block; freeing hands the block straight to
//! the longest-waiting thread, so a free block and a waiter never coexist.

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, trace};

use crate::error::{KResult, KernelError};
use crate::kernel::{Handoff, Kernel, Wait};
use crate::thread::Pend;
use crate::timer::Timeout;
use crate::wait_queue::{WaitOrder, WaitQueueId};

object_id!(
    /// Handle of a memory slab
    SlabId
);

/// An allocated block, returned with `slab_free`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabBlock {
    slab: SlabId,
    index: u16,
}

impl SlabBlock {
    pub fn slab(&self) -> SlabId {
        self.slab
    }

    /// Position of the block in its slab
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Slab state
#[derive(Debug)]
pub struct MemSlab {
    pub(crate) block_size: usize,
    pub(crate) buffer: Vec<u8>,
    /// Free block indices, most recently freed last
    pub(crate) free: Vec<u16>,
    pub(crate) in_use: Vec<bool>,
    /// High-water mark of allocated blocks
    pub(crate) max_used: usize,
    pub(crate) waiters: WaitQueueId,
}

impl MemSlab {
    fn num_blocks(&self) -> usize {
        self.in_use.len()
    }

    fn take(&mut self, slab: SlabId) -> Option<SlabBlock> {
        let index = self.free.pop()?;
        self.in_use[index as usize] = true;
        self.max_used = self.max_used.max(self.num_blocks() - self.free.len());
        Some(SlabBlock { slab, index })
    }

    fn range(&self, index: usize) -> core::ops::Range<usize> {
        let start = index * self.block_size;
        start..start + self.block_size
    }
}

impl Kernel {
    /// Create a slab of `num_blocks` blocks of `block_size` bytes
    pub fn slab_init(&mut self, block_size: usize, num_blocks: usize) -> KResult<SlabId> {
        if block_size == 0 || num_blocks == 0 || num_blocks > u16::MAX as usize {
            return Err(self.misuse("slab_init", KernelError::InvalidState));
        }
        let bytes = block_size
            .checked_mul(num_blocks)
            .ok_or(KernelError::ResourceExhausted)?;
        let id = crate::macros::next_index(self.slabs.len())?;
        let waiters = self.new_wait_queue(WaitOrder::Fifo)?;
        self.slabs.push(MemSlab {
            block_size,
            buffer: vec![0; bytes],
            free: (0..num_blocks as u16).rev().collect(),
            in_use: vec![false; num_blocks],
            max_used: 0,
            waiters,
        });
        debug!("slab {id} created ({num_blocks} x {block_size} bytes)");
        Ok(SlabId(id))
    }

    /// Allocate a block, waiting up to `timeout` for one to be freed.
    ///
    /// NoWait allocations are interrupt-safe.
    pub fn slab_alloc(&mut self, id: SlabId, timeout: Timeout) -> KResult<Wait<SlabBlock>> {
        self.check_object(id.index() < self.slabs.len(), "slab_alloc")?;
        if let Some(block) = self.slabs[id.index()].take(id) {
            trace!("slab {} block {} allocated", id.0, block.index);
            return Ok(Wait::Ready(block));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.check_blocking("slab_alloc", timeout)?;
        let waiters = self.slabs[id.index()].waiters;
        self.pend_current(Pend::SlabAlloc, Some(waiters), timeout);
        Ok(Wait::Pending)
    }

    /// Return a block (interrupt-safe). Freeing a block twice is
    /// `InvalidState`.
    pub fn slab_free(&mut self, block: SlabBlock) -> KResult<()> {
        let allocated = self
            .slabs
            .get(block.slab.index())
            .and_then(|s| s.in_use.get(block.index()))
            .copied()
            .unwrap_or(false);
        self.check_object(allocated, "slab_free")?;

        let s = &mut self.slabs[block.slab.index()];
        let waiters = s.waiters;
        if let Some(w) = self.wait_queues[waiters.index()].pop_front() {
            trace!("slab {} block {} handed to {}", block.slab.0, block.index, w.tid);
            self.wake(w.tid, Ok(Handoff::Block(block)));
        } else {
            s.in_use[block.index()] = false;
            s.free.push(block.index);
        }
        self.reschedule();
        Ok(())
    }

    /// Contents of an allocated block
    pub fn slab_data(&self, block: &SlabBlock) -> Option<&[u8]> {
        let s = self.slabs.get(block.slab.index())?;
        if !*s.in_use.get(block.index())? {
            return None;
        }
        Some(&s.buffer[s.range(block.index())])
    }

    pub fn slab_data_mut(&mut self, block: &SlabBlock) -> Option<&mut [u8]> {
        let s = self.slabs.get_mut(block.slab.index())?;
        if !*s.in_use.get(block.index())? {
            return None;
        }
        let range = s.range(block.index());
        Some(&mut s.buffer[range])
    }

    pub fn slab_num_free(&self, id: SlabId) -> Option<usize> {
        self.slabs.get(id.index()).map(|s| s.free.len())
    }

    pub fn slab_num_used(&self, id: SlabId) -> Option<usize> {
        self.slabs.get(id.index()).map(|s| s.num_blocks() - s.free.len())
    }

    /// Most blocks ever allocated at once
    pub fn slab_max_used(&self, id: SlabId) -> Option<usize> {
        self.slabs.get(id.index()).map(|s| s.max_used)
    }

    pub fn slab_block_size(&self, id: SlabId) -> Option<usize> {
        self.slabs.get(id.index()).map(|s| s.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{Priority, ThreadSpec};

    #[test]
    fn test_init_validation() {
        let mut k = Kernel::testing();
        assert_eq!(k.slab_init(0, 8), Err(KernelError::InvalidState));
        assert_eq!(k.slab_init(32, 0), Err(KernelError::InvalidState));
        let s = k.slab_init(32, 8).unwrap();
        assert_eq!(k.slab_num_free(s), Some(8));
        assert_eq!(k.slab_block_size(s), Some(32));
    }

    #[test]
    fn test_exhaust_and_free() {
        let mut k = Kernel::testing();
        let s = k.slab_init(32, 8).unwrap();
        let mut blocks = Vec::new();
        for i in 0..8u8 {
            let b = k.slab_alloc(s, Timeout::NoWait).unwrap().ready().unwrap();
            k.slab_data_mut(&b).unwrap().fill(i);
            blocks.push(b);
        }
        assert_eq!(k.slab_num_free(s), Some(0));
        assert_eq!(k.slab_alloc(s, Timeout::NoWait), Err(KernelError::WouldBlock));

        // blocks do not overlap
        for (i, b) in blocks.iter().enumerate() {
            assert!(k.slab_data(b).unwrap().iter().all(|&x| x == i as u8));
        }
        for b in blocks {
            k.slab_free(b).unwrap();
        }
        assert_eq!(k.slab_num_free(s), Some(8));
        assert_eq!(k.slab_num_used(s), Some(0));
        assert_eq!(k.slab_max_used(s), Some(8));
    }

    #[test]
    fn test_double_free_rejected() {
        let mut k = Kernel::testing();
        let s = k.slab_init(16, 2).unwrap();
        let b = k.slab_alloc(s, Timeout::NoWait).unwrap().ready().unwrap();
        k.slab_free(b.clone()).unwrap();
        assert_eq!(k.slab_data(&b), None);
        assert_eq!(k.slab_free(b), Err(KernelError::InvalidState));
        assert_eq!(k.slab_num_free(s), Some(2));
    }

    #[test]
    fn test_free_hands_block_to_waiter() {
        let mut k = Kernel::testing();
        let s = k.slab_init(8, 1).unwrap();
        let held = k.slab_alloc(s, Timeout::NoWait).unwrap().ready().unwrap();
        let t = k.spawn_with(ThreadSpec::new(b"alloc", Priority(2))).unwrap();
        assert!(k.slab_alloc(s, Timeout::Forever).unwrap().is_pending());

        k.irq_enter();
        k.slab_free(held.clone()).unwrap();
        k.irq_exit().unwrap();
        assert_eq!(k.current(), t);
        assert_eq!(k.take_wakeup(t), Some(Ok(Handoff::Block(held.clone()))));
        assert_eq!(k.slab_num_free(s), Some(0));
        assert!(k.slab_data(&held).is_some());
    }

    #[test]
    fn test_alloc_timeout() {
        let mut k = Kernel::testing();
        let s = k.slab_init(8, 1).unwrap();
        let _held = k.slab_alloc(s, Timeout::NoWait).unwrap();
        let t = k.spawn_with(ThreadSpec::new(b"alloc", Priority(2))).unwrap();
        assert!(k.slab_alloc(s, Timeout::Ticks(3)).unwrap().is_pending());
        for _ in 0..3 {
            k.on_tick();
        }
        assert_eq!(k.current(), t);
        assert_eq!(k.take_wakeup(t), Some(Err(KernelError::TimedOut)));
        assert_eq!(k.slab_num_free(s), Some(0));
    }

    #[test]
    fn test_blocking_alloc_from_isr_rejected() {
        let mut k = Kernel::testing();
        let s = k.slab_init(8, 1).unwrap();
        k.spawn_with(ThreadSpec::new(b"t", Priority(2))).unwrap();
        k.irq_enter();
        assert!(k.slab_alloc(s, Timeout::NoWait).is_ok());
        assert_eq!(k.slab_alloc(s, Timeout::Forever), Err(KernelError::ContextViolation));
        k.irq_exit().unwrap();
    }
}
