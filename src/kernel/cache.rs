//! Write-Back Block Cache
//!
//! A fixed array of [`CACHE_CAPACITY`] slots in front of a block device,
//! each holding one 512-byte block plus `USED`/`DIRTY`/`VALID` flag bits
//! and a blocking per-slot lock. Replacement is the clock (second-chance)
//! policy: the hand clears `USED` as it passes and evicts the first slot
//! found without it, writing a dirty victim back before reload.
//!
//! Writes only mark the slot dirty; the device is updated when the slot is
//! evicted or explicitly released with write-back, so a dirty slot's
//! contents always supersede the device for that block. `flush` releases
//! every slot with write-back and leaves nothing dirty.

use crate::kernel::error::{KResult, KernelError};
use crate::kernel::io::Io;
use crate::kernel::task::{self, Lock};
use alloc::boxed::Box;
use alloc::vec;
use bitflags::bitflags;

/// Number of cache slots.
pub const CACHE_CAPACITY: usize = 64;

/// Cached block size in bytes.
pub const CACHE_BLKSZ: usize = 512;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct SlotFlags: u8 {
        /// Referenced since the hand last passed.
        const USED  = 1 << 0;
        /// Contents newer than the backing device.
        const DIRTY = 1 << 1;
        /// Holds a block image.
        const VALID = 1 << 2;
    }
}

struct Slot {
    block_id: u64,
    flags: SlotFlags,
}

/// The cache over one backing block device.
pub struct BlockCache {
    backing: Io,
    slots: [Slot; CACHE_CAPACITY],
    data: Box<[[u8; CACHE_BLKSZ]]>,
    locks: [Lock; CACHE_CAPACITY],
    clock: usize,
    last_read: usize,
}

impl BlockCache {
    /// Build a cold cache over `backing`, which must support positioned
    /// reads and writes in 512-byte blocks.
    pub fn new(backing: Io) -> Self {
        Self {
            backing,
            slots: core::array::from_fn(|_| Slot {
                block_id: 0,
                flags: SlotFlags::empty(),
            }),
            data: vec![[0u8; CACHE_BLKSZ]; CACHE_CAPACITY].into_boxed_slice(),
            locks: [const { Lock::new("cache.slot") }; CACHE_CAPACITY],
            clock: 0,
            last_read: 0,
        }
    }

    /// Slot index most recently returned by [`get_block`].
    pub fn last_read_index(&self) -> usize {
        self.last_read
    }

    /// Pin the block at byte position `pos` (block-aligned) into a slot,
    /// taking the slot lock. On a miss the clock hand picks a victim,
    /// writing it back if dirty, and the block is loaded from the device.
    pub fn get_block(&mut self, pos: u64) -> KResult<usize> {
        if pos % CACHE_BLKSZ as u64 != 0 {
            return Err(KernelError::InvalidArg);
        }
        let block_id = pos / CACHE_BLKSZ as u64;

        // Hit: a valid slot already holds this block.
        for i in 0..CACHE_CAPACITY {
            if self.slots[i].flags.contains(SlotFlags::VALID)
                && self.slots[i].block_id == block_id
            {
                self.locks[i].acquire();
                self.slots[i].flags |= SlotFlags::USED;
                self.last_read = i;
                return Ok(i);
            }
        }

        // Miss: advance the hand, clearing USED, until a cold slot shows up.
        while self.slots[self.clock].flags.contains(SlotFlags::USED) {
            self.slots[self.clock].flags -= SlotFlags::USED;
            self.clock = (self.clock + 1) % CACHE_CAPACITY;
        }
        let idx = self.clock;

        self.locks[idx].acquire();

        // Evict: a dirty victim reaches the device before it is replaced.
        if self.slots[idx].flags.contains(SlotFlags::VALID | SlotFlags::DIRTY) {
            if let Err(e) = self.writeback(idx) {
                self.locks[idx].release();
                return Err(e);
            }
        }

        let n = match self.backing.readat(pos, &mut self.data[idx]) {
            Ok(n) => n,
            Err(e) => {
                self.locks[idx].release();
                return Err(e);
            }
        };
        if n != CACHE_BLKSZ {
            self.locks[idx].release();
            return Err(KernelError::Io);
        }

        self.slots[idx].block_id = block_id;
        self.slots[idx].flags = SlotFlags::USED | SlotFlags::VALID;
        self.last_read = idx;
        Ok(idx)
    }

    /// Data of a pinned slot.
    pub fn block_data(&mut self, idx: usize) -> &mut [u8; CACHE_BLKSZ] {
        &mut self.data[idx]
    }

    /// Copy out of the containing block. Transfers at most to the end of
    /// the block; the caller iterates.
    pub fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        let block_pos = pos / CACHE_BLKSZ as u64 * CACHE_BLKSZ as u64;
        let off = (pos % CACHE_BLKSZ as u64) as usize;
        let n = buf.len().min(CACHE_BLKSZ - off);

        let idx = self.get_block(block_pos)?;
        buf[..n].copy_from_slice(&self.data[idx][off..off + n]);
        self.release_block(idx, false)?;
        Ok(n)
    }

    /// Copy into the containing block and mark it dirty. Single block per
    /// call, like [`readat`].
    pub fn writeat(&mut self, pos: u64, buf: &[u8]) -> KResult<usize> {
        let block_pos = pos / CACHE_BLKSZ as u64 * CACHE_BLKSZ as u64;
        let off = (pos % CACHE_BLKSZ as u64) as usize;
        let n = buf.len().min(CACHE_BLKSZ - off);

        let idx = self.get_block(block_pos)?;
        self.data[idx][off..off + n].copy_from_slice(&buf[..n]);
        self.slots[idx].flags |= SlotFlags::DIRTY;
        self.release_block(idx, false)?;
        Ok(n)
    }

    /// Release a pinned slot. With `writeback`, a dirty slot is flushed to
    /// the device and its dirty bit cleared. The slot lock is dropped iff
    /// the calling thread holds it.
    pub fn release_block(&mut self, idx: usize, writeback: bool) -> KResult<()> {
        let result = if writeback && self.slots[idx].flags.contains(SlotFlags::DIRTY) {
            self.writeback(idx)
        } else {
            Ok(())
        };

        if self.locks[idx].holder() == Some(task::running_thread()) {
            self.locks[idx].release();
        }
        result
    }

    /// Write every dirty slot back to the device.
    pub fn flush(&mut self) -> KResult<()> {
        for i in 0..CACHE_CAPACITY {
            self.release_block(i, true)?;
        }
        Ok(())
    }

    fn writeback(&mut self, idx: usize) -> KResult<()> {
        let pos = self.slots[idx].block_id * CACHE_BLKSZ as u64;
        let n = self.backing.writeat(pos, &self.data[idx])?;
        if n != CACHE_BLKSZ {
            return Err(KernelError::Io);
        }
        self.slots[idx].flags -= SlotFlags::DIRTY;
        Ok(())
    }

    #[cfg(test)]
    fn dirty_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.flags.contains(SlotFlags::DIRTY))
            .count()
    }
}

// ============================================================================
// Tests
// ============================================================================
