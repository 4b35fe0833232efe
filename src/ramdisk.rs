//! RAM-Backed Block Device
//!
//! A memory-resident disk exposed through the unified I/O interface:
//! positioned reads and writes in arbitrary byte ranges, a 512-byte block
//! size, and a fixed capacity. It backs the block cache and filesystem in
//! tests and stands in for the virtio block transport at the same
//! interface.

use crate::kernel::error::{KResult, KernelError};
use crate::kernel::io::{Io, IoCmd, IoOps};
use crate::kernel::lock::SpinLock;
use alloc::vec;
use alloc::vec::Vec;

/// Device block size.
pub const BLOCK_SIZE: usize = 512;

pub struct RamDisk {
    data: SpinLock<Vec<u8>>,
}

impl RamDisk {
    /// A zero-filled disk of `blocks` blocks.
    pub fn new(blocks: usize) -> Self {
        Self {
            data: SpinLock::new(vec![0u8; blocks * BLOCK_SIZE]),
        }
    }

    /// A disk initialized from an image. The size is rounded up to a whole
    /// number of blocks.
    pub fn from_image(mut image: Vec<u8>) -> Self {
        let rounded = image.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        image.resize(rounded, 0);
        Self {
            data: SpinLock::new(image),
        }
    }
}

impl IoOps for RamDisk {
    fn readat(&self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        let data = self.data.lock();
        if pos > data.len() as u64 {
            return Err(KernelError::InvalidArg);
        }
        let pos = pos as usize;
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        Ok(n)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> KResult<usize> {
        let mut data = self.data.lock();
        if pos > data.len() as u64 {
            return Err(KernelError::InvalidArg);
        }
        let pos = pos as usize;
        let n = buf.len().min(data.len() - pos);
        data[pos..pos + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn cntl(&self, cmd: IoCmd) -> KResult<u64> {
        match cmd {
            IoCmd::GetBlkSz => Ok(BLOCK_SIZE as u64),
            IoCmd::GetEnd => Ok(self.data.lock().len() as u64),
            _ => Err(KernelError::NotSupported),
        }
    }
}

/// A fresh zero-filled ram disk handle.
pub fn create_ram_disk(blocks: usize) -> Io {
    Io::new(RamDisk::new(blocks))
}

/// A ram disk holding an existing image.
pub fn create_ram_disk_from(image: Vec<u8>) -> Io {
    Io::new(RamDisk::from_image(image))
}

// ============================================================================
// Tests
// ============================================================================
