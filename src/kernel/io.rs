//! Unified I/O Objects
//!
//! Every byte stream in the kernel (device, file, memory region, pipe
//! endpoint) presents the same operation set behind [`IoOps`]. Operations
//! an object does not implement fall through to `NotSupported`. Handles
//! ([`Io`]) are reference-counted: `addref` produces another handle to the
//! same object, dropping the last handle runs the object's close logic via
//! `Drop`.
//!
//! Control operations are typed commands ([`IoCmd`]) rather than an opaque
//! `(cmd, arg)` pair; every object answers `GetBlkSz` (default 1).
//!
//! Concrete objects here: [`NullIo`], [`MemIo`] and the position-adding
//! [`SeekIo`] wrapper. Pipes live in [`crate::kernel::pipe`], files in
//! [`crate::kernel::ktfs`].

use crate::kernel::error::{KResult, KernelError};
use crate::kernel::lock::SpinLock;
use crate::kernel::task::Lock;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;

/// Typed control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCmd {
    /// Transfer granularity in bytes; 1 for byte streams.
    GetBlkSz,
    /// Current end position (size).
    GetEnd,
    /// Grow or shrink to the given end position.
    SetEnd(u64),
    /// Current position (seekable objects only).
    GetPos,
    /// Move to the given position (seekable objects only).
    SetPos(u64),
}

/// Operations a byte-stream object may support.
pub trait IoOps: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> KResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn write(&self, _buf: &[u8]) -> KResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn readat(&self, _pos: u64, _buf: &mut [u8]) -> KResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn writeat(&self, _pos: u64, _buf: &[u8]) -> KResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn cntl(&self, cmd: IoCmd) -> KResult<u64> {
        match cmd {
            IoCmd::GetBlkSz => Ok(1),
            _ => Err(KernelError::NotSupported),
        }
    }
}

/// Reference-counted handle to an I/O object.
#[derive(Clone)]
pub struct Io {
    ops: Arc<dyn IoOps>,
}

impl core::fmt::Debug for Io {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Io").finish_non_exhaustive()
    }
}

impl Io {
    pub fn new<T: IoOps + 'static>(obj: T) -> Self {
        Self { ops: Arc::new(obj) }
    }

    /// Another handle to the same object.
    pub fn addref(&self) -> Io {
        self.clone()
    }

    /// Number of outstanding handles.
    pub fn refcnt(&self) -> usize {
        Arc::strong_count(&self.ops)
    }

    /// Drop this handle. The object's close logic runs when the last handle
    /// goes away.
    pub fn close(self) {}

    /// Read once from the object's cursor.
    pub fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        self.ops.read(buf)
    }

    /// Read repeatedly until the buffer is full or the stream ends.
    pub fn fill(&self, buf: &mut [u8]) -> KResult<usize> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.ops.read(&mut buf[pos..])?;
            if n == 0 {
                break;
            }
            pos += n;
        }
        Ok(pos)
    }

    /// Write, retrying until everything is consumed or the object stalls.
    pub fn write(&self, buf: &[u8]) -> KResult<usize> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.ops.write(&buf[pos..])?;
            if n == 0 {
                break;
            }
            pos += n;
        }
        Ok(pos)
    }

    pub fn readat(&self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        self.ops.readat(pos, buf)
    }

    pub fn writeat(&self, pos: u64, buf: &[u8]) -> KResult<usize> {
        self.ops.writeat(pos, buf)
    }

    pub fn cntl(&self, cmd: IoCmd) -> KResult<u64> {
        self.ops.cntl(cmd)
    }

    /// Transfer granularity of the object.
    pub fn blksz(&self) -> u64 {
        self.cntl(IoCmd::GetBlkSz).unwrap_or(1)
    }

    /// Reposition a seekable object.
    pub fn seek(&self, pos: u64) -> KResult<u64> {
        self.cntl(IoCmd::SetPos(pos))
    }
}

// ============================================================================
// Null object
// ============================================================================

/// Reads and writes complete immediately with zero bytes.
pub struct NullIo;

impl IoOps for NullIo {
    fn read(&self, _buf: &mut [u8]) -> KResult<usize> {
        Ok(0)
    }

    fn write(&self, _buf: &[u8]) -> KResult<usize> {
        Ok(0)
    }
}

/// A fresh handle to a null object.
pub fn create_null_io() -> Io {
    Io::new(NullIo)
}

// ============================================================================
// Memory-backed object
// ============================================================================

struct MemInner {
    data: Box<[u8]>,
    /// Logical end; never exceeds the capacity the object was created with.
    size: usize,
}

/// A bounded in-memory byte region with positioned reads and writes,
/// guarded by a blocking mutex.
pub struct MemIo {
    lock: Lock,
    inner: UnsafeCell<MemInner>,
}

// SAFETY: inner is only accessed while holding the mutex.
unsafe impl Send for MemIo {}
unsafe impl Sync for MemIo {}

impl MemIo {
    pub fn new(data: Box<[u8]>) -> Self {
        let size = data.len();
        Self {
            lock: Lock::new("memio"),
            inner: UnsafeCell::new(MemInner { data, size }),
        }
    }
}

impl IoOps for MemIo {
    fn readat(&self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        self.lock.acquire();
        let inner = unsafe { &*self.inner.get() };
        let result = if pos > inner.size as u64 {
            Err(KernelError::InvalidArg)
        } else {
            let pos = pos as usize;
            let n = buf.len().min(inner.size - pos);
            buf[..n].copy_from_slice(&inner.data[pos..pos + n]);
            Ok(n)
        };
        self.lock.release();
        result
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        self.lock.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        let result = if pos > inner.size as u64 {
            Err(KernelError::InvalidArg)
        } else {
            let pos = pos as usize;
            let n = buf.len().min(inner.size - pos);
            inner.data[pos..pos + n].copy_from_slice(&buf[..n]);
            Ok(n)
        };
        self.lock.release();
        result
    }

    fn cntl(&self, cmd: IoCmd) -> KResult<u64> {
        self.lock.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        let result = match cmd {
            IoCmd::GetBlkSz => Ok(1),
            IoCmd::GetEnd => Ok(inner.size as u64),
            IoCmd::SetEnd(end) => {
                // The end may move anywhere within the original capacity,
                // never beyond it.
                if end > inner.data.len() as u64 {
                    Err(KernelError::InvalidArg)
                } else {
                    inner.size = end as usize;
                    Ok(end)
                }
            }
            _ => Err(KernelError::NotSupported),
        };
        self.lock.release();
        result
    }
}

/// Wrap a byte region in an I/O object.
pub fn create_memory_io(data: Box<[u8]>) -> Io {
    Io::new(MemIo::new(data))
}

// ============================================================================
// Seekable wrapper
// ============================================================================

struct SeekInner {
    pos: u64,
    end: u64,
}

/// Adds a cursor over any backing object that supports positioned reads and
/// writes. Sequential transfers are truncated to whole blocks of the
/// backing's block size; writes past the end first grow the backing.
pub struct SeekIo {
    backing: Io,
    blksz: u64,
    inner: SpinLock<SeekInner>,
}

impl SeekIo {
    fn mask(&self, n: u64) -> u64 {
        n & !(self.blksz - 1)
    }
}

impl IoOps for SeekIo {
    fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        let (pos, len) = {
            let inner = self.inner.lock();
            let mut len = buf.len() as u64;
            if inner.end - inner.pos < len {
                len = inner.end - inner.pos;
            }
            if len == 0 {
                return Ok(0);
            }
            if len < self.blksz {
                return Err(KernelError::InvalidArg);
            }
            (inner.pos, self.mask(len))
        };

        let n = self.backing.readat(pos, &mut buf[..len as usize])?;
        self.inner.lock().pos = pos + n as u64;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if (buf.len() as u64) < self.blksz {
            return Err(KernelError::InvalidArg);
        }
        let len = self.mask(buf.len() as u64);

        let pos = {
            let inner = self.inner.lock();
            inner.pos
        };

        // Writing past the end grows the backing first.
        let end = self.inner.lock().end;
        if end - pos < len {
            let new_end = pos.checked_add(len).ok_or(KernelError::InvalidArg)?;
            self.backing.cntl(IoCmd::SetEnd(new_end))?;
            self.inner.lock().end = new_end;
        }

        let n = self.backing.writeat(pos, &buf[..len as usize])?;
        self.inner.lock().pos = pos + n as u64;
        Ok(n)
    }

    fn readat(&self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        self.backing.readat(pos, buf)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> KResult<usize> {
        self.backing.writeat(pos, buf)
    }

    fn cntl(&self, cmd: IoCmd) -> KResult<u64> {
        match cmd {
            IoCmd::GetBlkSz => Ok(self.blksz),
            IoCmd::GetPos => Ok(self.inner.lock().pos),
            IoCmd::SetPos(pos) => {
                let mut inner = self.inner.lock();
                if pos & (self.blksz - 1) != 0 || pos > inner.end {
                    Err(KernelError::InvalidArg)
                } else {
                    inner.pos = pos;
                    Ok(pos)
                }
            }
            IoCmd::GetEnd => Ok(self.inner.lock().end),
            IoCmd::SetEnd(end) => {
                let r = self.backing.cntl(IoCmd::SetEnd(end))?;
                self.inner.lock().end = end;
                Ok(r)
            }
        }
    }
}

/// Wrap `backing` in a seekable object. The backing must answer `GetBlkSz`
/// with a power of two and `GetEnd` with its size.
pub fn create_seekable_io(backing: Io) -> KResult<Io> {
    let blksz = backing.cntl(IoCmd::GetBlkSz)?;
    assert!(blksz > 0 && blksz & (blksz - 1) == 0);

    let end = backing.cntl(IoCmd::GetEnd)?;

    Ok(Io::new(SeekIo {
        backing,
        blksz,
        inner: SpinLock::new(SeekInner { pos: 0, end }),
    }))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(bytes: &[u8]) -> Io {
        create_memory_io(bytes.to_vec().into_boxed_slice())
    }

    #[test]
    fn test_null_io() {
        let io = create_null_io();
        let mut buf = [0u8; 8];
        assert_eq!(io.read(&mut buf), Ok(0));
        assert_eq!(io.write(&buf), Ok(0));
        assert_eq!(io.readat(0, &mut buf), Err(KernelError::NotSupported));
        assert_eq!(io.blksz(), 1);
    }

    #[test]
    fn test_refcnt_tracks_handles() {
        let io = create_null_io();
        assert_eq!(io.refcnt(), 1);
        let dup = io.addref();
        assert_eq!(io.refcnt(), 2);
        dup.close();
        assert_eq!(io.refcnt(), 1);
    }

    #[test]
    fn test_memio_readat_writeat() {
        let io = mem(b"0123456789");
        let mut buf = [0u8; 4];

        assert_eq!(io.readat(2, &mut buf), Ok(4));
        assert_eq!(&buf, b"2345");

        assert_eq!(io.writeat(8, b"XYZ"), Ok(2)); // clipped at the end
        let mut tail = [0u8; 2];
        assert_eq!(io.readat(8, &mut tail), Ok(2));
        assert_eq!(&tail, b"XY");
    }

    #[test]
    fn test_memio_bounds() {
        let io = mem(b"abcdef");
        let mut buf = [0u8; 4];

        assert_eq!(io.readat(7, &mut buf), Err(KernelError::InvalidArg));
        assert_eq!(io.readat(6, &mut buf), Ok(0));
        assert_eq!(io.readat(0, &mut []), Ok(0));
    }

    #[test]
    fn test_memio_setend() {
        let io = mem(b"abcdef");
        assert_eq!(io.cntl(IoCmd::GetEnd), Ok(6));
        assert_eq!(io.cntl(IoCmd::SetEnd(3)), Ok(3));
        assert_eq!(io.cntl(IoCmd::GetEnd), Ok(3));

        let mut buf = [0u8; 6];
        assert_eq!(io.readat(0, &mut buf), Ok(3));

        // Back up to capacity is fine; past it is not.
        assert_eq!(io.cntl(IoCmd::SetEnd(6)), Ok(6));
        assert_eq!(io.cntl(IoCmd::SetEnd(7)), Err(KernelError::InvalidArg));
    }

    #[test]
    fn test_seekio_sequential_read() {
        let io = create_seekable_io(mem(b"hello world")).unwrap();
        let mut buf = [0u8; 5];

        assert_eq!(io.read(&mut buf), Ok(5));
        assert_eq!(&buf, b"hello");
        assert_eq!(io.cntl(IoCmd::GetPos), Ok(5));

        assert_eq!(io.read(&mut buf), Ok(5));
        assert_eq!(&buf, b" worl");

        // Only one byte remains.
        assert_eq!(io.read(&mut buf), Ok(1));
        assert_eq!(buf[0], b'd');
        assert_eq!(io.read(&mut buf), Ok(0));
    }

    #[test]
    fn test_seekio_write_then_read_back() {
        let io = create_seekable_io(mem(&[0u8; 32])).unwrap();

        assert_eq!(io.write(b"abcdef"), Ok(6));
        assert_eq!(io.cntl(IoCmd::GetPos), Ok(6));

        assert_eq!(io.seek(0), Ok(0));
        let mut buf = [0u8; 6];
        assert_eq!(io.read(&mut buf), Ok(6));
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn test_seekio_setpos_rules() {
        let io = create_seekable_io(mem(&[0u8; 16])).unwrap();
        assert_eq!(io.seek(8), Ok(8));
        assert_eq!(io.seek(17), Err(KernelError::InvalidArg));
    }

    #[test]
    fn test_seekio_write_grows_backing_within_capacity() {
        let backing = mem(&[0u8; 64]);
        backing.cntl(IoCmd::SetEnd(8)).unwrap();
        let io = create_seekable_io(backing).unwrap();
        assert_eq!(io.cntl(IoCmd::GetEnd), Ok(8));

        // Write past the current end: the backing is grown first.
        assert_eq!(io.seek(8), Ok(8));
        assert_eq!(io.write(b"0123456789"), Ok(10));
        assert_eq!(io.cntl(IoCmd::GetEnd), Ok(18));

        assert_eq!(io.seek(8), Ok(8));
        let mut buf = [0u8; 10];
        assert_eq!(io.read(&mut buf), Ok(10));
        assert_eq!(&buf, b"0123456789");
    }

    #[test]
    fn test_seekio_passthrough_positioned_ops() {
        let io = create_seekable_io(mem(b"0123456789")).unwrap();
        let mut buf = [0u8; 3];

        assert_eq!(io.readat(4, &mut buf), Ok(3));
        assert_eq!(&buf, b"456");
        // The cursor is untouched by positioned access.
        assert_eq!(io.cntl(IoCmd::GetPos), Ok(0));
    }
}
