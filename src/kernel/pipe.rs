//! In-Kernel Pipes
//!
//! A bounded single-producer/single-consumer byte ring of one page, shared
//! by a write endpoint and a read endpoint. The two endpoints are
//! independent I/O objects with their own refcounts; the ring lives exactly
//! as long as the longer-lived endpoint.
//!
//! Indices are 16-bit and wrap modularly: the ring is empty when
//! `head == tail` and full when `tail - head == PIPE_BUFSZ`. A compiler
//! fence orders each data byte before the index store that publishes it.
//!
//! Close semantics: closing either endpoint broadcasts both conditions so
//! a blocked peer re-checks. After the writer closes, reads drain whatever
//! remains and then return 0 (end of stream); once the reader closes,
//! writes fail with `PipeClosed`.

use crate::arch::riscv64::sync;
use crate::kernel::error::{KResult, KernelError};
use crate::kernel::io::{Io, IoOps};
use crate::kernel::task::Condition;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{compiler_fence, AtomicBool, Ordering};

/// Ring capacity: one page.
pub const PIPE_BUFSZ: usize = 4096;

struct Ring {
    buf: Box<[u8; PIPE_BUFSZ]>,
    head: u16,
    tail: u16,
}

impl Ring {
    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        self.tail.wrapping_sub(self.head) as usize == PIPE_BUFSZ
    }

    fn putc(&mut self, c: u8) {
        let tail = self.tail;
        self.buf[tail as usize % PIPE_BUFSZ] = c;
        compiler_fence(Ordering::SeqCst);
        self.tail = tail.wrapping_add(1);
    }

    fn getc(&mut self) -> u8 {
        let head = self.head;
        let c = self.buf[head as usize % PIPE_BUFSZ];
        compiler_fence(Ordering::SeqCst);
        self.head = head.wrapping_add(1);
        c
    }
}

struct PipeShared {
    ring: UnsafeCell<Ring>,
    /// Signaled when data arrives (readers wait here).
    buf_empty: Condition,
    /// Signaled when space frees up (writers wait here).
    buf_full: Condition,
    writer_open: AtomicBool,
    reader_open: AtomicBool,
}

// SAFETY: the ring is touched by one producer and one consumer, each inside
// interrupt-disabled sections on a single hart.
unsafe impl Send for PipeShared {}
unsafe impl Sync for PipeShared {}

/// Write endpoint of a pipe.
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

/// Read endpoint of a pipe.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

fn pipe_endpoints() -> (PipeWriter, PipeReader) {
    let shared = Arc::new(PipeShared {
        ring: UnsafeCell::new(Ring {
            buf: Box::new([0; PIPE_BUFSZ]),
            head: 0,
            tail: 0,
        }),
        buf_empty: Condition::new("pipe.buf_empty"),
        buf_full: Condition::new("pipe.buf_full"),
        writer_open: AtomicBool::new(true),
        reader_open: AtomicBool::new(true),
    });

    let writer = PipeWriter {
        shared: shared.clone(),
    };
    (writer, PipeReader { shared })
}

/// Create a pipe, returning `(write, read)` endpoints each holding one
/// reference.
pub fn create_pipe() -> (Io, Io) {
    let (writer, reader) = pipe_endpoints();
    (Io::new(writer), Io::new(reader))
}

impl IoOps for PipeWriter {
    fn write(&self, buf: &[u8]) -> KResult<usize> {
        let shared = &*self.shared;

        if !shared.reader_open.load(Ordering::Acquire) {
            return Err(KernelError::PipeClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        // At most one page per call; the caller loops for more.
        let len = buf.len().min(PIPE_BUFSZ);

        let mut written = 0;
        while written < len {
            let pie = sync::disable_interrupts();
            let ring = unsafe { &mut *shared.ring.get() };
            while ring.is_full() {
                shared.buf_full.wait();
                if !shared.reader_open.load(Ordering::Acquire) {
                    sync::restore_interrupts(pie);
                    return Err(KernelError::PipeClosed);
                }
            }
            ring.putc(buf[written]);
            sync::restore_interrupts(pie);
            written += 1;
        }

        shared.buf_empty.broadcast();
        Ok(len)
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.writer_open.store(false, Ordering::Release);
        self.shared.buf_full.broadcast();
        self.shared.buf_empty.broadcast();
    }
}

impl IoOps for PipeReader {
    fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        let shared = &*self.shared;

        if buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len().min(PIPE_BUFSZ);

        let pie = sync::disable_interrupts();
        let ring = unsafe { &mut *shared.ring.get() };

        // Block while empty and the writer is still alive; a closed writer
        // with a drained ring is end of stream.
        while ring.is_empty() {
            if !shared.writer_open.load(Ordering::Acquire) {
                sync::restore_interrupts(pie);
                return Ok(0);
            }
            shared.buf_empty.wait();
        }

        let mut count = 0;
        loop {
            buf[count] = ring.getc();
            count += 1;
            if ring.is_empty() || count >= len {
                break;
            }
        }
        sync::restore_interrupts(pie);

        shared.buf_full.broadcast();
        Ok(count)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.reader_open.store(false, Ordering::Release);
        self.shared.buf_full.broadcast();
        self.shared.buf_empty.broadcast();
    }
}

// ============================================================================
// Tests
// ============================================================================
