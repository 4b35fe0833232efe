//! System Call Surface
//!
//! The trap path hands a [`TrapFrame`] to [`handle_syscall`]; the number in
//! `a7` selects the handler, `a0..a2` carry the operands, and the result
//! lands back in `a0` as a payload or negative errno. Every user pointer is
//! validated against the active address space before the kernel touches it:
//! at least `U`, plus `R` or `W` matching the direction of transfer.
//!
//! Descriptor hints of -1 mean "first free slot"; `pipe` refuses to place
//! both of its descriptors in the same slot.

use crate::kernel::addrspace::PteFlags;
use crate::kernel::device;
use crate::kernel::error::{errno_or, KResult, KernelError};
use crate::kernel::io::{Io, IoCmd};
use crate::kernel::ktfs;
use crate::kernel::pipe;
use crate::kernel::process::{self, PROCESS_IOMAX};
use crate::kernel::task;
use crate::kernel::timer;
use crate::kernel::uaccess;

use crate::arch::riscv64::trap::TrapFrame;

/// System call numbers.
pub mod scnum {
    pub const EXIT: u64 = 1;
    pub const EXEC: u64 = 2;
    pub const FORK: u64 = 3;
    pub const WAIT: u64 = 4;
    pub const PRINT: u64 = 5;
    pub const USLEEP: u64 = 6;
    pub const DEVOPEN: u64 = 7;
    pub const FSOPEN: u64 = 8;
    pub const FSCREATE: u64 = 9;
    pub const FSDELETE: u64 = 10;
    pub const CLOSE: u64 = 11;
    pub const READ: u64 = 12;
    pub const WRITE: u64 = 13;
    pub const IOCTL: u64 = 14;
    pub const PIPE: u64 = 15;
    pub const IODUP: u64 = 16;
}

/// Control command numbers of the user-facing ioctl.
pub mod ioctl {
    pub const GETBLKSZ: u64 = 1;
    pub const GETEND: u64 = 2;
    pub const SETEND: u64 = 3;
    pub const GETPOS: u64 = 4;
    pub const SETPOS: u64 = 5;
}

/// Dispatch the syscall in `tfr` and store the result. The saved pc is
/// advanced past the `ecall`.
pub fn handle_syscall(tfr: &mut TrapFrame) {
    tfr.sepc += 4;
    tfr.a[0] = syscall(tfr) as u64;
}

fn syscall(tfr: &TrapFrame) -> i64 {
    let (a0, a1, a2) = (tfr.a[0], tfr.a[1], tfr.a[2]);

    match tfr.a[7] {
        scnum::EXIT => process::process_exit(),
        scnum::EXEC => errno_or(sys_exec(a0 as i64, a1 as usize, a2 as usize).map(|_| 0i64)),
        scnum::FORK => errno_or(process::process_fork(tfr).map(|tid| tid as i64)),
        scnum::WAIT => errno_or(sys_wait(a0 as i64)),
        scnum::PRINT => errno_or(sys_print(a0 as usize).map(|_| 0i64)),
        scnum::USLEEP => {
            timer::sleep_us(a0);
            0
        }
        scnum::DEVOPEN => errno_or(sys_devopen(a0 as i64, a1 as usize, a2 as u32)),
        scnum::FSOPEN => errno_or(sys_fsopen(a0 as i64, a1 as usize)),
        scnum::FSCREATE => errno_or(sys_fscreate(a0 as usize).map(|_| 0i64)),
        scnum::FSDELETE => errno_or(sys_fsdelete(a0 as usize).map(|_| 0i64)),
        scnum::CLOSE => errno_or(sys_close(a0 as i64).map(|_| 0i64)),
        scnum::READ => errno_or(sys_read(a0 as i64, a1 as usize, a2 as usize)),
        scnum::WRITE => errno_or(sys_write(a0 as i64, a1 as usize, a2 as usize)),
        scnum::IOCTL => errno_or(sys_ioctl(a0 as i64, a1, a2 as usize)),
        scnum::PIPE => errno_or(sys_pipe(a0 as usize, a1 as usize).map(|_| 0i64)),
        scnum::IODUP => errno_or(sys_iodup(a0 as i64, a1 as i64)),
        _ => KernelError::NotSupported.to_errno(),
    }
}

// ── user-memory accessors (valid only after uaccess checks; the kernel
//    reaches user pages directly through SUM) ──

unsafe fn user_bytes<'a>(ptr: usize, len: usize) -> &'a [u8] {
    core::slice::from_raw_parts(ptr as *const u8, len)
}

unsafe fn user_bytes_mut<'a>(ptr: usize, len: usize) -> &'a mut [u8] {
    core::slice::from_raw_parts_mut(ptr as *mut u8, len)
}

/// Validate and borrow a user string.
fn user_str<'a>(ptr: usize) -> KResult<&'a str> {
    let len = uaccess::validate_user_str(ptr, PteFlags::USER)?;
    let bytes = unsafe { user_bytes(ptr, len) };
    core::str::from_utf8(bytes).map_err(|_| KernelError::InvalidArg)
}

fn read_user_u64(ptr: usize) -> KResult<u64> {
    uaccess::validate_user_range(ptr, 8, PteFlags::USER | PteFlags::READ)?;
    let b = unsafe { user_bytes(ptr, 8) };
    Ok(u64::from_le_bytes(b.try_into().unwrap()))
}

fn write_user_u64(ptr: usize, v: u64) -> KResult<()> {
    uaccess::validate_user_range(ptr, 8, PteFlags::USER | PteFlags::WRITE)?;
    unsafe { user_bytes_mut(ptr, 8) }.copy_from_slice(&v.to_le_bytes());
    Ok(())
}

fn read_user_i32(ptr: usize) -> KResult<i32> {
    uaccess::validate_user_range(ptr, 4, PteFlags::USER | PteFlags::READ)?;
    let b = unsafe { user_bytes(ptr, 4) };
    Ok(i32::from_le_bytes(b.try_into().unwrap()))
}

fn write_user_i32(ptr: usize, v: i32) -> KResult<()> {
    uaccess::validate_user_range(ptr, 4, PteFlags::USER | PteFlags::WRITE)?;
    unsafe { user_bytes_mut(ptr, 4) }.copy_from_slice(&v.to_le_bytes());
    Ok(())
}

// ── descriptor helpers ──

fn fd_io(fd: i64) -> KResult<Io> {
    if fd < 0 || fd >= PROCESS_IOMAX as i64 {
        return Err(KernelError::BadFd);
    }
    process::with_current_process(|proc| {
        proc.iotab[fd as usize]
            .as_ref()
            .map(Io::addref)
            .ok_or(KernelError::BadFd)
    })
}

/// Resolve a descriptor hint: -1 picks the first free slot, otherwise the
/// slot itself must be in range. Does not check occupancy of explicit
/// hints; installation overwrites.
fn resolve_fd_hint(hint: i64) -> KResult<usize> {
    if hint >= PROCESS_IOMAX as i64 {
        return Err(KernelError::BadFd);
    }
    if hint >= 0 {
        return Ok(hint as usize);
    }
    process::with_current_process(|proc| {
        (0..PROCESS_IOMAX)
            .find(|&fd| proc.iotab[fd].is_none())
            .ok_or(KernelError::OutOfFds)
    })
}

fn install_fd(fd: usize, io: Io) -> KResult<()> {
    process::with_current_process(|proc| {
        proc.iotab[fd] = Some(io);
        Ok(())
    })
}

// ── handlers ──

fn sys_exec(fd: i64, argc: usize, argv: usize) -> KResult<()> {
    let exeio = fd_io(fd)?;

    // The argv vector and each string it names must be readable before
    // anything is torn down.
    uaccess::validate_user_range(argv, argc * 8, PteFlags::USER | PteFlags::READ)?;
    let mut args: alloc::vec::Vec<&str> = alloc::vec::Vec::with_capacity(argc);
    for i in 0..argc {
        let ptr = read_user_u64(argv + i * 8)? as usize;
        args.push(user_str(ptr)?);
    }

    process::process_exec(exeio, &args)
}

fn sys_wait(tid: i64) -> KResult<i64> {
    if tid < 0 {
        return Err(KernelError::NoChild);
    }
    task::thread_join(tid as usize).map(|t| t as i64)
}

fn sys_print(msg: usize) -> KResult<()> {
    let s = user_str(msg)?;
    let tid = task::running_thread();
    crate::println!("Thread <{}:{}> says: {}", task::thread_name(tid), tid, s);
    Ok(())
}

fn sys_devopen(fd: i64, name: usize, instno: u32) -> KResult<i64> {
    let name = user_str(name)?;
    let fd = resolve_fd_hint(fd)?;
    let io = device::open_device(name, instno)?;
    install_fd(fd, io)?;
    Ok(fd as i64)
}

fn sys_fsopen(fd: i64, name: usize) -> KResult<i64> {
    let name = user_str(name)?;
    let fd = resolve_fd_hint(fd)?;
    let io = ktfs::fs_open(name)?;
    install_fd(fd, io)?;
    Ok(fd as i64)
}

fn sys_fscreate(name: usize) -> KResult<()> {
    let name = user_str(name)?;
    ktfs::fs_create(name)
}

fn sys_fsdelete(name: usize) -> KResult<()> {
    let name = user_str(name)?;
    ktfs::fs_delete(name)
}

fn sys_close(fd: i64) -> KResult<()> {
    if fd < 0 || fd >= PROCESS_IOMAX as i64 {
        return Err(KernelError::BadFd);
    }
    process::with_current_process(|proc| {
        match proc.iotab[fd as usize].take() {
            Some(io) => {
                io.close();
                Ok(())
            }
            None => Err(KernelError::BadFd),
        }
    })
}

fn sys_read(fd: i64, buf: usize, len: usize) -> KResult<i64> {
    uaccess::validate_user_range(buf, len, PteFlags::USER | PteFlags::WRITE)?;
    let io = fd_io(fd)?;

    let n = io.read(unsafe { user_bytes_mut(buf, len) })?;
    if n < len {
        return Err(KernelError::InvalidArg);
    }
    Ok(n as i64)
}

fn sys_write(fd: i64, buf: usize, len: usize) -> KResult<i64> {
    // A zero-length write is a flush idiom and carries no buffer.
    if len != 0 {
        uaccess::validate_user_range(buf, len, PteFlags::USER | PteFlags::READ)?;
    }
    let io = fd_io(fd)?;

    let n = io.write(unsafe { user_bytes(buf, len) })?;
    if n < len {
        return Err(KernelError::InvalidArg);
    }
    Ok(n as i64)
}

fn sys_ioctl(fd: i64, cmd: u64, arg: usize) -> KResult<i64> {
    let io = fd_io(fd)?;

    match cmd {
        ioctl::GETBLKSZ => io.cntl(IoCmd::GetBlkSz).map(|v| v as i64),
        ioctl::GETEND => {
            let v = io.cntl(IoCmd::GetEnd)?;
            write_user_u64(arg, v)?;
            Ok(0)
        }
        ioctl::SETEND => {
            let v = read_user_u64(arg)?;
            io.cntl(IoCmd::SetEnd(v))?;
            Ok(0)
        }
        ioctl::GETPOS => {
            let v = io.cntl(IoCmd::GetPos)?;
            write_user_u64(arg, v)?;
            Ok(0)
        }
        ioctl::SETPOS => {
            let v = read_user_u64(arg)?;
            io.cntl(IoCmd::SetPos(v))?;
            Ok(0)
        }
        _ => Err(KernelError::NotSupported),
    }
}

fn sys_pipe(wfd_ptr: usize, rfd_ptr: usize) -> KResult<()> {
    if wfd_ptr == 0 || rfd_ptr == 0 {
        return Err(KernelError::InvalidArg);
    }

    let whint = read_user_i32(wfd_ptr)? as i64;
    let rhint = read_user_i32(rfd_ptr)? as i64;
    if whint >= PROCESS_IOMAX as i64 || rhint >= PROCESS_IOMAX as i64 {
        return Err(KernelError::BadFd);
    }

    let (wfd, rfd) = process::with_current_process(|proc| {
        let wfd = if whint >= 0 {
            whint as usize
        } else {
            (0..PROCESS_IOMAX)
                .find(|&fd| proc.iotab[fd].is_none())
                .ok_or(KernelError::OutOfFds)?
        };
        let rfd = if rhint >= 0 {
            rhint as usize
        } else {
            (0..PROCESS_IOMAX)
                .find(|&fd| fd != wfd && proc.iotab[fd].is_none())
                .ok_or(KernelError::OutOfFds)?
        };
        Ok((wfd, rfd))
    })?;

    // Both ends in one slot would alias a single descriptor.
    if wfd == rfd {
        return Err(KernelError::InvalidArg);
    }

    let (wio, rio) = pipe::create_pipe();
    process::with_current_process(|proc| {
        proc.iotab[wfd] = Some(wio.addref());
        proc.iotab[rfd] = Some(rio.addref());
        Ok(())
    })?;

    write_user_i32(wfd_ptr, wfd as i32)?;
    write_user_i32(rfd_ptr, rfd as i32)?;
    Ok(())
}

fn sys_iodup(oldfd: i64, newfd: i64) -> KResult<i64> {
    if oldfd < 0 || oldfd >= PROCESS_IOMAX as i64 || newfd >= PROCESS_IOMAX as i64 {
        return Err(KernelError::BadFd);
    }

    let io = fd_io(oldfd)?;
    let newfd = resolve_fd_hint(newfd)?;
    install_fd(newfd, io)?;
    Ok(newfd as i64)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(num: u64, a0: u64, a1: u64, a2: u64) -> TrapFrame {
        let mut tfr = TrapFrame::zeroed();
        tfr.a[7] = num;
        tfr.a[0] = a0;
        tfr.a[1] = a1;
        tfr.a[2] = a2;
        tfr
    }

    #[test]
    fn test_unknown_syscall_is_enotsup() {
        crate::kernel::task::init();
        let mut tfr = frame(999, 0, 0, 0);
        handle_syscall(&mut tfr);
        assert_eq!(tfr.a[0] as i64, KernelError::NotSupported.to_errno());
        assert_eq!(tfr.sepc, 4);
    }

    #[test]
    fn test_fd_ops_without_process_fail() {
        crate::kernel::task::init();
        // The test thread has no process, so descriptor syscalls fail
        // cleanly rather than crashing.
        let mut tfr = frame(scnum::CLOSE, 3, 0, 0);
        handle_syscall(&mut tfr);
        assert_eq!(tfr.a[0] as i64, KernelError::BadFd.to_errno());

        let mut tfr = frame(scnum::CLOSE, u64::MAX, 0, 0);
        handle_syscall(&mut tfr);
        assert_eq!(tfr.a[0] as i64, KernelError::BadFd.to_errno());

        let mut tfr = frame(scnum::IODUP, 0, 99, 0);
        handle_syscall(&mut tfr);
        assert_eq!(tfr.a[0] as i64, KernelError::BadFd.to_errno());
    }

    #[test]
    fn test_wait_negative_tid_is_echild() {
        crate::kernel::task::init();
        let mut tfr = frame(scnum::WAIT, u64::MAX, 0, 0);
        handle_syscall(&mut tfr);
        assert_eq!(tfr.a[0] as i64, KernelError::NoChild.to_errno());
    }

    #[test]
    fn test_print_rejects_null_pointer() {
        crate::kernel::task::init();
        let mut tfr = frame(scnum::PRINT, 0, 0, 0);
        handle_syscall(&mut tfr);
        assert_eq!(tfr.a[0] as i64, KernelError::InvalidArg.to_errno());
    }

    #[test]
    fn test_pipe_rejects_null_pointers() {
        crate::kernel::task::init();
        let mut tfr = frame(scnum::PIPE, 0, 0, 0);
        handle_syscall(&mut tfr);
        assert_eq!(tfr.a[0] as i64, KernelError::InvalidArg.to_errno());
    }
}
