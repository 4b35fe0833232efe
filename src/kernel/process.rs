//! User Processes
//!
//! A process couples one thread with one address space and a bounded table
//! of I/O handles. The process table holds [`NPROC`] slots; slot 0 is the
//! boot process running the main thread in the main address space.
//!
//! `exec` replaces the current image: the user range is reset, an argument
//! stack page is built at the top of user memory, the executable is loaded
//! through the loader interface, and the thread drops to user mode. `fork`
//! clones the calling process (thread, address space, and I/O references),
//! handing the child a copy of the trap frame with a zeroed return value.

use crate::arch::riscv64::trap::{self, TrapFrame};
use crate::kernel::addrspace::{self, MTag, PteFlags, UMEM_END_VMA};
use crate::kernel::error::{KResult, KernelError};
use crate::kernel::io::{create_null_io, Io};
use crate::kernel::lock::SpinLock;
use crate::kernel::pmm::{self, PAGE_SIZE};
use crate::kernel::task::{self, Condition, Tid};
use alloc::boxed::Box;
use core::ptr::NonNull;

/// Maximum number of processes.
pub const NPROC: usize = 16;

/// I/O handles per process.
pub const PROCESS_IOMAX: usize = 16;

pub struct Process {
    pub idx: usize,
    pub tid: Tid,
    pub mtag: MTag,
    pub iotab: [Option<Io>; PROCESS_IOMAX],
}

impl Process {
    fn new(idx: usize, tid: Tid, mtag: MTag) -> Self {
        Self {
            idx,
            tid,
            mtag,
            iotab: [const { None }; PROCESS_IOMAX],
        }
    }
}

static PROCTAB: SpinLock<[Option<Box<Process>>; NPROC]> =
    SpinLock::new([const { None }; NPROC]);

/// Loader interface: resolves an executable image to its entry point in the
/// active address space. The ELF loader proper attaches here at boot.
static LOADER: SpinLock<Option<fn(&Io) -> KResult<usize>>> = SpinLock::new(None);

pub fn set_loader(f: fn(&Io) -> KResult<usize>) {
    *LOADER.lock() = Some(f);
}

/// Install the boot process: the main thread, the main address space, and
/// a null I/O at descriptor 0.
pub fn init() {
    let mut tab = PROCTAB.lock();
    if tab[0].is_some() {
        return;
    }

    let mut proc = Box::new(Process::new(0, task::MAIN_TID, addrspace::active_mspace()));
    proc.iotab[0] = Some(create_null_io());

    let ptr = NonNull::from(&mut *proc);
    tab[0] = Some(proc);
    drop(tab);

    task::thread_set_process(task::MAIN_TID, Some(ptr));
    crate::kinfo!("proc", "init_ok"; nproc = NPROC);
}

/// The calling thread's process.
pub fn current_process() -> Option<NonNull<Process>> {
    task::running_thread_process()
}

/// Run `f` on the calling thread's process.
pub fn with_current_process<R>(f: impl FnOnce(&mut Process) -> KResult<R>) -> KResult<R> {
    match current_process() {
        Some(mut p) => f(unsafe { p.as_mut() }),
        None => Err(KernelError::BadFd),
    }
}

/// Lay out `argv` on a fresh stack page: the pointer vector first, the
/// string bytes behind it, all positioned so the page can be mapped as the
/// highest user page. Returns the occupied stack size (16-byte aligned).
pub fn build_stack(stack: &mut [u8; PAGE_SIZE], argv: &[&str]) -> KResult<usize> {
    let argc = argv.len();

    // argv[] holds argc+1 pointers (the last is null) and must fit on the
    // page together with the strings.
    if PAGE_SIZE / core::mem::size_of::<u64>() - 1 < argc {
        return Err(KernelError::OutOfMemory);
    }

    let mut stksz = (argc + 1) * core::mem::size_of::<u64>();
    for arg in argv {
        let argsz = arg.len() + 1;
        if PAGE_SIZE - stksz < argsz {
            return Err(KernelError::OutOfMemory);
        }
        stksz += argsz;
    }

    stksz = (stksz + 15) & !15;

    let vec_base = PAGE_SIZE - stksz;
    let user_page = (UMEM_END_VMA - PAGE_SIZE) as u64;
    let mut str_off = vec_base + (argc + 1) * core::mem::size_of::<u64>();

    for (i, arg) in argv.iter().enumerate() {
        let user_ptr = user_page + str_off as u64;
        stack[vec_base + i * 8..vec_base + i * 8 + 8]
            .copy_from_slice(&user_ptr.to_le_bytes());
        stack[str_off..str_off + arg.len()].copy_from_slice(arg.as_bytes());
        stack[str_off + arg.len()] = 0;
        str_off += arg.len() + 1;
    }
    stack[vec_base + argc * 8..vec_base + argc * 8 + 8].copy_from_slice(&0u64.to_le_bytes());

    Ok(stksz)
}

/// Replace the current process image with the executable behind `exeio`.
/// On success control transfers to user mode and never returns.
pub fn process_exec(exeio: Io, argv: &[&str]) -> KResult<()> {
    let loader = (*LOADER.lock()).ok_or(KernelError::NotSupported)?;

    // Build the argument stack in a fresh frame, then swap the user range
    // underneath the current thread.
    let stack = pmm::alloc_phys_page();
    unsafe { core::ptr::write_bytes(stack, 0, PAGE_SIZE) };
    let stksz = build_stack(
        unsafe { &mut *(stack as *mut [u8; PAGE_SIZE]) },
        argv,
    )?;

    addrspace::reset_active_mspace();
    let stack_vma = UMEM_END_VMA - PAGE_SIZE;
    addrspace::map_range(
        stack_vma,
        PAGE_SIZE,
        stack,
        PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
    );

    let entry = loader(&exeio)?;
    exeio.close();

    let mut tfr = TrapFrame::for_user_entry(entry as u64, (UMEM_END_VMA - stksz) as u64);
    tfr.a[0] = argv.len() as u64;
    tfr.a[1] = (UMEM_END_VMA - stksz) as u64;

    crate::kdebug!("proc", "exec"; entry = entry, argc = argv.len());
    unsafe { trap::trap_frame_jump(&tfr) }
}

extern "C" fn fork_child_entry(forked: usize, tfr: usize) {
    let forked = unsafe { &*(forked as *const Condition) };
    let tfr = unsafe { &mut *(tfr as *mut TrapFrame) };

    tfr.a[0] = 0;
    forked.broadcast();
    unsafe { trap::trap_frame_jump(tfr) }
}

/// Clone the calling process. The child resumes from a copy of `tfr` with
/// a zero return value; the parent gets the child's tid.
pub fn process_fork(tfr: &TrapFrame) -> KResult<Tid> {
    let slot = {
        let tab = PROCTAB.lock();
        match (1..NPROC).find(|&i| tab[i].is_none()) {
            Some(i) => i,
            None => return Err(KernelError::OutOfProcs),
        }
    };

    let forked = Condition::new("child forked");
    let mut child_tfr = *tfr;

    let child_tid = task::thread_spawn(
        "fork child",
        fork_child_entry,
        &forked as *const Condition as usize,
        &mut child_tfr as *mut TrapFrame as usize,
    )?;

    let child_mtag = addrspace::clone_active_mspace();

    let mut proc = Box::new(Process::new(slot, child_tid, child_mtag));
    with_current_process(|parent| {
        for fd in 0..PROCESS_IOMAX {
            if let Some(io) = &parent.iotab[fd] {
                proc.iotab[fd] = Some(io.addref());
            }
        }
        Ok(())
    })?;

    let ptr = NonNull::from(&mut *proc);
    PROCTAB.lock()[slot] = Some(proc);
    task::thread_set_process(child_tid, Some(ptr));

    // The child copies the frame before it leaves the kernel; wait for it.
    forked.wait();

    Ok(child_tid)
}

/// Terminate the calling process: close its I/O handles, push filesystem
/// state to disk, tear down its address space, and exit the thread.
pub fn process_exit() -> ! {
    let (idx, tid) = match current_process() {
        Some(p) => {
            let p = unsafe { p.as_ref() };
            (p.idx, p.tid)
        }
        None => panic!("process exit without a process"),
    };

    if idx == 0 {
        panic!("main process exited");
    }

    with_current_process(|proc| {
        for fd in 0..PROCESS_IOMAX {
            if let Some(io) = proc.iotab[fd].take() {
                io.close();
            }
        }
        Ok(())
    })
    .ok();

    let _ = crate::kernel::ktfs::fs_flush();

    task::thread_set_process(tid, None);
    PROCTAB.lock()[idx] = None;

    addrspace::discard_active_mspace();
    task::thread_exit()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_stack_layout() {
        let mut page = Box::new([0u8; PAGE_SIZE]);
        let stksz = build_stack(&mut page, &["prog", "arg1"]).unwrap();

        // 3 pointers (argv[0], argv[1], null) + "prog\0" + "arg1\0",
        // rounded to 16.
        assert_eq!(stksz, (24 + 5 + 5 + 15) & !15);

        let vec_base = PAGE_SIZE - stksz;
        let p0 = u64::from_le_bytes(page[vec_base..vec_base + 8].try_into().unwrap());
        let p1 = u64::from_le_bytes(page[vec_base + 8..vec_base + 16].try_into().unwrap());
        let pn = u64::from_le_bytes(page[vec_base + 16..vec_base + 24].try_into().unwrap());

        let user_page = (UMEM_END_VMA - PAGE_SIZE) as u64;
        assert_eq!(p0, user_page + vec_base as u64 + 24);
        assert_eq!(p1, p0 + 5);
        assert_eq!(pn, 0);

        // The strings land behind the vector, terminated.
        let s0 = (p0 - user_page) as usize;
        assert_eq!(&page[s0..s0 + 5], b"prog\0");
        let s1 = (p1 - user_page) as usize;
        assert_eq!(&page[s1..s1 + 5], b"arg1\0");
    }

    #[test]
    fn test_build_stack_empty_argv() {
        let mut page = Box::new([0u8; PAGE_SIZE]);
        let stksz = build_stack(&mut page, &[]).unwrap();
        assert_eq!(stksz, 16); // one null pointer, aligned
    }

    #[test]
    fn test_build_stack_rejects_oversize() {
        let mut page = Box::new([0u8; PAGE_SIZE]);
        let long = "x".repeat(PAGE_SIZE);
        assert_eq!(
            build_stack(&mut page, &[&long]),
            Err(KernelError::OutOfMemory)
        );
    }
}
