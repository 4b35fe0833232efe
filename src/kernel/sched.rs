//! Scheduler
//!
//! Round-robin over the ready list with a timer-driven preemption point.
//! [`suspend`] is the single scheduling primitive: it parks the running
//! thread (re-queuing it when it is still runnable), picks the next ready
//! thread, switches address spaces when the target belongs to a process,
//! and context-switches. The first thing a thread does after being resumed
//! is reap the stack of an exited predecessor.
//!
//! The idle thread runs when the ready list is empty, sleeping in `wfi`
//! with interrupts enabled so timer and device interrupts can make other
//! threads runnable again.

use crate::arch::riscv64::sync;
use crate::kernel::task::{self, ThreadState};

/// Suspend the running thread and resume the next ready one. Returns when
/// the caller is scheduled again. A thread that is still `Running` is
/// rotated to the back of the ready list; a thread that blocked or exited
/// beforehand is simply switched away from.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn suspend() {
    use crate::arch::riscv64::context;
    use crate::kernel::addrspace;

    let pie = sync::disable_interrupts();

    let plan = task::with_table(|t| {
        let cur = t.current();

        if t.state(cur) == ThreadState::Running {
            t.set_state(cur, ThreadState::Ready);
            t.ready_insert(cur);
        }

        let next = match t.ready_remove() {
            Some(n) => n,
            None => {
                // Nothing else is runnable; keep going on the caller.
                t.set_state(cur, ThreadState::Running);
                return None;
            }
        };

        if next == cur {
            t.set_state(cur, ThreadState::Running);
            return None;
        }

        if let Some(proc) = t.slot(next).and_then(|th| th.proc) {
            let mtag = unsafe { proc.as_ref().mtag };
            addrspace::switch_mspace(mtag);
        }

        t.set_state(next, ThreadState::Running);
        t.set_prev(cur);
        t.set_current(next);

        Some((t.ctx_ptr(cur), t.ctx_ptr(next) as *const _))
    });

    if let Some((old, new)) = plan {
        // Interrupts come back on before the switch so a freshly spawned
        // thread starts its life with them enabled.
        sync::enable_interrupts();
        unsafe { context::switch(old, new) };
        // Back on this thread: reap the stack of whoever ran last if it
        // exited.
        task::with_table(|t| t.reap_prev());
    }

    sync::restore_interrupts(pie);
}

/// Host builds cannot transfer control between kernel threads: suspension
/// behaves as an immediate wakeup (the caller stays on the CPU and resumes
/// running), and the scheduling bookkeeping above it is exercised directly
/// through the thread-table methods.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn suspend() {
    task::with_table(|t| {
        let cur = t.current();
        if t.state(cur) != ThreadState::Exited {
            t.set_state(cur, ThreadState::Running);
        }
    });
}

/// Timer-interrupt preemption point: rotate to the next ready thread.
pub fn preempt() {
    suspend();
}

/// Body of the idle thread: yield while work exists, otherwise sleep in
/// `wfi`. Interrupts are disabled across the final emptiness check so a
/// wakeup cannot slip in between the check and the sleep.
pub extern "C" fn idle_thread_entry(_a0: usize, _a1: usize) {
    loop {
        while !task::with_table(|t| t.ready_is_empty()) {
            task::thread_yield();
        }

        sync::disable_interrupts();
        if task::with_table(|t| t.ready_is_empty()) {
            crate::arch::riscv64::csr::wfi();
        }
        sync::enable_interrupts();
    }
}
