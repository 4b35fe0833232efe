//! Threads & Synchronization
//!
//! A fixed table of at most [`NTHR`] kernel threads, scheduled round-robin
//! by [`crate::kernel::sched`]. Slot 0 is the boot ("main") thread, the last
//! slot the idle thread. Threads, the ready list and every condition wait
//! list are linked intrusively: a thread's `list_next` slot index is valid
//! only while it sits on exactly one list.
//!
//! ## State machine
//!
//! ```text
//! uninitialized → ready → running ⇄ waiting
//!                   ↑       ↓
//!                   └── ready (yield / preempt)
//!                            ↓
//!                          exited
//! ```
//!
//! [`Condition`] provides FIFO wait lists with broadcast-only wakeup;
//! [`Lock`] is the recursive blocking mutex built on top. Locks still held
//! at thread exit are force-released by walking the owner's lock list.

use crate::arch::riscv64::context::{self, ThreadContext};
use crate::arch::riscv64::sync;
use crate::kernel::error::{KResult, KernelError};
use crate::kernel::lock::SpinLock;
use crate::kernel::process::Process;
use alloc::boxed::Box;
use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;

/// Maximum number of threads.
pub const NTHR: usize = 16;

/// Usable bytes of a thread's stack page.
pub const STACK_SIZE: usize = 4000;

/// Thread identifier: a slot index in the thread table.
pub type Tid = usize;

/// The boot thread.
pub const MAIN_TID: Tid = 0;

/// The idle thread, scheduled when nothing else is ready.
pub const IDLE_TID: Tid = NTHR - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Uninitialized,
    Waiting,
    Running,
    Ready,
    Exited,
}

impl ThreadState {
    pub const fn name(self) -> &'static str {
        match self {
            ThreadState::Uninitialized => "UNINITIALIZED",
            ThreadState::Waiting => "WAITING",
            ThreadState::Running => "RUNNING",
            ThreadState::Ready => "READY",
            ThreadState::Exited => "EXITED",
        }
    }
}

pub struct Thread {
    /// Saved context. Must stay the first field: the switch assembly indexes
    /// from the thread pointer.
    pub ctx: ThreadContext,
    pub id: Tid,
    pub name: &'static str,
    pub state: ThreadState,
    /// Lowest address of the stack page, null for threads on boot stacks.
    pub stack_lowest: *mut u8,
    pub parent: Option<Tid>,
    /// Intrusive link for the ready list or a condition wait list.
    list_next: Option<Tid>,
    /// Condition this thread is waiting on, for diagnostics.
    wait_cond: Option<NonNull<Condition>>,
    /// Head of the chain of locks this thread currently owns.
    lock_list: Option<NonNull<Lock>>,
    /// Owning process, if any.
    pub proc: Option<NonNull<Process>>,
}

impl Thread {
    fn new(id: Tid, name: &'static str) -> Self {
        Self {
            ctx: ThreadContext::zeroed(),
            id,
            name,
            state: ThreadState::Uninitialized,
            stack_lowest: core::ptr::null_mut(),
            parent: None,
            list_next: None,
            wait_cond: None,
            lock_list: None,
            proc: None,
        }
    }
}

/// FIFO list of threads, linked through `Thread::list_next`.
pub struct WaitList {
    head: Option<Tid>,
    tail: Option<Tid>,
}

impl WaitList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

type Slots = [Option<Box<Thread>>; NTHR];

fn tl_insert(slots: &mut Slots, list: &mut WaitList, tid: Tid) {
    slots[tid].as_mut().unwrap().list_next = None;

    match list.tail {
        Some(t) => slots[t].as_mut().unwrap().list_next = Some(tid),
        None => list.head = Some(tid),
    }
    list.tail = Some(tid);
}

fn tl_remove(slots: &mut Slots, list: &mut WaitList) -> Option<Tid> {
    let tid = list.head?;
    let thr = slots[tid].as_mut().unwrap();
    list.head = thr.list_next;
    thr.list_next = None;
    if list.head.is_none() {
        list.tail = None;
    }
    Some(tid)
}

/// Append all of `src` to the end of `dst` and clear `src`.
fn tl_append(slots: &mut Slots, dst: &mut WaitList, src: &mut WaitList) {
    if let Some(src_head) = src.head {
        match dst.tail {
            Some(t) => slots[t].as_mut().unwrap().list_next = Some(src_head),
            None => dst.head = Some(src_head),
        }
        dst.tail = src.tail;
    }
    src.head = None;
    src.tail = None;
}

// ============================================================================
// Thread table
// ============================================================================

pub struct ThreadTable {
    slots: Slots,
    /// Per-thread child-exit wait lists: a parent joins by waiting on its
    /// own entry; exiting children broadcast it.
    child_exit: [WaitList; NTHR],
    ready: WaitList,
    current: Tid,
    /// Thread we most recently switched away from; its stack is reaped here
    /// if it exited.
    prev: Tid,
    initialized: bool,
}

// SAFETY: raw pointers inside threads are only dereferenced under the table
// lock or by the owning thread.
unsafe impl Send for ThreadTable {}

impl ThreadTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; NTHR],
            child_exit: [const { WaitList::new() }; NTHR],
            ready: WaitList::new(),
            current: MAIN_TID,
            prev: MAIN_TID,
            initialized: false,
        }
    }

    /// Install the main and idle threads.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }

        let mut main = Box::new(Thread::new(MAIN_TID, "main"));
        main.state = ThreadState::Running;
        self.slots[MAIN_TID] = Some(main);

        let mut idle = Box::new(Thread::new(IDLE_TID, "idle"));
        idle.state = ThreadState::Ready;
        idle.parent = Some(MAIN_TID);
        idle.ctx.ra = context::startup_addr();
        idle.ctx.s[8] = crate::kernel::sched::idle_thread_entry as usize as u64;
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        {
            let stack = crate::kernel::pmm::alloc_phys_page();
            unsafe { core::ptr::write_bytes(stack, 0, STACK_SIZE) };
            idle.stack_lowest = stack;
            idle.ctx.sp = (stack as u64 + STACK_SIZE as u64) & !15;
        }
        self.slots[IDLE_TID] = Some(idle);

        let ThreadTable { slots, ready, .. } = self;
        tl_insert(slots, ready, IDLE_TID);

        self.current = MAIN_TID;
        self.initialized = true;
    }

    pub fn current(&self) -> Tid {
        self.current
    }

    pub fn set_current(&mut self, tid: Tid) {
        self.current = tid;
    }

    pub fn slot(&self, tid: Tid) -> Option<&Thread> {
        self.slots.get(tid).and_then(|s| s.as_deref())
    }

    pub fn slot_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.slots.get_mut(tid).and_then(|s| s.as_deref_mut())
    }

    pub fn state(&self, tid: Tid) -> ThreadState {
        self.slot(tid)
            .map_or(ThreadState::Uninitialized, |t| t.state)
    }

    pub fn set_state(&mut self, tid: Tid, state: ThreadState) {
        if let Some(thr) = self.slot_mut(tid) {
            crate::ktrace!("task", "state"; tid = tid, to = state.name());
            thr.state = state;
        }
    }

    /// Allocate a slot and seed a new thread so its first resume lands in
    /// the startup shim with `a0`/`a1` materialized and `entry` tail-called.
    pub fn spawn(
        &mut self,
        name: &'static str,
        entry: usize,
        a0: usize,
        a1: usize,
    ) -> KResult<Tid> {
        let mut tid = 1;
        while tid < IDLE_TID && self.slots[tid].is_some() {
            tid += 1;
        }
        if tid == IDLE_TID {
            return Err(KernelError::OutOfThreads);
        }

        let mut thr = Box::new(Thread::new(tid, name));
        thr.parent = Some(self.current);
        thr.state = ThreadState::Ready;
        thr.ctx.ra = context::startup_addr();
        thr.ctx.s[0] = a0 as u64;
        thr.ctx.s[1] = a1 as u64;
        thr.ctx.s[8] = entry as u64;
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        {
            let stack = crate::kernel::pmm::alloc_phys_page();
            unsafe { core::ptr::write_bytes(stack, 0, STACK_SIZE) };
            thr.stack_lowest = stack;
            thr.ctx.sp = (stack as u64 + STACK_SIZE as u64) & !15;
        }
        self.slots[tid] = Some(thr);

        let ThreadTable { slots, ready, .. } = self;
        tl_insert(slots, ready, tid);

        Ok(tid)
    }

    pub fn ready_insert(&mut self, tid: Tid) {
        let ThreadTable { slots, ready, .. } = self;
        tl_insert(slots, ready, tid);
    }

    pub fn ready_remove(&mut self) -> Option<Tid> {
        let ThreadTable { slots, ready, .. } = self;
        tl_remove(slots, ready)
    }

    pub fn ready_is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Move the current thread onto an external condition wait list.
    pub fn prepare_wait(&mut self, list: &mut WaitList, cond: Option<NonNull<Condition>>) {
        let cur = self.current;
        assert!(
            self.state(cur) == ThreadState::Running,
            "condition wait outside the running thread"
        );
        self.set_state(cur, ThreadState::Waiting);
        if let Some(thr) = self.slot_mut(cur) {
            thr.wait_cond = cond;
        }
        let ThreadTable { slots, .. } = self;
        tl_insert(slots, list, cur);
    }

    /// Move every waiter on `list` to the ready list, in wait order.
    pub fn broadcast(&mut self, list: &mut WaitList) {
        let ThreadTable { slots, ready, .. } = self;

        let mut cur = list.head;
        while let Some(tid) = cur {
            let thr = slots[tid].as_mut().unwrap();
            thr.state = ThreadState::Ready;
            thr.wait_cond = None;
            cur = thr.list_next;
        }

        tl_append(slots, ready, list);
    }

    /// Queue the current thread on `parent`'s child-exit list.
    pub fn prepare_wait_child(&mut self, parent: Tid) {
        let cur = self.current;
        assert!(self.state(cur) == ThreadState::Running);
        self.set_state(cur, ThreadState::Waiting);
        let ThreadTable {
            slots, child_exit, ..
        } = self;
        tl_insert(slots, &mut child_exit[parent], cur);
    }

    /// Wake every thread joined on `parent`'s children.
    pub fn broadcast_child_exit(&mut self, parent: Tid) {
        let ThreadTable {
            slots,
            child_exit,
            ready,
            ..
        } = self;

        let mut cur = child_exit[parent].head;
        while let Some(tid) = cur {
            let thr = slots[tid].as_mut().unwrap();
            thr.state = ThreadState::Ready;
            cur = thr.list_next;
        }
        tl_append(slots, ready, &mut child_exit[parent]);
    }

    /// Free an exited thread's slot. Its children are handed to their
    /// grandparent; a stack page not yet reaped by the scheduler is
    /// released here.
    pub fn reclaim(&mut self, tid: Tid) {
        assert!(tid != MAIN_TID && tid < NTHR);
        assert!(self.state(tid) == ThreadState::Exited);

        let parent = self.slot(tid).and_then(|t| t.parent);
        for ctid in 1..NTHR {
            if let Some(thr) = self.slot_mut(ctid) {
                if thr.parent == Some(tid) {
                    thr.parent = parent;
                }
            }
        }

        if let Some(thr) = self.slots[tid].take() {
            if !thr.stack_lowest.is_null() {
                crate::kernel::pmm::free_phys_page(thr.stack_lowest);
            }
        }
    }

    /// Reap the stack of the thread last switched away from, if it exited.
    pub fn reap_prev(&mut self) {
        let prev = self.prev;
        if self.state(prev) == ThreadState::Exited {
            if let Some(thr) = self.slot_mut(prev) {
                if !thr.stack_lowest.is_null() {
                    let stack = thr.stack_lowest;
                    thr.stack_lowest = core::ptr::null_mut();
                    crate::kernel::pmm::free_phys_page(stack);
                }
            }
        }
    }

    pub fn set_prev(&mut self, tid: Tid) {
        self.prev = tid;
    }

    pub fn ctx_ptr(&mut self, tid: Tid) -> *mut ThreadContext {
        let thr = self.slots[tid].as_mut().unwrap();
        &mut thr.ctx as *mut ThreadContext
    }
}

// ============================================================================
// Global table
// ============================================================================

static TABLE: SpinLock<ThreadTable> = SpinLock::new(ThreadTable::new());

/// Run `f` with the thread table locked. Must not be held across a
/// suspension point.
pub fn with_table<R, F: FnOnce(&mut ThreadTable) -> R>(f: F) -> R {
    let mut guard = TABLE.lock();
    f(&mut guard)
}

/// Install the main and idle threads. Idempotent.
pub fn init() {
    with_table(|t| t.init());
    crate::kinfo!("task", "init_ok"; nthr = NTHR);
}

/// Slot index of the running thread.
pub fn running_thread() -> Tid {
    with_table(|t| t.current())
}

pub fn thread_name(tid: Tid) -> &'static str {
    with_table(|t| t.slot(tid).map(|th| th.name).unwrap_or("?"))
}

pub fn running_thread_name() -> &'static str {
    thread_name(running_thread())
}

/// Create a thread. The entry function receives `a0` and `a1` once the
/// scheduler first resumes it, and exits the thread when it returns.
pub fn thread_spawn(
    name: &'static str,
    entry: extern "C" fn(usize, usize),
    a0: usize,
    a1: usize,
) -> KResult<Tid> {
    let tid = with_table(|t| t.spawn(name, entry as usize, a0, a1))?;
    crate::kdebug!("task", "spawned"; tid = tid, name = name);
    Ok(tid)
}

/// Yield the CPU to the next ready thread.
pub fn thread_yield() {
    crate::kernel::sched::suspend();
}

/// Terminate the running thread: broadcast the parent's child-exit
/// condition, release any still-held locks, and schedule away for good.
/// Exiting the main thread halts the machine.
pub fn thread_exit() -> ! {
    let cur = running_thread();

    if cur == MAIN_TID {
        crate::arch::riscv64::halt_success();
    }

    let parent = with_table(|t| t.slot(cur).and_then(|th| th.parent));
    if let Some(p) = parent {
        with_table(|t| t.broadcast_child_exit(p));
    }

    let mut held = with_table(|t| t.slot(cur).and_then(|th| th.lock_list));
    while let Some(l) = held {
        let lock = unsafe { l.as_ref() };
        held = lock.next.get();
        lock.release();
    }

    with_table(|t| t.set_state(cur, ThreadState::Exited));
    crate::kernel::sched::suspend();

    // An exited thread must never be scheduled again.
    crate::arch::riscv64::halt_failure();
}

#[no_mangle]
extern "C" fn _kestrel_thread_exit() -> ! {
    thread_exit()
}

/// Wait for a child thread to exit and reclaim its slot. `tid == 0` waits
/// for any child. Returns the reclaimed child's tid.
pub fn thread_join(tid: Tid) -> KResult<Tid> {
    if tid >= NTHR {
        return Err(KernelError::InvalidArg);
    }

    let cur = running_thread();

    let child_tid = if tid == 0 {
        with_table(|t| {
            (1..IDLE_TID).find(|&c| t.slot(c).is_some_and(|th| th.parent == Some(cur)))
        })
        .ok_or(KernelError::NoChild)?
    } else {
        tid
    };

    with_table(|t| match t.slot(child_tid) {
        Some(th) if th.parent == Some(cur) => Ok(()),
        _ => Err(KernelError::NoChild),
    })?;

    loop {
        let exited = with_table(|t| {
            if t.state(child_tid) == ThreadState::Exited {
                true
            } else {
                t.prepare_wait_child(cur);
                false
            }
        });
        if exited {
            break;
        }
        crate::kernel::sched::suspend();
    }

    with_table(|t| t.reclaim(child_tid));
    Ok(child_tid)
}

pub fn thread_process(tid: Tid) -> Option<NonNull<Process>> {
    with_table(|t| t.slot(tid).and_then(|th| th.proc))
}

pub fn running_thread_process() -> Option<NonNull<Process>> {
    thread_process(running_thread())
}

pub fn thread_set_process(tid: Tid, proc: Option<NonNull<Process>>) {
    with_table(|t| {
        if let Some(thr) = t.slot_mut(tid) {
            thr.proc = proc;
        }
    });
}

// ============================================================================
// Conditions
// ============================================================================

/// A condition variable: a named FIFO wait list. Wakeup is broadcast-only;
/// waiters reach the ready list in the order they began waiting.
pub struct Condition {
    name: &'static str,
    list: UnsafeCell<WaitList>,
}

// SAFETY: the wait list is only touched under the thread-table lock.
unsafe impl Send for Condition {}
unsafe impl Sync for Condition {}

impl Condition {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            list: UnsafeCell::new(WaitList::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block the running thread until the next broadcast.
    pub fn wait(&self) {
        with_table(|t| {
            let list = unsafe { &mut *self.list.get() };
            t.prepare_wait(list, Some(NonNull::from(self)));
        });
        crate::kernel::sched::suspend();
    }

    /// Move every waiter to the ready list. Safe to call from interrupt
    /// context; does not reschedule.
    pub fn broadcast(&self) {
        with_table(|t| {
            let list = unsafe { &mut *self.list.get() };
            t.broadcast(list);
        });
    }
}

// ============================================================================
// Locks
// ============================================================================

/// Recursive blocking mutex with strict ownership. Contended acquisition
/// waits on the lock's released condition, so hand-off follows condition
/// FIFO order. Each thread chains the locks it owns so exit can release
/// them.
pub struct Lock {
    released: Condition,
    owner: Cell<Option<Tid>>,
    count: Cell<u32>,
    /// Next lock in the owning thread's chain.
    next: Cell<Option<NonNull<Lock>>>,
}

// SAFETY: owner/count/next are only touched by the owning thread or under
// interrupt-disabled sections on a single hart.
unsafe impl Send for Lock {}
unsafe impl Sync for Lock {}

impl Lock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            released: Condition::new(name),
            owner: Cell::new(None),
            count: Cell::new(0),
            next: Cell::new(None),
        }
    }

    /// Acquire the lock, blocking while another thread owns it. Reentrant
    /// acquisition by the owner just increments the count.
    pub fn acquire(&self) {
        let cur = running_thread();

        if self.owner.get() == Some(cur) {
            self.count.set(self.count.get() + 1);
            return;
        }

        let pie = sync::disable_interrupts();
        while self.owner.get().is_some() {
            self.released.wait();
        }
        sync::restore_interrupts(pie);

        self.count.set(1);
        self.owner.set(Some(cur));

        with_table(|t| {
            if let Some(thr) = t.slot_mut(cur) {
                self.next.set(thr.lock_list);
                thr.lock_list = Some(NonNull::from(self));
            }
        });
    }

    /// Release one level of ownership. Releasing a lock the caller does not
    /// own is a programming error.
    pub fn release(&self) {
        let cur = running_thread();
        assert!(
            self.owner.get() == Some(cur),
            "lock released by non-owner"
        );

        self.count.set(self.count.get() - 1);
        if self.count.get() > 0 {
            return;
        }

        self.owner.set(None);

        with_table(|t| {
            if let Some(thr) = t.slot_mut(cur) {
                let target = Some(NonNull::from(self));
                if thr.lock_list == target {
                    thr.lock_list = self.next.get();
                } else {
                    let mut link = thr.lock_list;
                    while let Some(l) = link {
                        let l_ref = unsafe { l.as_ref() };
                        if l_ref.next.get() == target {
                            l_ref.next.set(self.next.get());
                            break;
                        }
                        link = l_ref.next.get();
                    }
                }
            }
        });

        self.released.broadcast();
    }

    /// Thread currently owning the lock.
    pub fn holder(&self) -> Option<Tid> {
        self.owner.get()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop_entry(_: usize, _: usize) {}

    fn table() -> ThreadTable {
        let mut t = ThreadTable::new();
        t.init();
        t
    }

    #[test]
    fn test_init_installs_main_and_idle() {
        let t = table();
        assert_eq!(t.state(MAIN_TID), ThreadState::Running);
        assert_eq!(t.state(IDLE_TID), ThreadState::Ready);
        assert_eq!(t.current(), MAIN_TID);
        assert!(!t.ready_is_empty());
    }

    #[test]
    fn test_spawn_fills_slots_in_order() {
        let mut t = table();
        for expect in 1..IDLE_TID {
            let tid = t.spawn("worker", noop_entry as usize, 0, 0).unwrap();
            assert_eq!(tid, expect);
            assert_eq!(t.state(tid), ThreadState::Ready);
            assert_eq!(t.slot(tid).unwrap().parent, Some(MAIN_TID));
        }
        assert_eq!(
            t.spawn("overflow", noop_entry as usize, 0, 0),
            Err(KernelError::OutOfThreads)
        );
    }

    #[test]
    fn test_spawn_seeds_context() {
        let mut t = table();
        let tid = t.spawn("seeded", 0x1234, 7, 9).unwrap();
        let thr = t.slot(tid).unwrap();
        assert_eq!(thr.ctx.s[0], 7);
        assert_eq!(thr.ctx.s[1], 9);
        assert_eq!(thr.ctx.s[8], 0x1234);
    }

    #[test]
    fn test_ready_list_is_fifo() {
        let mut t = table();
        let a = t.spawn("a", noop_entry as usize, 0, 0).unwrap();
        let b = t.spawn("b", noop_entry as usize, 0, 0).unwrap();
        let c = t.spawn("c", noop_entry as usize, 0, 0).unwrap();

        // Idle was queued first by init.
        assert_eq!(t.ready_remove(), Some(IDLE_TID));
        assert_eq!(t.ready_remove(), Some(a));
        assert_eq!(t.ready_remove(), Some(b));
        assert_eq!(t.ready_remove(), Some(c));
        assert_eq!(t.ready_remove(), None);
    }

    #[test]
    fn test_round_robin_rotation() {
        let mut t = table();
        let a = t.spawn("a", noop_entry as usize, 0, 0).unwrap();
        let b = t.spawn("b", noop_entry as usize, 0, 0).unwrap();
        let _ = t.ready_remove(); // drop idle for a clean rotation
        let mut order = Vec::new();

        // Each "schedule" pops the head and re-queues it, as yield does.
        for _ in 0..6 {
            let n = t.ready_remove().unwrap();
            order.push(n);
            t.ready_insert(n);
        }

        assert_eq!(order, vec![a, b, a, b, a, b]);
    }

    #[test]
    fn test_broadcast_moves_waiters_in_order() {
        let mut t = table();
        let a = t.spawn("a", noop_entry as usize, 0, 0).unwrap();
        let b = t.spawn("b", noop_entry as usize, 0, 0).unwrap();

        let mut list = WaitList::new();

        // Drain the ready list first: a thread waits while Running, never
        // while still queued.
        assert_eq!(t.ready_remove(), Some(IDLE_TID));
        assert_eq!(t.ready_remove(), Some(a));
        assert_eq!(t.ready_remove(), Some(b));

        t.set_state(a, ThreadState::Running);
        t.set_current(a);
        t.prepare_wait(&mut list, None);
        assert_eq!(t.state(a), ThreadState::Waiting);

        t.set_state(b, ThreadState::Running);
        t.set_current(b);
        t.prepare_wait(&mut list, None);

        t.set_current(MAIN_TID);
        t.broadcast(&mut list);
        assert!(list.is_empty());

        // Waiters reach the ready list in wait order.
        assert_eq!(t.ready_remove(), Some(a));
        assert_eq!(t.ready_remove(), Some(b));
        assert_eq!(t.ready_remove(), None);
        assert_eq!(t.state(a), ThreadState::Ready);
        assert_eq!(t.state(b), ThreadState::Ready);
    }

    #[test]
    fn test_broadcast_empty_list_is_noop() {
        let mut t = table();
        let mut list = WaitList::new();
        t.broadcast(&mut list);
        assert!(list.is_empty());
    }

    #[test]
    fn test_reclaim_reparents_children() {
        let mut t = table();
        let a = t.spawn("a", noop_entry as usize, 0, 0).unwrap();

        t.set_state(a, ThreadState::Running);
        t.set_current(a);
        let b = t.spawn("b", noop_entry as usize, 0, 0).unwrap();
        assert_eq!(t.slot(b).unwrap().parent, Some(a));

        t.set_current(MAIN_TID);
        t.set_state(a, ThreadState::Exited);
        t.reclaim(a);

        assert!(t.slot(a).is_none());
        assert_eq!(t.slot(b).unwrap().parent, Some(MAIN_TID));

        // The slot is reusable.
        let again = t.spawn("again", noop_entry as usize, 0, 0).unwrap();
        assert_eq!(again, a);
    }

    #[test]
    fn test_lock_recursive_acquire_release() {
        init();
        let lock = Lock::new("test.recursive");

        lock.acquire();
        lock.acquire();
        assert_eq!(lock.holder(), Some(running_thread()));

        lock.release();
        assert_eq!(lock.holder(), Some(running_thread()));
        lock.release();
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn test_lock_acquire_balance() {
        init();
        let lock = Lock::new("test.balance");
        for _ in 0..5 {
            lock.acquire();
        }
        for i in (0..5).rev() {
            lock.release();
            if i > 0 {
                assert!(lock.holder().is_some());
            }
        }
        assert_eq!(lock.holder(), None);
    }

    #[test]
    #[should_panic(expected = "non-owner")]
    fn test_release_unowned_lock_panics() {
        init();
        let lock = Lock::new("test.unowned");
        lock.release();
    }

    #[test]
    fn test_join_unrelated_thread_fails() {
        init();
        // Thread 0 has no child in slot 5 of the global table.
        assert_eq!(thread_join(5), Err(KernelError::NoChild));
        assert_eq!(thread_join(NTHR), Err(KernelError::InvalidArg));
    }
}
