//! Sleep Alarms
//!
//! An [`Alarm`] pairs a condition with a wake time. Sleeping threads sit on
//! a single global list sorted by ascending wake time; the timer comparator
//! is always armed for the head. The timer interrupt walks the due prefix,
//! broadcasting each alarm's condition, then re-arms for the new head or
//! disarms timer interrupts entirely when the list empties.
//!
//! Wake times accumulate: `sleep(tcnt)` advances the alarm's deadline by
//! `tcnt` ticks relative to the previous deadline (saturating), so periodic
//! sleepers do not drift. [`Alarm::reset`] re-bases the deadline to now.

use crate::arch::riscv64::csr;
use crate::arch::riscv64::sync::IrqGuard;
use crate::arch::riscv64::timer as hw;
use crate::kernel::task::Condition;
use core::cell::Cell;
use core::ptr::NonNull;

pub use hw::TIMER_FREQ;

pub struct Alarm {
    cond: Condition,
    twake: Cell<u64>,
    next: Cell<Option<NonNull<Alarm>>>,
}

// SAFETY: list fields are only touched inside interrupt-disabled sections.
unsafe impl Send for Alarm {}
unsafe impl Sync for Alarm {}

struct SleepList {
    head: Option<NonNull<Alarm>>,
}

unsafe impl Send for SleepList {}

static SLEEP_LIST: crate::kernel::lock::SpinLock<SleepList> =
    crate::kernel::lock::SpinLock::new(SleepList { head: None });

impl Alarm {
    /// A fresh alarm whose deadline base is the current time.
    pub fn new(name: &'static str) -> Self {
        Self {
            cond: Condition::new(name),
            twake: Cell::new(csr::rdtime()),
            next: Cell::new(None),
        }
    }

    /// Re-base the deadline so the next sleep is relative to now.
    pub fn reset(&self) {
        self.twake.set(csr::rdtime());
    }

    /// Sleep until `tcnt` ticks past the previous deadline. Returns
    /// immediately when that moment has already passed.
    pub fn sleep(&self, tcnt: u64) {
        let now = csr::rdtime();
        self.twake.set(self.twake.get().saturating_add(tcnt));

        if self.twake.get() <= now {
            return;
        }

        {
            let mut list = SLEEP_LIST.lock();
            insert_sorted(&mut list, self);
            if list.head == Some(NonNull::from(self)) {
                hw::set_timecmp(self.twake.get());
            }
        }

        csr::csrs_sie(csr::SIE_STIE);
        self.cond.wait();

        // Normally the interrupt handler has already unlinked us before the
        // broadcast; drop a stale entry if the wait ended any other way.
        let mut list = SLEEP_LIST.lock();
        unlink(&mut list, self);
    }

    /// Sleep in units of seconds.
    pub fn sleep_sec(&self, sec: u64) {
        self.sleep(sec * TIMER_FREQ);
    }

    /// Sleep in units of milliseconds.
    pub fn sleep_ms(&self, ms: u64) {
        self.sleep(ms * (TIMER_FREQ / 1_000));
    }

    /// Sleep in units of microseconds.
    pub fn sleep_us(&self, us: u64) {
        self.sleep(us * (TIMER_FREQ / 1_000_000));
    }
}

fn insert_sorted(list: &mut SleepList, al: &Alarm) {
    let twake = al.twake.get();

    let mut prev: Option<NonNull<Alarm>> = None;
    let mut cur = list.head;
    while let Some(c) = cur {
        if unsafe { c.as_ref() }.twake.get() >= twake {
            break;
        }
        prev = cur;
        cur = unsafe { c.as_ref() }.next.get();
    }

    al.next.set(cur);
    match prev {
        Some(p) => unsafe { p.as_ref() }.next.set(Some(NonNull::from(al))),
        None => list.head = Some(NonNull::from(al)),
    }
}

fn unlink(list: &mut SleepList, al: &Alarm) {
    let target = Some(NonNull::from(al));

    if list.head == target {
        list.head = al.next.get();
        al.next.set(None);
        return;
    }

    let mut cur = list.head;
    while let Some(c) = cur {
        let c_ref = unsafe { c.as_ref() };
        if c_ref.next.get() == target {
            c_ref.next.set(al.next.get());
            al.next.set(None);
            return;
        }
        cur = c_ref.next.get();
    }
}

/// Timer interrupt service routine: wake the due prefix of the sleep list,
/// then either re-arm the comparator for the new head or disarm timer
/// interrupts when no alarms remain.
pub fn handle_timer_interrupt() {
    let now = csr::rdtime();
    let _irq = IrqGuard::new();

    loop {
        let due = {
            let mut list = SLEEP_LIST.lock();
            match list.head {
                Some(head) if unsafe { head.as_ref() }.twake.get() <= now => {
                    let head_ref = unsafe { head.as_ref() };
                    list.head = head_ref.next.get();
                    head_ref.next.set(None);
                    Some(head)
                }
                _ => None,
            }
        };

        match due {
            Some(al) => unsafe { al.as_ref() }.cond.broadcast(),
            None => break,
        }
    }

    let list = SLEEP_LIST.lock();
    match list.head {
        None => csr::csrc_sie(csr::SIE_STIE),
        Some(head) => hw::set_timecmp(unsafe { head.as_ref() }.twake.get()),
    }
}

/// Park the timer comparator until the first alarm arms it.
pub fn init() {
    hw::set_timecmp(u64::MAX);
    crate::kinfo!("timer", "init_ok"; freq = TIMER_FREQ);
}

/// Sleep the calling thread for `us` microseconds.
pub fn sleep_us(us: u64) {
    let al = Alarm::new("sleep");
    al.sleep_us(us);
}

/// Sleep the calling thread for `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    sleep_us(1_000 * ms);
}

/// Sleep the calling thread for `sec` seconds.
pub fn sleep_sec(sec: u64) {
    sleep_ms(1_000 * sec);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // The sleep list, time model and comparator are process-global, so all
    // list assertions live in this single test.
    #[test]
    fn test_sleep_list_ordering_and_isr() {
        crate::kernel::task::init();
        csr::set_time(1_000);

        let a = Alarm::new("a");
        let b = Alarm::new("b");
        let c = Alarm::new("c");
        a.twake.set(3_000);
        b.twake.set(2_000);
        c.twake.set(4_000);

        {
            let mut list = SLEEP_LIST.lock();
            insert_sorted(&mut list, &a);
            insert_sorted(&mut list, &b);
            insert_sorted(&mut list, &c);

            // Sorted ascending by wake time: b, a, c.
            let head = list.head.unwrap();
            assert_eq!(unsafe { head.as_ref() }.twake.get(), 2_000);
            let second = unsafe { head.as_ref() }.next.get().unwrap();
            assert_eq!(unsafe { second.as_ref() }.twake.get(), 3_000);
            let third = unsafe { second.as_ref() }.next.get().unwrap();
            assert_eq!(unsafe { third.as_ref() }.twake.get(), 4_000);
        }

        // Nothing due yet: the head stays and the comparator tracks it.
        handle_timer_interrupt();
        {
            let list = SLEEP_LIST.lock();
            assert_eq!(
                list.head.map(|h| unsafe { h.as_ref() }.twake.get()),
                Some(2_000)
            );
        }
        assert_eq!(hw::timecmp(), 2_000);

        // Advance past b and a: exactly the due prefix is popped.
        csr::set_time(3_500);
        handle_timer_interrupt();
        {
            let list = SLEEP_LIST.lock();
            assert_eq!(
                list.head.map(|h| unsafe { h.as_ref() }.twake.get()),
                Some(4_000)
            );
        }
        assert_eq!(hw::timecmp(), 4_000);

        // Drain the last alarm: the list empties and the timer disarms.
        csr::set_time(10_000);
        handle_timer_interrupt();
        assert!(SLEEP_LIST.lock().head.is_none());
        assert_eq!(csr::csrr_sie() & csr::SIE_STIE, 0);

        // An already-elapsed deadline returns without touching the list.
        let d = Alarm::new("d");
        d.twake.set(5);
        d.sleep(10);
        assert!(SLEEP_LIST.lock().head.is_none());

        // Saturating accumulation pins the deadline at the maximum. The
        // host wait model returns immediately, and the alarm unlinks itself
        // on the way out.
        let e = Alarm::new("e");
        e.sleep(u64::MAX);
        assert_eq!(e.twake.get(), u64::MAX);
        assert!(SLEEP_LIST.lock().head.is_none());

        // Reset re-bases the deadline to the current time.
        csr::set_time(20_000);
        let f = Alarm::new("f");
        csr::set_time(25_000);
        f.reset();
        assert_eq!(f.twake.get(), 25_000);
    }
}
