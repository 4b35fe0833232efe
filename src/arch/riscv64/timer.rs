//! Timer comparator
//!
//! The S-mode timer is armed through the SBI TIME extension. The host
//! fallback records the programmed comparator so alarm tests can observe
//! arming decisions.

/// Timer tick rate of the QEMU virt machine (10 MHz).
pub const TIMER_FREQ: u64 = 10_000_000;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn set_timecmp(t: u64) {
    sbi_rt::set_timer(t);
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
mod host {
    use core::sync::atomic::{AtomicU64, Ordering};

    static TIMECMP: AtomicU64 = AtomicU64::new(u64::MAX);

    pub fn set_timecmp(t: u64) {
        TIMECMP.store(t, Ordering::SeqCst);
    }

    /// Last comparator value programmed (host only).
    pub fn timecmp() -> u64 {
        TIMECMP.load(Ordering::SeqCst)
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub use host::*;
