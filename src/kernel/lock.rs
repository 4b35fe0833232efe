//! Short-term data locks
//!
//! [`SpinLock`] protects kernel data structures across short critical
//! sections. Acquisition disables interrupts (irqsave) and spins with ticket
//! fairness; the guard restores interrupt state on drop. Code holding a
//! `SpinLock` must not block or sleep; the blocking mutex for long sections
//! lives in [`crate::kernel::task`].

use crate::arch::riscv64::sync;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// A ticket spinlock with IRQ-save semantics.
pub struct SpinLock<T> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: the ticket protocol serializes access to `data`.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, disabling interrupts first.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irqs_were_enabled = sync::disable_interrupts();

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }

        SpinLockGuard {
            lock: self,
            irqs_were_enabled,
        }
    }

    /// Get the protected data without locking.
    ///
    /// # Safety
    /// Caller must guarantee no concurrent access.
    pub unsafe fn get_unchecked(&self) -> *mut T {
        self.data.get()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irqs_were_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: guard holds the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: guard holds the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
        sync::restore_interrupts(self.irqs_were_enabled);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_protects_data() {
        let lock = SpinLock::new(0u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn test_sequential_reacquire() {
        let lock = SpinLock::new(Vec::<u32>::new());
        for i in 0..16 {
            lock.lock().push(i);
        }
        assert_eq!(lock.lock().len(), 16);
    }
}
