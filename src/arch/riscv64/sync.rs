//! Interrupt masking primitives
//!
//! List surgery on the ready list, condition wait lists and the sleep list
//! happens inside interrupt-disable critical sections. [`IrqGuard`] is the
//! RAII form; the save/restore pair mirrors the traditional kernel idiom for
//! code that needs to hold the state across a suspension point.

use super::csr;

/// Disable supervisor interrupts. Returns whether they were enabled.
#[inline]
pub fn disable_interrupts() -> bool {
    csr::csrc_sstatus(csr::SSTATUS_SIE) & csr::SSTATUS_SIE != 0
}

/// Enable supervisor interrupts.
#[inline]
pub fn enable_interrupts() {
    csr::csrs_sstatus(csr::SSTATUS_SIE);
}

/// Restore the interrupt-enable state captured by [`disable_interrupts`].
#[inline]
pub fn restore_interrupts(were_enabled: bool) {
    if were_enabled {
        enable_interrupts();
    }
}

/// Whether supervisor interrupts are currently enabled.
#[inline]
pub fn interrupts_enabled() -> bool {
    csr::csrr_sstatus() & csr::SSTATUS_SIE != 0
}

/// Guard that disables interrupts on creation and restores the previous
/// state on drop.
pub struct IrqGuard {
    were_enabled: bool,
}

impl IrqGuard {
    #[inline]
    pub fn new() -> Self {
        Self {
            were_enabled: disable_interrupts(),
        }
    }

    /// Whether interrupts were enabled before this guard was created.
    #[inline]
    pub fn was_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        restore_interrupts(self.were_enabled);
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}
