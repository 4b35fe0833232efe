//! User Memory Validation
//!
//! Every user pointer crossing the syscall boundary is checked against the
//! active space's page tables before the kernel touches it: each page in the
//! range must hold a valid leaf whose flags cover the requested access (at
//! least U, plus R or W for the transfer direction). Strings are walked
//! byte-wise until the terminator, re-checking on every page crossing.
//!
//! Byte reads during string validation go through explicit translation to
//! the physical frame rather than dereferencing the user address, so the
//! same code runs on the host where no user mapping exists.

use crate::kernel::addrspace::{self, AddrSpace, PteFlags};
use crate::kernel::error::{KResult, KernelError};
use crate::kernel::pmm::PAGE_SIZE;

/// Longest string accepted by [`validate_vstr`].
pub const MAX_USER_STR: usize = 4096;

/// Require a valid leaf with `required` flags on every page touched by
/// `[vp, vp + len)`.
pub fn validate_vptr_len(
    space: &AddrSpace,
    vp: usize,
    len: usize,
    required: PteFlags,
) -> KResult<()> {
    if vp == 0 {
        return Err(KernelError::InvalidArg);
    }
    if len == 0 {
        return Ok(());
    }

    let end = vp.checked_add(len).ok_or(KernelError::AccessDenied)?;
    if !addrspace::wellformed(vp) || !addrspace::wellformed(end - 1) {
        return Err(KernelError::AccessDenied);
    }

    let mut page = vp & !(PAGE_SIZE - 1);
    while page < end {
        let pte = space.pte_at(page);
        if !pte.is_valid() || !pte.flags().contains(required) {
            return Err(KernelError::AccessDenied);
        }
        page += PAGE_SIZE;
    }

    Ok(())
}

/// Walk a user string byte-by-byte until its terminator, requiring
/// `required` flags on every page entered. Crossing into an invalid page
/// before the terminator is an access error; a missing terminator within
/// [`MAX_USER_STR`] is an invalid argument.
///
/// Returns the string length (terminator excluded).
pub fn validate_vstr(space: &AddrSpace, vs: usize, required: PteFlags) -> KResult<usize> {
    if vs == 0 {
        return Err(KernelError::InvalidArg);
    }

    let mut len = 0usize;
    let mut checked_page = usize::MAX;

    while len < MAX_USER_STR {
        let addr = vs + len;
        let page = addr & !(PAGE_SIZE - 1);

        if page != checked_page {
            let pte = space.pte_at(page);
            if !pte.is_valid() || !pte.flags().contains(required) {
                return Err(KernelError::AccessDenied);
            }
            checked_page = page;
        }

        let p = space
            .translate(addr)
            .ok_or(KernelError::AccessDenied)?;
        let byte = unsafe { core::ptr::read(p) };
        if byte == 0 {
            return Ok(len);
        }
        len += 1;
    }

    Err(KernelError::InvalidArg)
}

/// Validate against the currently active space.
pub fn validate_user_range(vp: usize, len: usize, required: PteFlags) -> KResult<()> {
    validate_vptr_len(&addrspace::active_space(), vp, len, required)
}

/// Validate a string in the currently active space.
pub fn validate_user_str(vs: usize, required: PteFlags) -> KResult<usize> {
    validate_vstr(&addrspace::active_space(), vs, required)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::addrspace::{AddrSpace, UMEM_START_VMA};
    use crate::kernel::pmm::tests::pool_with;

    fn rw_user() -> PteFlags {
        PteFlags::USER | PteFlags::READ | PteFlags::WRITE
    }

    #[test]
    fn test_null_pointer_is_invalid() {
        let mut pool = pool_with(16);
        let space = AddrSpace::create(&mut pool);
        assert_eq!(
            validate_vptr_len(&space, 0, 8, PteFlags::USER),
            Err(KernelError::InvalidArg)
        );
        assert_eq!(
            validate_vstr(&space, 0, PteFlags::USER),
            Err(KernelError::InvalidArg)
        );
    }

    #[test]
    fn test_range_needs_every_page_mapped() {
        let mut pool = pool_with(64);
        let space = AddrSpace::create(&mut pool);
        space.alloc_and_map_range(UMEM_START_VMA, PAGE_SIZE, rw_user(), &mut pool);

        assert!(validate_vptr_len(&space, UMEM_START_VMA, PAGE_SIZE, rw_user()).is_ok());
        // Crossing into the unmapped second page fails even though the
        // range starts near the end of a mapped page.
        assert_eq!(
            validate_vptr_len(&space, UMEM_START_VMA + PAGE_SIZE - 4, 8, rw_user()),
            Err(KernelError::AccessDenied)
        );
    }

    #[test]
    fn test_range_checks_flags() {
        let mut pool = pool_with(64);
        let space = AddrSpace::create(&mut pool);
        space.alloc_and_map_range(
            UMEM_START_VMA,
            PAGE_SIZE,
            PteFlags::USER | PteFlags::READ,
            &mut pool,
        );

        assert!(validate_vptr_len(
            &space,
            UMEM_START_VMA,
            16,
            PteFlags::USER | PteFlags::READ
        )
        .is_ok());
        assert_eq!(
            validate_vptr_len(&space, UMEM_START_VMA, 16, rw_user()),
            Err(KernelError::AccessDenied)
        );
    }

    #[test]
    fn test_zero_length_always_passes() {
        let mut pool = pool_with(16);
        let space = AddrSpace::create(&mut pool);
        assert!(validate_vptr_len(&space, UMEM_START_VMA, 0, rw_user()).is_ok());
    }

    #[test]
    fn test_string_walk_finds_terminator() {
        let mut pool = pool_with(64);
        let space = AddrSpace::create(&mut pool);
        space.alloc_and_map_range(UMEM_START_VMA, PAGE_SIZE, rw_user(), &mut pool);

        let p = space.translate(UMEM_START_VMA).unwrap();
        unsafe {
            core::ptr::copy_nonoverlapping(b"hello\0".as_ptr(), p, 6);
        }

        assert_eq!(validate_vstr(&space, UMEM_START_VMA, rw_user()), Ok(5));
    }

    #[test]
    fn test_string_crossing_into_unmapped_page_fails() {
        let mut pool = pool_with(64);
        let space = AddrSpace::create(&mut pool);
        space.alloc_and_map_range(UMEM_START_VMA, PAGE_SIZE, rw_user(), &mut pool);

        // Fill the tail of the page with non-zero bytes: the walk must run
        // off the end and hit the unmapped page.
        let p = space.translate(UMEM_START_VMA).unwrap();
        unsafe {
            core::ptr::write_bytes(p, b'x', PAGE_SIZE);
        }

        assert_eq!(
            validate_vstr(&space, UMEM_START_VMA + PAGE_SIZE - 10, rw_user()),
            Err(KernelError::AccessDenied)
        );
    }

    #[test]
    fn test_string_spanning_two_mapped_pages() {
        let mut pool = pool_with(64);
        let space = AddrSpace::create(&mut pool);
        space.alloc_and_map_range(UMEM_START_VMA, 2 * PAGE_SIZE, rw_user(), &mut pool);

        let first = space.translate(UMEM_START_VMA + PAGE_SIZE - 3).unwrap();
        let second = space.translate(UMEM_START_VMA + PAGE_SIZE).unwrap();
        unsafe {
            core::ptr::copy_nonoverlapping(b"abc".as_ptr(), first, 3);
            core::ptr::copy_nonoverlapping(b"def\0".as_ptr(), second, 4);
        }

        assert_eq!(
            validate_vstr(&space, UMEM_START_VMA + PAGE_SIZE - 3, rw_user()),
            Ok(6)
        );
    }
}
