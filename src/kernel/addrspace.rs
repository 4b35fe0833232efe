//! Virtual Memory Manager
//!
//! Sv39 three-level page tables over the physical page pool. Kernel
//! physical memory is identity-mapped, so a physical page number doubles as
//! a pointer once shifted; page-table pages are ordinary pool pages.
//!
//! ## Address space layout
//!
//! ```text
//! 0x0000_0000 .. RAM_START   : identity-mapped MMIO (R/W, global, gigapages)
//! RAM_START  .. kimg_end     : kernel image (R/X, R, R/W by section, global)
//! kimg_end   .. RAM_END      : free RAM (R/W, global, megapages)
//! UMEM_START .. UMEM_END     : user range, 4 KiB non-global leaves only
//! ```
//!
//! An address space is identified by its `mtag`: the SATP value encoding
//! paging mode, ASID and root page number. [`AddrSpace`] is a cheap handle
//! over a root table; creation and teardown are explicit (`clone_space`,
//! `reset`) rather than RAII, since spaces change hands across `fork`,
//! `exec` and `exit`.

use crate::arch::riscv64::csr;
use crate::kernel::pmm::{self, PagePool, PAGE_ORDER, PAGE_SIZE};
use bitflags::bitflags;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

/// Bottom of the user virtual range.
pub const UMEM_START_VMA: usize = 0xC000_0000;

/// Top of the user virtual range (exclusive).
pub const UMEM_END_VMA: usize = 0x1_0000_0000;

/// First physical RAM address on the virt platform.
pub const RAM_START_PMA: usize = 0x8000_0000;

/// Megapage and gigapage sizes.
pub const MEGA_SIZE: usize = 512 * PAGE_SIZE;
pub const GIGA_SIZE: usize = 512 * MEGA_SIZE;

/// Entries per page-table page.
const PTE_CNT: usize = PAGE_SIZE / 8;

bitflags! {
    /// Page-table entry flag bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXEC     = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
    }
}

impl PteFlags {
    const LEAF: PteFlags = PteFlags::READ.union(PteFlags::WRITE).union(PteFlags::EXEC);
}

/// One Sv39 page-table entry.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    const PPN_SHIFT: u64 = 10;
    const PPN_MASK: u64 = (1 << 44) - 1;

    pub const fn null() -> Self {
        Pte(0)
    }

    /// Leaf entry mapping physical page `pp`. A and D are pre-set so the
    /// hardware never needs to update them.
    pub fn leaf(pp: *const u8, flags: PteFlags) -> Self {
        let f = flags | PteFlags::ACCESSED | PteFlags::DIRTY | PteFlags::VALID;
        Pte(((pp as u64 >> PAGE_ORDER) << Self::PPN_SHIFT) | f.bits())
    }

    /// Interior entry pointing at the next-level table.
    pub fn table(pt: *const Pte, flags: PteFlags) -> Self {
        let f = flags | PteFlags::VALID;
        Pte(((pt as u64 >> PAGE_ORDER) << Self::PPN_SHIFT) | f.bits())
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn ppn(self) -> u64 {
        (self.0 >> Self::PPN_SHIFT) & Self::PPN_MASK
    }

    /// Physical pointer to the mapped page or next-level table.
    pub fn pageptr(self) -> *mut u8 {
        ((self.ppn() as usize) << PAGE_ORDER) as *mut u8
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    pub fn is_global(self) -> bool {
        self.flags().contains(PteFlags::GLOBAL)
    }

    /// A valid entry with any of R/W/X set maps a page; with none set it
    /// points at another table.
    pub fn is_leaf(self) -> bool {
        self.flags().intersects(PteFlags::LEAF)
    }

    /// Replace the permission byte, keeping the PPN. V, A and D are always
    /// asserted.
    pub fn with_flags(self, flags: PteFlags) -> Self {
        let f = flags | PteFlags::ACCESSED | PteFlags::DIRTY | PteFlags::VALID;
        Pte((self.0 & !0xff) | f.bits())
    }
}

// ============================================================================
// Address-space tags
// ============================================================================

/// Compact identifier of an address space: the SATP value (mode, ASID, root
/// page number).
pub type MTag = u64;

const SATP_MODE_SV39: u64 = 8;
const SATP_MODE_SHIFT: u64 = 60;
const SATP_ASID_SHIFT: u64 = 44;

pub fn ptab_to_mtag(root: *const Pte, asid: u64) -> MTag {
    (SATP_MODE_SV39 << SATP_MODE_SHIFT)
        | (asid << SATP_ASID_SHIFT)
        | (root as u64 >> PAGE_ORDER)
}

pub fn mtag_to_ptab(tag: MTag) -> *mut Pte {
    (((tag & ((1 << 44) - 1)) as usize) << PAGE_ORDER) as *mut Pte
}

#[inline]
fn vpn2(vma: usize) -> usize {
    (vma >> (PAGE_ORDER + 18)) % PTE_CNT
}

#[inline]
fn vpn1(vma: usize) -> usize {
    (vma >> (PAGE_ORDER + 9)) % PTE_CNT
}

#[inline]
fn vpn0(vma: usize) -> usize {
    (vma >> PAGE_ORDER) % PTE_CNT
}

/// Address bits 63:38 must be all zero or all one.
#[inline]
pub fn wellformed(vma: usize) -> bool {
    let bits = vma >> 38;
    bits == 0 || bits == (usize::MAX >> 38)
}

// ============================================================================
// Address spaces
// ============================================================================

/// Handle over one root page table.
#[derive(Clone, Copy)]
pub struct AddrSpace {
    root: *mut Pte,
}

impl AddrSpace {
    pub fn from_mtag(tag: MTag) -> Self {
        Self {
            root: mtag_to_ptab(tag),
        }
    }

    pub fn mtag(&self) -> MTag {
        ptab_to_mtag(self.root, 0)
    }

    pub fn root(&self) -> *mut Pte {
        self.root
    }

    /// Allocate an empty root table.
    pub fn create(pool: &mut PagePool) -> Self {
        let root = pool.alloc_pages(1) as *mut Pte;
        unsafe { core::ptr::write_bytes(root as *mut u8, 0, PAGE_SIZE) };
        Self { root }
    }

    /// Walk to the level-0 entry for `vma` without allocating. Returns None
    /// when an interior level is missing.
    fn walk(&self, vma: usize) -> Option<NonNull<Pte>> {
        debug_assert!(wellformed(vma));
        debug_assert!(vma % PAGE_SIZE == 0);

        unsafe {
            let pte2 = *self.root.add(vpn2(vma));
            if !pte2.is_valid() || pte2.is_leaf() {
                return None;
            }

            let pt1 = pte2.pageptr() as *mut Pte;
            let pte1 = *pt1.add(vpn1(vma));
            if !pte1.is_valid() || pte1.is_leaf() {
                return None;
            }

            let pt0 = pte1.pageptr() as *mut Pte;
            NonNull::new(pt0.add(vpn0(vma)))
        }
    }

    /// Walk to the level-0 entry for `vma`, allocating zeroed interior
    /// tables as needed.
    fn walk_alloc(&self, vma: usize, pool: &mut PagePool) -> NonNull<Pte> {
        debug_assert!(wellformed(vma));
        debug_assert!(vma % PAGE_SIZE == 0);

        unsafe {
            let pte2 = self.root.add(vpn2(vma));
            if !(*pte2).is_valid() {
                let pt = pool.alloc_pages(1);
                core::ptr::write_bytes(pt, 0, PAGE_SIZE);
                *pte2 = Pte::table(pt as *const Pte, PteFlags::empty());
            }

            let pt1 = (*pte2).pageptr() as *mut Pte;
            let pte1 = pt1.add(vpn1(vma));
            if !(*pte1).is_valid() {
                let pt = pool.alloc_pages(1);
                core::ptr::write_bytes(pt, 0, PAGE_SIZE);
                *pte1 = Pte::table(pt as *const Pte, PteFlags::empty());
            }

            let pt0 = (*pte1).pageptr() as *mut Pte;
            NonNull::new_unchecked(pt0.add(vpn0(vma)))
        }
    }

    /// The level-0 entry for `vma`, or a null entry when unmapped.
    pub fn pte_at(&self, vma: usize) -> Pte {
        match self.walk(vma & !(PAGE_SIZE - 1)) {
            Some(p) => unsafe { *p.as_ptr() },
            None => Pte::null(),
        }
    }

    /// Install or overwrite a 4 KiB leaf at `vma`.
    pub fn map_page(&self, vma: usize, pp: *mut u8, flags: PteFlags, pool: &mut PagePool) {
        assert!(wellformed(vma));
        assert!(vma % PAGE_SIZE == 0);
        assert!(pp as usize % PAGE_SIZE == 0);

        let pte = self.walk_alloc(vma, pool);
        unsafe { *pte.as_ptr() = Pte::leaf(pp, flags) };
        csr::sfence_vma();
    }

    /// Map a contiguous physical range starting at `pp`.
    pub fn map_range(
        &self,
        vma: usize,
        size: usize,
        pp: *mut u8,
        flags: PteFlags,
        pool: &mut PagePool,
    ) {
        let size = round_up_page(size);
        let mut offset = 0;
        while offset < size {
            self.map_page(vma + offset, pp.wrapping_add(offset), flags, pool);
            offset += PAGE_SIZE;
        }
        csr::sfence_vma();
    }

    /// Allocate fresh zeroed pages and map them over `[vma, vma + size)`.
    pub fn alloc_and_map_range(
        &self,
        vma: usize,
        size: usize,
        flags: PteFlags,
        pool: &mut PagePool,
    ) {
        let size = round_up_page(size);
        let mut vp = vma;
        while vp < vma + size {
            let pp = pool.alloc_pages(1);
            unsafe { core::ptr::write_bytes(pp, 0, PAGE_SIZE) };
            self.map_page(vp, pp, flags, pool);
            vp += PAGE_SIZE;
        }
    }

    /// Reassign permission bits on existing valid, non-global leaves.
    pub fn set_range_flags(&self, vma: usize, size: usize, flags: PteFlags) {
        assert!(vma % PAGE_SIZE == 0);
        let size = round_up_page(size);

        let mut vp = vma;
        while vp < vma + size {
            if let Some(p) = self.walk(vp) {
                unsafe {
                    let pte = *p.as_ptr();
                    if pte.is_valid() && !pte.is_global() {
                        *p.as_ptr() = pte.with_flags(flags);
                    }
                }
            }
            vp += PAGE_SIZE;
        }
        csr::sfence_vma();
    }

    /// For each valid, non-global leaf in the range: free the backing page
    /// and null the entry.
    pub fn unmap_and_free_range(&self, vma: usize, size: usize, pool: &mut PagePool) {
        assert!(vma % PAGE_SIZE == 0);
        let size = round_up_page(size);

        let mut vp = vma;
        while vp < vma + size {
            if let Some(p) = self.walk(vp) {
                unsafe {
                    let pte = *p.as_ptr();
                    if pte.is_valid() && !pte.is_global() {
                        pool.free_pages(pte.pageptr(), 1);
                        *p.as_ptr() = Pte::null();
                    }
                }
            }
            vp += PAGE_SIZE;
        }
        csr::sfence_vma();
    }

    /// Copy this space into a new one: global root entries are shared
    /// (shallow), user pages are duplicated frame by frame with identical
    /// flags.
    pub fn clone_space(&self, pool: &mut PagePool) -> AddrSpace {
        let clone = AddrSpace::create(pool);

        unsafe {
            for i in 0..PTE_CNT {
                let pte = *self.root.add(i);
                if pte.is_valid() && pte.is_global() {
                    *clone.root.add(i) = pte;
                }
            }
        }

        let mut vma = UMEM_START_VMA;
        while vma < UMEM_END_VMA {
            if let Some(p) = self.walk(vma) {
                let pte = unsafe { *p.as_ptr() };
                if pte.is_valid() && !pte.is_global() {
                    let pp = pool.alloc_pages(1);
                    unsafe {
                        core::ptr::copy_nonoverlapping(pte.pageptr(), pp, PAGE_SIZE);
                        let dst = clone.walk_alloc(vma, pool);
                        *dst.as_ptr() = Pte::leaf(pp, pte.flags());
                    }
                }
            }
            vma += PAGE_SIZE;
        }

        clone
    }

    /// Unmap and free every user page in this space.
    pub fn reset(&self, pool: &mut PagePool) {
        self.unmap_and_free_range(UMEM_START_VMA, UMEM_END_VMA - UMEM_START_VMA, pool);
    }

    /// Physical pointer behind `vma`, if a valid leaf maps it.
    pub fn translate(&self, vma: usize) -> Option<*mut u8> {
        let pte = self.pte_at(vma & !(PAGE_SIZE - 1));
        if pte.is_valid() && pte.is_leaf() {
            Some(pte.pageptr().wrapping_add(vma % PAGE_SIZE))
        } else {
            None
        }
    }

    /// User-mode page fault policy: lazily allocate a zeroed R/W user page
    /// for an unmapped address inside the user range. Returns whether the
    /// faulting instruction should be retried.
    pub fn handle_user_page_fault(&self, cause: u64, vma: usize, pool: &mut PagePool) -> bool {
        if !(UMEM_START_VMA..UMEM_END_VMA).contains(&vma) {
            crate::kwarn!("vm", "fault_outside_user"; vma = vma, cause = cause);
            return false;
        }

        let vma = vma & !(PAGE_SIZE - 1);
        if self.pte_at(vma).is_valid() {
            // Already mapped: the fault is a genuine permission violation.
            crate::kwarn!("vm", "fault_perm"; vma = vma, cause = cause);
            return false;
        }

        self.alloc_and_map_range(
            vma,
            PAGE_SIZE,
            PteFlags::USER | PteFlags::READ | PteFlags::WRITE,
            pool,
        );
        true
    }
}

#[inline]
fn round_up_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

// ============================================================================
// Active-space operations
// ============================================================================

static MAIN_MTAG: AtomicU64 = AtomicU64::new(0);

/// Record the boot (main) address space tag.
pub fn set_main_mtag(tag: MTag) {
    MAIN_MTAG.store(tag, Ordering::SeqCst);
}

pub fn main_mtag() -> MTag {
    MAIN_MTAG.load(Ordering::SeqCst)
}

/// Tag of the currently active space.
pub fn active_mspace() -> MTag {
    csr::csrr_satp()
}

/// Switch the active space, returning the previous tag.
pub fn switch_mspace(tag: MTag) -> MTag {
    let prev = csr::csrrw_satp(tag);
    csr::sfence_vma();
    prev
}

pub fn active_space() -> AddrSpace {
    AddrSpace::from_mtag(active_mspace())
}

pub fn map_page(vma: usize, pp: *mut u8, flags: PteFlags) {
    pmm::with_pool(|p| active_space().map_page(vma, pp, flags, p));
}

pub fn map_range(vma: usize, size: usize, pp: *mut u8, flags: PteFlags) {
    pmm::with_pool(|p| active_space().map_range(vma, size, pp, flags, p));
}

pub fn alloc_and_map_range(vma: usize, size: usize, flags: PteFlags) {
    pmm::with_pool(|p| active_space().alloc_and_map_range(vma, size, flags, p));
}

pub fn set_range_flags(vma: usize, size: usize, flags: PteFlags) {
    active_space().set_range_flags(vma, size, flags);
}

pub fn unmap_and_free_range(vma: usize, size: usize) {
    pmm::with_pool(|p| active_space().unmap_and_free_range(vma, size, p));
}

/// Clone the active space (shared kernel mappings, duplicated user pages).
pub fn clone_active_mspace() -> MTag {
    pmm::with_pool(|p| active_space().clone_space(p)).mtag()
}

/// Unmap and free all user pages in the active space.
pub fn reset_active_mspace() {
    pmm::with_pool(|p| active_space().reset(p));
}

/// Reset the active space and fall back to the main space.
pub fn discard_active_mspace() -> MTag {
    reset_active_mspace();
    switch_mspace(main_mtag());
    main_mtag()
}

/// Entry point for U-mode load/store page faults. Returns true when the
/// fault was fixed and the instruction should be retried.
pub fn handle_umode_page_fault(vma: usize) -> bool {
    let cause = csr::csrr_scause();
    pmm::with_pool(|p| active_space().handle_user_page_fault(cause, vma, p))
}

// ============================================================================
// Boot mapping (hardware only)
// ============================================================================

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod boot {
    //! Builds the main address space once at boot: identity MMIO gigapages,
    //! the kernel image as 4 KiB leaves with section-appropriate flags, the
    //! rest of RAM as R/W megapages. Enables paging and SUM.

    use super::*;

    /// Physical RAM size of the virt platform configuration.
    pub const RAM_SIZE: usize = 128 * 1024 * 1024;
    pub const RAM_END: usize = RAM_START_PMA + RAM_SIZE;

    /// RAM carved out for the kernel heap, between the image and the page
    /// pool.
    pub const KERNEL_HEAP_SIZE: usize = 1024 * 1024;

    #[repr(C, align(4096))]
    struct PtPage([Pte; PTE_CNT]);

    static mut MAIN_PT2: PtPage = PtPage([Pte::null(); PTE_CNT]);
    static mut MAIN_PT1: PtPage = PtPage([Pte::null(); PTE_CNT]);
    static mut MAIN_PT0: PtPage = PtPage([Pte::null(); PTE_CNT]);

    extern "C" {
        static _kimg_start: u8;
        static _kimg_text_start: u8;
        static _kimg_text_end: u8;
        static _kimg_rodata_start: u8;
        static _kimg_rodata_end: u8;
        static _kimg_data_start: u8;
        static _kimg_end: u8;
    }

    /// Build and activate the main space, then split the RAM above the
    /// kernel image into the kernel heap and the page pool. Returns the
    /// heap region for the allocator.
    ///
    /// # Safety
    /// Must run exactly once, before paging is enabled.
    pub unsafe fn memory_init() -> (*mut u8, usize) {
        let g = PteFlags::GLOBAL;
        let rw = PteFlags::READ | PteFlags::WRITE;

        let pt2 = core::ptr::addr_of_mut!(MAIN_PT2.0) as *mut Pte;
        let pt1 = core::ptr::addr_of_mut!(MAIN_PT1.0) as *mut Pte;
        let pt0 = core::ptr::addr_of_mut!(MAIN_PT0.0) as *mut Pte;

        // Identity-map the MMIO region below RAM as two R/W gigapages.
        let mut pma = 0usize;
        while pma < RAM_START_PMA {
            *pt2.add(vpn2(pma)) = Pte::leaf(pma as *const u8, rw | g);
            pma += GIGA_SIZE;
        }

        // The gigarange holding RAM gets a second-level table; its first
        // megapage is broken into 4 KiB leaves for the kernel image.
        *pt2.add(vpn2(RAM_START_PMA)) = Pte::table(pt1, g);
        *pt1.add(vpn1(RAM_START_PMA)) = Pte::table(pt0, g);

        let text_start = core::ptr::addr_of!(_kimg_text_start) as usize;
        let text_end = core::ptr::addr_of!(_kimg_text_end) as usize;
        let rodata_start = core::ptr::addr_of!(_kimg_rodata_start) as usize;
        let rodata_end = core::ptr::addr_of!(_kimg_rodata_end) as usize;
        let data_start = core::ptr::addr_of!(_kimg_data_start) as usize;
        let kimg_end = core::ptr::addr_of!(_kimg_end) as usize;

        assert!(kimg_end - RAM_START_PMA <= MEGA_SIZE);

        let mut pp = text_start;
        while pp < text_end {
            *pt0.add(vpn0(pp)) =
                Pte::leaf(pp as *const u8, PteFlags::READ | PteFlags::EXEC | g);
            pp += PAGE_SIZE;
        }
        let mut pp = rodata_start;
        while pp < rodata_end {
            *pt0.add(vpn0(pp)) = Pte::leaf(pp as *const u8, PteFlags::READ | g);
            pp += PAGE_SIZE;
        }
        let mut pp = data_start;
        while pp < RAM_START_PMA + MEGA_SIZE {
            *pt0.add(vpn0(pp)) = Pte::leaf(pp as *const u8, rw | g);
            pp += PAGE_SIZE;
        }

        // Remaining RAM as R/W megapages.
        let mut pp = RAM_START_PMA + MEGA_SIZE;
        while pp < RAM_END {
            *pt1.add(vpn1(pp)) = Pte::leaf(pp as *const u8, rw | g);
            pp += MEGA_SIZE;
        }

        let tag = ptab_to_mtag(pt2, 0);
        set_main_mtag(tag);
        csr::csrw_satp(tag);
        csr::sfence_vma();

        // Supervisor access to user pages: the kernel reads and writes user
        // buffers directly after validation.
        csr::csrs_sstatus(csr::SSTATUS_SUM);

        // Everything above the kernel image (page-rounded): first the
        // kernel heap, then the page pool.
        let heap_start = (kimg_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let pool_start = heap_start + KERNEL_HEAP_SIZE;
        pmm::init(pool_start as *mut u8, (RAM_END - pool_start) / PAGE_SIZE);

        crate::kinfo!("vm", "paging_on"; mtag = tag);
        (heap_start as *mut u8, KERNEL_HEAP_SIZE)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::pmm::tests::pool_with;

    fn user_flags() -> PteFlags {
        PteFlags::USER | PteFlags::READ | PteFlags::WRITE
    }

    #[test]
    fn test_map_and_translate() {
        let mut pool = pool_with(64);
        let space = AddrSpace::create(&mut pool);

        let pp = pool.alloc_pages(1);
        space.map_page(UMEM_START_VMA, pp, user_flags(), &mut pool);

        let got = space.translate(UMEM_START_VMA).unwrap();
        assert_eq!(got, pp);
        assert_eq!(
            space.translate(UMEM_START_VMA + 5).unwrap(),
            pp.wrapping_add(5)
        );
        assert!(space.translate(UMEM_START_VMA + PAGE_SIZE).is_none());
    }

    #[test]
    fn test_pte_encoding() {
        let pp = 0x8020_3000usize as *const u8;
        let pte = Pte::leaf(pp, PteFlags::READ | PteFlags::USER);
        assert!(pte.is_valid());
        assert!(pte.is_leaf());
        assert!(!pte.is_global());
        assert_eq!(pte.pageptr() as usize, 0x8020_3000);
        assert!(pte.flags().contains(PteFlags::ACCESSED | PteFlags::DIRTY));

        let tbl = Pte::table(0x8040_0000usize as *const Pte, PteFlags::GLOBAL);
        assert!(tbl.is_valid());
        assert!(!tbl.is_leaf());
        assert!(tbl.is_global());
    }

    #[test]
    fn test_mtag_roundtrip() {
        let mut pool = pool_with(8);
        let space = AddrSpace::create(&mut pool);
        let tag = space.mtag();
        assert_eq!(tag >> 60, 8); // Sv39 mode
        let back = AddrSpace::from_mtag(tag);
        assert_eq!(back.root(), space.root());
    }

    #[test]
    fn test_wellformed() {
        assert!(wellformed(0));
        assert!(wellformed(UMEM_START_VMA));
        assert!(wellformed(usize::MAX));
        assert!(!wellformed(1 << 45));
    }

    #[test]
    fn test_alloc_and_map_zeroes_pages() {
        let mut pool = pool_with(64);
        let space = AddrSpace::create(&mut pool);

        space.alloc_and_map_range(UMEM_START_VMA, 3 * PAGE_SIZE, user_flags(), &mut pool);

        for i in 0..3 {
            let p = space.translate(UMEM_START_VMA + i * PAGE_SIZE).unwrap();
            let bytes = unsafe { core::slice::from_raw_parts(p, PAGE_SIZE) };
            assert!(bytes.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_unmap_and_free_returns_pages() {
        let mut pool = pool_with(64);
        let space = AddrSpace::create(&mut pool);
        let before = pool.free_page_count();

        space.alloc_and_map_range(UMEM_START_VMA, 4 * PAGE_SIZE, user_flags(), &mut pool);
        assert!(pool.free_page_count() < before);

        space.unmap_and_free_range(UMEM_START_VMA, 4 * PAGE_SIZE, &mut pool);
        // Data pages come back; interior tables stay allocated.
        let tables = 2; // one level-1, one level-0 table for this range
        assert_eq!(pool.free_page_count(), before - tables);
        assert!(space.translate(UMEM_START_VMA).is_none());
    }

    #[test]
    fn test_set_range_flags_skips_global() {
        let mut pool = pool_with(64);
        let space = AddrSpace::create(&mut pool);

        let user_pp = pool.alloc_pages(1);
        let global_pp = pool.alloc_pages(1);
        space.map_page(UMEM_START_VMA, user_pp, user_flags(), &mut pool);
        space.map_page(
            UMEM_START_VMA + PAGE_SIZE,
            global_pp,
            PteFlags::READ | PteFlags::WRITE | PteFlags::GLOBAL,
            &mut pool,
        );

        space.set_range_flags(
            UMEM_START_VMA,
            2 * PAGE_SIZE,
            PteFlags::USER | PteFlags::READ,
        );

        let user_pte = space.pte_at(UMEM_START_VMA);
        assert!(!user_pte.flags().contains(PteFlags::WRITE));
        assert!(user_pte.is_valid());

        let global_pte = space.pte_at(UMEM_START_VMA + PAGE_SIZE);
        assert!(global_pte.flags().contains(PteFlags::WRITE));
    }

    #[test]
    fn test_clone_copies_user_pages() {
        let mut pool = pool_with(128);
        let space = AddrSpace::create(&mut pool);

        space.alloc_and_map_range(UMEM_START_VMA, PAGE_SIZE, user_flags(), &mut pool);
        let p = space.translate(UMEM_START_VMA).unwrap();
        unsafe { *p = 42 };

        let clone = space.clone_space(&mut pool);
        let q = clone.translate(UMEM_START_VMA).unwrap();
        assert_ne!(p, q);
        assert_eq!(unsafe { *q }, 42);

        // Writes stay private to each space.
        unsafe { *q = 10 };
        assert_eq!(unsafe { *p }, 42);
        unsafe { *p = 7 };
        assert_eq!(unsafe { *q }, 10);
    }

    #[test]
    fn test_clone_then_reset_restores_pool() {
        let mut pool = pool_with(128);
        let space = AddrSpace::create(&mut pool);
        space.alloc_and_map_range(UMEM_START_VMA, 2 * PAGE_SIZE, user_flags(), &mut pool);

        let before_clone = pool.free_page_count();
        let clone = space.clone_space(&mut pool);
        assert!(pool.free_page_count() < before_clone);

        clone.reset(&mut pool);
        // User frames return; the clone's root and interior tables remain.
        let tables = 3; // root + level-1 + level-0
        assert_eq!(pool.free_page_count(), before_clone - tables);
        assert!(clone.translate(UMEM_START_VMA).is_none());
        // The source still sees its pages.
        assert!(space.translate(UMEM_START_VMA).is_some());
    }

    #[test]
    fn test_page_fault_lazily_maps_user_range() {
        let mut pool = pool_with(64);
        let space = AddrSpace::create(&mut pool);

        let vma = UMEM_START_VMA + 3 * PAGE_SIZE + 123;
        assert!(space.handle_user_page_fault(csr::SCAUSE_STORE_PAGE_FAULT, vma, &mut pool));

        let pte = space.pte_at(vma & !(PAGE_SIZE - 1));
        assert!(pte.is_valid());
        assert!(pte.flags().contains(PteFlags::USER | PteFlags::WRITE));
        assert!(!pte.is_global());
    }

    #[test]
    fn test_page_fault_outside_user_range_is_fatal() {
        let mut pool = pool_with(16);
        let space = AddrSpace::create(&mut pool);
        assert!(!space.handle_user_page_fault(
            csr::SCAUSE_LOAD_PAGE_FAULT,
            RAM_START_PMA,
            &mut pool
        ));
        assert!(!space.handle_user_page_fault(csr::SCAUSE_LOAD_PAGE_FAULT, 0, &mut pool));
    }

    #[test]
    fn test_page_fault_on_mapped_page_is_fatal() {
        let mut pool = pool_with(64);
        let space = AddrSpace::create(&mut pool);

        // Read-only page: a store fault on it must not be "fixed".
        let pp = pool.alloc_pages(1);
        space.map_page(
            UMEM_START_VMA,
            pp,
            PteFlags::USER | PteFlags::READ,
            &mut pool,
        );
        assert!(!space.handle_user_page_fault(
            csr::SCAUSE_STORE_PAGE_FAULT,
            UMEM_START_VMA + 8,
            &mut pool
        ));
    }
}
