//! Physical Page Pool
//!
//! Owns every free RAM page outside the kernel image and heap. Free pages
//! are kept as a singly-linked list of _chunks_ of consecutive pages, sorted
//! by increasing physical address. The chunk header (next pointer and page
//! count) lives in the first bytes of the chunk's lowest page, so the pool
//! itself needs no storage.
//!
//! Allocation is best-fit: the smallest chunk that satisfies the request is
//! split, handing out its **upper** pages so the remainder keeps its place
//! in the list. Freeing re-inserts in address order and coalesces with both
//! neighbors, so no two chunks in the list are ever adjacent.

use crate::kernel::lock::SpinLock;
use core::ptr::NonNull;

/// Size of a physical page.
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_ORDER: usize = 12;

#[repr(C)]
struct PageChunk {
    next: Option<NonNull<PageChunk>>,
    pagecnt: usize,
}

/// The free-chunk list.
pub struct PagePool {
    head: Option<NonNull<PageChunk>>,
}

// SAFETY: chunk pointers reference RAM owned exclusively by the pool.
unsafe impl Send for PagePool {}

impl PagePool {
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Seed the pool with one chunk spanning `pages` pages starting at
    /// `start`.
    ///
    /// # Safety
    /// The region must be page-aligned, unused RAM owned by the caller for
    /// the lifetime of the pool.
    pub unsafe fn init(&mut self, start: *mut u8, pages: usize) {
        assert!(start as usize % PAGE_SIZE == 0);
        assert!(pages > 0);

        let chunk = start as *mut PageChunk;
        (*chunk).pagecnt = pages;
        (*chunk).next = None;
        self.head = NonNull::new(chunk);
    }

    /// Allocate `cnt` contiguous pages. Panics if no chunk can satisfy the
    /// request; running out of physical memory is fatal.
    pub fn alloc_pages(&mut self, cnt: usize) -> *mut u8 {
        assert!(cnt > 0);

        if self.head.is_none() {
            panic!("out of free memory");
        }

        // Search for the smallest chunk with at least cnt pages.
        let mut best: Option<NonNull<PageChunk>> = None;
        let mut prev_best: Option<NonNull<PageChunk>> = None;
        let mut prev: Option<NonNull<PageChunk>> = None;
        let mut cur = self.head;

        while let Some(c) = cur {
            let c_cnt = unsafe { c.as_ref().pagecnt };
            let best_cnt = best.map(|b| unsafe { b.as_ref().pagecnt });

            if c_cnt >= cnt && best_cnt.map_or(true, |b| c_cnt <= b) {
                best = Some(c);
                prev_best = prev;

                if c_cnt == cnt {
                    break;
                }
            }

            prev = cur;
            cur = unsafe { c.as_ref().next };
        }

        let best = match best {
            Some(b) => b,
            None => panic!("could not find free pages"),
        };

        let pages_left = unsafe { best.as_ref().pagecnt } - cnt;

        // Exact fit: unlink the whole chunk.
        if pages_left == 0 {
            let next = unsafe { best.as_ref().next };
            match prev_best {
                Some(mut p) => unsafe { p.as_mut().next = next },
                None => self.head = next,
            }
            return best.as_ptr() as *mut u8;
        }

        // Split off the upper cnt pages so the remainder keeps its list
        // position.
        unsafe {
            let remaining = best.as_ptr();
            (*remaining).pagecnt = pages_left;
            (remaining as *mut u8).add(pages_left * PAGE_SIZE)
        }
    }

    /// Return `cnt` pages starting at `pp` to the pool, coalescing with
    /// adjacent chunks.
    pub fn free_pages(&mut self, pp: *mut u8, cnt: usize) {
        assert!(pp as usize % PAGE_SIZE == 0);
        assert!(cnt > 0);

        let new = pp as *mut PageChunk;
        unsafe {
            (*new).pagecnt = cnt;
        }

        // Find the insertion point, sorted by address.
        let mut prev: Option<NonNull<PageChunk>> = None;
        let mut target = self.head;

        while let Some(t) = target {
            if t.as_ptr() >= new {
                break;
            }
            prev = target;
            target = unsafe { t.as_ref().next };
        }

        unsafe {
            (*new).next = target;

            let mut merged = NonNull::new_unchecked(new);

            match prev {
                Some(mut p) => {
                    p.as_mut().next = Some(merged);
                    let prev_end =
                        p.as_ptr() as usize + p.as_ref().pagecnt * PAGE_SIZE;
                    if prev_end == new as usize {
                        p.as_mut().pagecnt += (*new).pagecnt;
                        p.as_mut().next = (*new).next;
                        merged = p;
                    }
                }
                None => {
                    self.head = Some(merged);
                }
            }

            let merged_end = merged.as_ptr() as usize
                + merged.as_ref().pagecnt * PAGE_SIZE;
            if let Some(next) = merged.as_ref().next {
                if merged_end == next.as_ptr() as usize {
                    merged.as_mut().pagecnt += next.as_ref().pagecnt;
                    merged.as_mut().next = next.as_ref().next;
                }
            }
        }
    }

    /// Total free pages across the list.
    pub fn free_page_count(&self) -> usize {
        let mut cnt = 0;
        let mut cur = self.head;
        while let Some(c) = cur {
            unsafe {
                cnt += c.as_ref().pagecnt;
                cur = c.as_ref().next;
            }
        }
        cnt
    }

    /// Number of chunks on the free list.
    pub fn chunk_count(&self) -> usize {
        let mut cnt = 0;
        let mut cur = self.head;
        while let Some(c) = cur {
            cnt += 1;
            cur = unsafe { c.as_ref().next };
        }
        cnt
    }
}

// ============================================================================
// Global pool
// ============================================================================

static POOL: SpinLock<PagePool> = SpinLock::new(PagePool::new());

/// Run `f` with exclusive access to the global pool.
pub fn with_pool<R, F: FnOnce(&mut PagePool) -> R>(f: F) -> R {
    let mut guard = POOL.lock();
    f(&mut guard)
}

/// Seed the global pool. Called once at boot with the RAM between the end of
/// the kernel heap and the end of physical memory.
///
/// # Safety
/// See [`PagePool::init`].
pub unsafe fn init(start: *mut u8, pages: usize) {
    with_pool(|p| p.init(start, pages));
    kinfo_init(start, pages);
}

fn kinfo_init(start: *mut u8, pages: usize) {
    crate::kinfo!("pmm", "init_ok"; base = start as usize, pages = pages);
}

pub fn alloc_phys_pages(cnt: usize) -> *mut u8 {
    with_pool(|p| p.alloc_pages(cnt))
}

pub fn alloc_phys_page() -> *mut u8 {
    alloc_phys_pages(1)
}

pub fn free_phys_pages(pp: *mut u8, cnt: usize) {
    with_pool(|p| p.free_pages(pp, cnt))
}

pub fn free_phys_page(pp: *mut u8) {
    free_phys_pages(pp, 1)
}

pub fn free_phys_page_count() -> usize {
    with_pool(|p| p.free_page_count())
}

// ============================================================================
// Tests
// ============================================================================
