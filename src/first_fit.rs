//! Bitmap page allocator returning the lowest-indexed free run.
//!
//! One bit per page, 0 = free, 1 = used. Allocation is a linear scan for
//! the first run of free bits long enough, O(pages) per request, which is
//! acceptable for the small regions this allocator targets.

use core::ptr::NonNull;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::page::{PageProvider, PAGE_SIZE};
use crate::region::Region;

/// Bitmap capacity: the largest region this allocator can describe.
pub const MAX_PAGES: usize = 1024;

const WORD_BITS: usize = usize::BITS as usize;
const MAP_WORDS: usize = MAX_PAGES / WORD_BITS;

struct PageMap {
    map: [usize; MAP_WORDS],
    used_pages: usize,
    free_pages: usize,
}

impl PageMap {
    fn bit(&self, index: usize) -> bool {
        self.map[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    fn set_run(&mut self, start: usize, len: usize) {
        for index in start..start + len {
            self.map[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        }
    }

    fn clear_run(&mut self, start: usize, len: usize) {
        for index in start..start + len {
            self.map[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }

    /// First index of `len` consecutive free pages within `limit` pages.
    fn find_free_run(&self, len: usize, limit: usize) -> Option<usize> {
        let mut run = 0;
        let mut start = 0;
        for index in 0..limit {
            if self.bit(index) {
                run = 0;
            } else {
                if run == 0 {
                    start = index;
                }
                run += 1;
                if run == len {
                    return Some(start);
                }
            }
        }
        None
    }
}

/// `FirstFit` manages a region of pages through a fixed-capacity bitmap.
pub struct FirstFit {
    name: &'static str,
    region: Region,
    pages: Mutex<PageMap>,
}

unsafe impl Send for FirstFit {}
unsafe impl Sync for FirstFit {}

impl FirstFit {
    /// Creates a first-fit allocator over `pages` pages starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be page aligned and `[base, base + pages * PAGE_SIZE)`
    /// must be owned exclusively by the allocator for its whole lifetime.
    pub unsafe fn new(name: &'static str, base: NonNull<u8>, pages: usize) -> Result<Self> {
        let region = Region::new(base, pages)?;
        if pages > MAX_PAGES {
            log::warn!("first-fit '{name}': {pages} pages exceeds bitmap capacity {MAX_PAGES}");
            return Err(Error::RegionTooLarge {
                pages,
                max: MAX_PAGES,
            });
        }

        log::debug!(
            "first-fit '{name}': managing {pages} pages at {:#x}",
            region.base_addr()
        );
        Ok(Self {
            name,
            region,
            pages: Mutex::new(PageMap {
                map: [0; MAP_WORDS],
                used_pages: 0,
                free_pages: pages,
            }),
        })
    }

    /// Returns the lowest-addressed run of `count` contiguous pages.
    pub fn alloc(&self, count: usize) -> Result<NonNull<u8>> {
        if count == 0 {
            log::warn!("first-fit '{}': zero-page request", self.name);
            return Err(Error::BadArgs);
        }

        let mut pages = self.pages.lock();
        if count > pages.free_pages {
            log::warn!(
                "first-fit '{}': {count} pages requested, {} free",
                self.name,
                pages.free_pages
            );
            return Err(Error::NoMemory);
        }

        let start = match pages.find_free_run(count, self.region.pages()) {
            Some(start) => start,
            None => {
                log::warn!("first-fit '{}': no run of {count} free pages", self.name);
                return Err(Error::NoMemory);
            }
        };

        pages.set_run(start, count);
        pages.used_pages += count;
        pages.free_pages -= count;

        let addr = self.region.page_addr(start);
        log::trace!("first-fit '{}': alloc {count} pages -> {addr:#x}", self.name);
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Claims the exact run of `count` pages starting at `addr`. Fails
    /// without mutation when any page of the run is already used.
    pub fn alloc_at(&self, addr: NonNull<u8>, count: usize) -> Result<()> {
        let addr = addr.as_ptr() as usize;
        if count == 0 || addr & (PAGE_SIZE - 1) != 0 {
            log::warn!("first-fit '{}': bad fixed request {addr:#x}+{count}", self.name);
            return Err(Error::BadArgs);
        }
        if !self.region.contains(addr) {
            log::warn!("first-fit '{}': fixed request {addr:#x} out of range", self.name);
            return Err(Error::OutOfRange(addr));
        }
        let start = self.region.page_index(addr);
        if start + count > self.region.pages() {
            return Err(Error::OutOfRange(addr));
        }

        let mut pages = self.pages.lock();
        for index in start..start + count {
            if pages.bit(index) {
                log::warn!(
                    "first-fit '{}': page {index} already used, fixed request denied",
                    self.name
                );
                return Err(Error::NoMemory);
            }
        }
        pages.set_run(start, count);
        pages.used_pages += count;
        pages.free_pages -= count;
        log::trace!("first-fit '{}': claimed {count} pages at {addr:#x}", self.name);
        Ok(())
    }

    /// Clears the bitmap bits covering `[addr, addr + count pages)`.
    pub fn free(&self, addr: NonNull<u8>, count: usize) -> Result<()> {
        let addr = addr.as_ptr() as usize;
        if !self.region.contains(addr) {
            log::warn!("first-fit '{}': free {addr:#x} out of range", self.name);
            return Err(Error::OutOfRange(addr));
        }

        let start = self.region.page_index(addr);
        if start + count > self.region.pages() {
            log::warn!(
                "first-fit '{}': free run {start}+{count} crosses region end",
                self.name
            );
            return Err(Error::OutOfRange(addr));
        }

        let mut pages = self.pages.lock();
        pages.clear_run(start, count);
        pages.used_pages -= count;
        pages.free_pages += count;
        log::trace!("first-fit '{}': freed {count} pages at {addr:#x}", self.name);
        Ok(())
    }

    pub fn used_count(&self) -> usize {
        self.pages.lock().used_pages
    }

    pub fn free_count(&self) -> usize {
        self.pages.lock().free_pages
    }
}

impl PageProvider for FirstFit {
    unsafe fn with_region(name: &'static str, base: NonNull<u8>, pages: usize) -> Result<Self> {
        FirstFit::new(name, base, pages)
    }

    fn alloc_pages(&self, order: usize) -> Result<NonNull<u8>> {
        self.alloc(1 << order)
    }

    fn free_pages(&self, addr: NonNull<u8>, order: usize) -> Result<()> {
        self.free(addr, 1 << order)
    }

    fn used_count(&self) -> usize {
        self.used_count()
    }

    fn free_count(&self) -> usize {
        self.free_count()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use rand::Rng;

    use super::*;
    use crate::page::PAGE_SIZE;
    use crate::test_util::TestRegion;

    fn offset_of(region_base: usize, ptr: NonNull<u8>) -> usize {
        (ptr.as_ptr() as usize - region_base) / PAGE_SIZE
    }

    #[test]
    fn lowest_fitting_run() {
        let mem = TestRegion::new(16);
        let ff = unsafe { FirstFit::new("ff", mem.base(), 16) }.unwrap();
        let base = mem.base_addr();

        let a = ff.alloc(3).unwrap();
        let b = ff.alloc(2).unwrap();
        assert_eq!(offset_of(base, a), 0);
        assert_eq!(offset_of(base, b), 3);

        ff.free(a, 3).unwrap();

        // The freed 3-page hole is too small; the run lands after b.
        let c = ff.alloc(4).unwrap();
        assert_eq!(offset_of(base, c), 5);

        // A 3-page request fits the hole exactly.
        let d = ff.alloc(3).unwrap();
        assert_eq!(offset_of(base, d), 0);
    }

    #[test]
    fn rejects_bad_requests() {
        let mem = TestRegion::new(8);
        let ff = unsafe { FirstFit::new("ff", mem.base(), 8) }.unwrap();

        assert_eq!(ff.alloc(0), Err(Error::BadArgs));
        assert_eq!(ff.alloc(9), Err(Error::NoMemory));

        let outside =
            unsafe { NonNull::new_unchecked((mem.base_addr() + 8 * PAGE_SIZE) as *mut u8) };
        assert!(matches!(ff.free(outside, 1), Err(Error::OutOfRange(_))));

        // A run crossing the region end is rejected without mutation.
        let a = ff.alloc(2).unwrap();
        let last = unsafe {
            NonNull::new_unchecked((mem.base_addr() + 7 * PAGE_SIZE) as *mut u8)
        };
        assert!(matches!(ff.free(last, 2), Err(Error::OutOfRange(_))));
        assert_eq!(ff.used_count(), 2);
        ff.free(a, 2).unwrap();
        assert_eq!(ff.used_count(), 0);
    }

    #[test]
    fn fragmentation_requires_contiguity() {
        let mem = TestRegion::new(8);
        let ff = unsafe { FirstFit::new("ff", mem.base(), 8) }.unwrap();

        let blocks: Vec<_> = (0..8).map(|_| ff.alloc(1).unwrap()).collect();
        // Free every other page: four free pages but no two adjacent.
        for block in blocks.iter().step_by(2) {
            ff.free(*block, 1).unwrap();
        }
        assert_eq!(ff.free_count(), 4);
        assert_eq!(ff.alloc(2), Err(Error::NoMemory));
        assert!(ff.alloc(1).is_ok());
    }

    #[test]
    fn fixed_address_claims() {
        let mem = TestRegion::new(16);
        let ff = unsafe { FirstFit::new("ff", mem.base(), 16) }.unwrap();
        let base = mem.base_addr();

        let fixed = unsafe { NonNull::new_unchecked((base + 4 * PAGE_SIZE) as *mut u8) };
        ff.alloc_at(fixed, 3).unwrap();
        assert_eq!(ff.used_count(), 3);

        // The claimed run is skipped by ordinary allocation.
        let a = ff.alloc(6).unwrap();
        assert_eq!(offset_of(base, a), 7);

        // Overlapping and unaligned claims are rejected without mutation.
        assert_eq!(ff.alloc_at(fixed, 1), Err(Error::NoMemory));
        let unaligned = unsafe { NonNull::new_unchecked((base + 17) as *mut u8) };
        assert_eq!(ff.alloc_at(unaligned, 1), Err(Error::BadArgs));
        assert_eq!(ff.used_count(), 9);

        ff.free(fixed, 3).unwrap();
        ff.free(a, 6).unwrap();
        assert_eq!(ff.used_count(), 0);
    }

    #[test]
    fn rejects_oversized_region() {
        let mem = TestRegion::new(1);
        let err = unsafe { FirstFit::new("ff", mem.base(), MAX_PAGES + 1) };
        assert!(matches!(err, Err(Error::RegionTooLarge { .. })));
    }

    #[test]
    fn random_stress_conserves() {
        const PAGES: usize = 64;
        let mem = TestRegion::new(PAGES);
        let ff = unsafe { FirstFit::new("ff", mem.base(), PAGES) }.unwrap();

        let mut rng = rand::thread_rng();
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

        for _ in 0..10_000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let count = rng.gen_range(1..=4);
                if let Ok(ptr) = ff.alloc(count) {
                    live.push((ptr, count));
                }
            } else {
                let idx = rng.gen_range(0..live.len());
                let (ptr, count) = live.swap_remove(idx);
                ff.free(ptr, count).unwrap();
            }
            assert_eq!(ff.used_count() + ff.free_count(), PAGES);
        }

        for (ptr, count) in live {
            ff.free(ptr, count).unwrap();
        }
        assert_eq!(ff.free_count(), PAGES);
    }
}
