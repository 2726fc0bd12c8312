//! Monotonic allocator for early initialization.
//!
//! Hands out bytes front-to-back from its region and never reclaims them.
//! Useful for carving boot-time metadata before a real allocator exists.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Cursor alignment applied to every allocation.
const ALIGN: usize = 16;

pub struct Bump {
    name: &'static str,
    start: usize,
    end: usize,
    cursor: AtomicUsize,
}

unsafe impl Send for Bump {}
unsafe impl Sync for Bump {}

impl Bump {
    /// Creates a bump allocator over `bytes` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `[base, base + bytes)` must be valid memory owned exclusively by the
    /// allocator for its whole lifetime.
    pub unsafe fn new(name: &'static str, base: NonNull<u8>, bytes: usize) -> Result<Self> {
        let start = base.as_ptr() as usize;
        if bytes == 0 {
            return Err(Error::InvalidRegion(start));
        }
        log::debug!("bump '{name}': managing {bytes} bytes at {start:#x}");
        Ok(Self {
            name,
            start,
            end: start + bytes,
            cursor: AtomicUsize::new(start),
        })
    }

    /// Advances the cursor by `bytes`, aligned to 16.
    pub fn alloc(&self, bytes: usize) -> Result<NonNull<u8>> {
        if bytes == 0 {
            return Err(Error::BadArgs);
        }

        loop {
            let cur = self.cursor.load(Ordering::Acquire);
            let aligned = (cur + (ALIGN - 1)) & !(ALIGN - 1);
            let next = match aligned.checked_add(bytes) {
                Some(next) if next <= self.end => next,
                _ => {
                    log::warn!(
                        "bump '{}': exhausted, requested {bytes}, remaining {}",
                        self.name,
                        self.end.saturating_sub(aligned)
                    );
                    return Err(Error::BumpExhausted(bytes));
                }
            };

            if self
                .cursor
                .compare_exchange_weak(cur, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) });
            }
        }
    }

    /// Individual blocks are never reclaimed.
    pub fn free(&self, _addr: NonNull<u8>, _bytes: usize) {}

    /// Per-block sizes are not tracked.
    pub fn alloc_size(&self, _addr: NonNull<u8>) -> usize {
        0
    }

    pub fn used_count(&self) -> usize {
        self.cursor.load(Ordering::Acquire) - self.start
    }

    pub fn free_count(&self) -> usize {
        self.end - self.cursor.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::page::PAGE_SIZE;
    use crate::test_util::TestRegion;

    #[test]
    fn monotonic_aligned() {
        let mem = TestRegion::new(1);
        let bump = unsafe { Bump::new("bump", mem.base(), PAGE_SIZE) }.unwrap();

        let a = bump.alloc(10).unwrap();
        let b = bump.alloc(10).unwrap();
        assert_eq!(a.as_ptr() as usize % ALIGN, 0);
        assert_eq!(b.as_ptr() as usize % ALIGN, 0);
        assert!((b.as_ptr() as usize) >= a.as_ptr() as usize + 10);
        assert_eq!(bump.used_count() + bump.free_count(), PAGE_SIZE);
    }

    #[test]
    fn exhaustion() {
        let mem = TestRegion::new(1);
        let bump = unsafe { Bump::new("bump", mem.base(), PAGE_SIZE) }.unwrap();

        assert!(bump.alloc(PAGE_SIZE).is_ok());
        assert_eq!(bump.alloc(1), Err(Error::BumpExhausted(1)));
    }

    #[test]
    fn free_is_noop() {
        let mem = TestRegion::new(1);
        let bump = unsafe { Bump::new("bump", mem.base(), PAGE_SIZE) }.unwrap();

        let a = bump.alloc(32).unwrap();
        let used = bump.used_count();
        bump.free(a, 32);
        assert_eq!(bump.used_count(), used);
        assert_eq!(bump.alloc_size(a), 0);
    }

    #[test]
    fn rejects_zero() {
        let mem = TestRegion::new(1);
        let bump = unsafe { Bump::new("bump", mem.base(), PAGE_SIZE) }.unwrap();
        assert_eq!(bump.alloc(0), Err(Error::BadArgs));
    }
}
