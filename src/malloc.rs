//! C-like byte-granularity facade over the slab layer.
//!
//! Null pointers stand in for allocation failure, matching the classic
//! malloc contract; richer error detail stays inspectable through the
//! underlying [`SlabAllocator`].

use core::mem::size_of;
use core::ptr::{self, null_mut, NonNull};

use crate::error::{Error, Result};
use crate::page::{PageProvider, PAGE_SHIFT};
use crate::slab::{SlabAllocator, MIN_ALLOC};

/// The malloc-family entry points over a slab allocator.
pub struct Malloc<P: PageProvider> {
    slab: SlabAllocator<P>,
}

impl<P: PageProvider> Malloc<P> {
    /// Creates a malloc facade over `bytes` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be page aligned and `[base, base + bytes)` must be owned
    /// exclusively by the allocator for its whole lifetime.
    pub unsafe fn new(name: &'static str, base: NonNull<u8>, bytes: usize) -> Result<Self> {
        Ok(Self {
            slab: SlabAllocator::new(name, base, bytes >> PAGE_SHIFT)?,
        })
    }

    /// At least `size` usable bytes, or null. Zero-size requests yield null.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        // Sub-minimum requests are padded up to the smallest size class.
        let size = size.max(MIN_ALLOC);
        match self.slab.alloc(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => null_mut(),
        }
    }

    /// `count * size` zero-filled bytes, with overflow detection.
    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        if count == 0 || size == 0 {
            return null_mut();
        }
        if count > usize::MAX / size {
            return null_mut();
        }

        let total = count * size;
        let ptr = self.malloc(total);
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// Resizes `ptr` to `new_size`, preserving `min(old, new)` bytes.
    ///
    /// Shrinks that would still leave more than half the block in use keep
    /// the block in place; anything else moves to a fresh allocation.
    pub fn realloc(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return null_mut();
        }

        let old_size = self.malloc_size(ptr);
        if new_size <= old_size && old_size - new_size < old_size / 2 {
            return ptr;
        }

        let new_ptr = self.malloc(new_size);
        if new_ptr.is_null() {
            return null_mut();
        }
        unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size)) };
        self.free(ptr);
        new_ptr
    }

    /// `size` bytes aligned to `align`, which must be a nonzero power of
    /// two. Alignments within the pointer width forward straight to
    /// [`Malloc::malloc`]; larger ones over-allocate and stash the object
    /// base in the word before the returned address so [`Malloc::free`] can
    /// recover it.
    pub fn aligned_alloc(&self, align: usize, size: usize) -> *mut u8 {
        if align == 0 || !align.is_power_of_two() || size == 0 {
            return null_mut();
        }
        if align <= size_of::<usize>() {
            return self.malloc(size);
        }

        let total = match size
            .checked_add(align - 1)
            .and_then(|total| total.checked_add(size_of::<usize>()))
        {
            Some(total) => total,
            None => return null_mut(),
        };
        let raw = self.malloc(total);
        if raw.is_null() {
            return null_mut();
        }

        let raw_addr = raw as usize;
        let aligned = (raw_addr + size_of::<usize>() + align - 1) & !(align - 1);
        unsafe { (aligned as *mut usize).sub(1).write(raw_addr) };
        aligned as *mut u8
    }

    /// Releases `ptr`. Null is a no-op; pointers from [`Malloc::aligned_alloc`]
    /// are recognized and unwound to their backing object.
    pub fn free(&self, ptr: *mut u8) {
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return,
        };
        match self.slab.free(ptr) {
            Ok(()) => {}
            Err(Error::MisalignedObject) => {
                if let Err(err) = self.slab.free_embedded(ptr) {
                    log::warn!(
                        "malloc: free({:#x}) unrecoverable: {err}",
                        ptr.as_ptr() as usize
                    );
                }
            }
            Err(err) => {
                log::warn!("malloc: free({:#x}) failed: {err}", ptr.as_ptr() as usize);
            }
        }
    }

    /// Usable size of the block behind `ptr`, 0 for null or foreign
    /// pointers.
    pub fn malloc_size(&self, ptr: *mut u8) -> usize {
        match NonNull::new(ptr) {
            Some(ptr) => self.slab.alloc_size(ptr),
            None => 0,
        }
    }

    /// The object allocator behind the facade.
    pub fn slab(&self) -> &SlabAllocator<P> {
        &self.slab
    }

    pub fn used_pages(&self) -> usize {
        self.slab.used_count()
    }

    pub fn free_pages(&self) -> usize {
        self.slab.free_count()
    }
}
