use core::ptr::NonNull;

use crate::error::Result;

pub const PAGE_SHIFT: usize = 12;
/// Granularity of the page-level allocators.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Order-based page interface consumed by the slab layer.
///
/// An `order` names a block of `2^order` contiguous pages. Addresses handed
/// back to [`PageProvider::free_pages`] must have been returned by
/// [`PageProvider::alloc_pages`] on the same instance with the same order.
pub trait PageProvider {
    /// Builds a provider over `pages` pages starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a page-aligned range of `pages * PAGE_SIZE`
    /// bytes owned exclusively by the new provider for its whole lifetime.
    unsafe fn with_region(name: &'static str, base: NonNull<u8>, pages: usize) -> Result<Self>
    where
        Self: Sized;

    /// Returns a page-aligned block of `2^order` contiguous pages.
    fn alloc_pages(&self, order: usize) -> Result<NonNull<u8>>;

    /// Returns a block previously obtained from [`PageProvider::alloc_pages`].
    fn free_pages(&self, addr: NonNull<u8>, order: usize) -> Result<()>;

    /// Pages currently handed out.
    fn used_count(&self) -> usize;

    /// Pages currently available.
    fn free_count(&self) -> usize;
}
