//! Multi-strategy memory allocation for freestanding environments.
//!
//! The crate owns a caller-supplied contiguous memory region and services
//! allocation requests against it without touching any host allocator.
//! Three strategies compose over one region:
//!
//! * [`Buddy`] - power-of-two page-block allocator with coalescing.
//! * [`FirstFit`] - bitmap allocator returning the lowest free page run.
//! * [`SlabAllocator`] - per-size-class object caches layered over either
//!   page provider.
//!
//! [`Malloc`] wraps the slab layer in a C-like byte-granularity facade
//! (`malloc`/`calloc`/`realloc`/`aligned_alloc`/`free`/`malloc_size`), and
//! [`Bump`] offers a trivial monotonic allocator for early initialization.
//!
//! Diagnostics go through the `log` crate and cost nothing when no logger
//! is installed. All allocators are internally locked with spinlocks; see
//! the module docs for the lock ordering rules.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod buddy;
pub mod bump;
pub mod error;
pub mod first_fit;
pub mod malloc;
pub mod page;
pub mod region;
pub mod slab;

#[cfg(test)]
pub(crate) mod test_util;

pub use buddy::Buddy;
pub use bump::Bump;
pub use error::{Error, Result};
pub use first_fit::FirstFit;
pub use malloc::Malloc;
pub use page::{PageProvider, PAGE_SHIFT, PAGE_SIZE};
pub use region::Region;
pub use slab::{CacheRef, CacheStats, SlabAllocator};
