//! Power-of-two page-block allocator with buddy coalescing.
//!
//! The region's page count is decomposed into its binary set bits at
//! construction, one free block per bit, smallest block first at the lowest
//! offset. Free blocks store their own list link in their first bytes, so
//! the allocator needs no side tables beyond the per-order list heads.

use core::mem::size_of;
use core::ptr::NonNull;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use spin::Mutex;
use static_assertions::const_assert;

use crate::error::{Error, Result};
use crate::page::{PageProvider, PAGE_SHIFT, PAGE_SIZE};
use crate::region::Region;

/// Upper bound on the number of order levels an instance may use.
pub const MAX_ORDERS: usize = 32;

const_assert!(size_of::<FreeBlock>() <= PAGE_SIZE);

/// Link node written into the first bytes of every free block.
#[repr(C)]
struct FreeBlock {
    link: LinkedListLink,
}

impl FreeBlock {
    unsafe fn init(this: *mut Self) -> &'static FreeBlock {
        this.write(FreeBlock {
            link: LinkedListLink::new(),
        });
        &*this
    }
}

intrusive_adapter!(FreeBlockAdapter<'a> = &'a FreeBlock: FreeBlock { link: LinkedListLink });

type FreeList = LinkedList<FreeBlockAdapter<'static>>;

struct FreeAreas {
    lists: [FreeList; MAX_ORDERS],
    used_pages: usize,
    free_pages: usize,
}

/// `Buddy` manages a region of pages and hands out power-of-two blocks.
pub struct Buddy {
    name: &'static str,
    region: Region,
    /// Number of order levels: block sizes run 1, 2, .., 2^(num_orders-1).
    num_orders: usize,
    areas: Mutex<FreeAreas>,
}

unsafe impl Send for Buddy {}
unsafe impl Sync for Buddy {}

impl Buddy {
    /// Creates a buddy allocator over `pages` pages starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be page aligned and `[base, base + pages * PAGE_SIZE)`
    /// must be owned exclusively by the allocator for its whole lifetime.
    /// Free region memory is used to store the free lists themselves.
    pub unsafe fn new(name: &'static str, base: NonNull<u8>, pages: usize) -> Result<Self> {
        let region = Region::new(base, pages)?;
        let num_orders = pages.ilog2() as usize + 1;
        if num_orders > MAX_ORDERS {
            log::warn!("buddy '{name}': {pages} pages needs {num_orders} orders, max {MAX_ORDERS}");
            return Err(Error::RegionTooLarge {
                pages,
                max: (1 << MAX_ORDERS) - 1,
            });
        }

        log::debug!(
            "buddy '{name}': managing {pages} pages at {:#x}, max order {}",
            region.base_addr(),
            num_orders - 1
        );

        let mut areas = FreeAreas {
            lists: core::array::from_fn(|_| FreeList::default()),
            used_pages: 0,
            free_pages: pages,
        };

        // One free block per set bit of the page count, lowest offset first.
        let mut page_offset = 0;
        for order in 0..num_orders {
            if pages & (1 << order) != 0 {
                let addr = region.page_addr(page_offset);
                areas.lists[order].push_front(FreeBlock::init(addr as *mut FreeBlock));
                page_offset += 1 << order;
            }
        }

        Ok(Self {
            name,
            region,
            num_orders,
            areas: Mutex::new(areas),
        })
    }

    /// Largest span the instance can describe, in pages.
    fn max_span_pages(&self) -> usize {
        1 << (self.num_orders - 1)
    }

    /// Returns a page-aligned block of `2^order` pages.
    pub fn alloc(&self, order: usize) -> Result<NonNull<u8>> {
        if order >= self.num_orders {
            log::warn!("buddy '{}': order {order} >= {}", self.name, self.num_orders);
            return Err(Error::InvalidOrder(order));
        }

        let mut areas = self.areas.lock();
        for source in order..self.num_orders {
            if areas.lists[source].is_empty() {
                continue;
            }

            let block = areas.lists[source].pop_front().unwrap();
            let addr = block as *const FreeBlock as usize;

            // Split down to the requested size, pushing the upper halves.
            let mut current = source;
            while current > order {
                current -= 1;
                let buddy = addr + (PAGE_SIZE << current);
                areas.lists[current].push_front(unsafe { FreeBlock::init(buddy as *mut FreeBlock) });
            }

            let pages = 1 << order;
            areas.used_pages += pages;
            areas.free_pages -= pages;

            log::trace!(
                "buddy '{}': alloc order {order} -> {addr:#x} (split from {source})",
                self.name
            );
            return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
        }

        log::warn!("buddy '{}': no free block of order {order}", self.name);
        Err(Error::NoMemory)
    }

    /// Returns a block to the free lists, coalescing with its buddy as long
    /// as the buddy is also free.
    pub fn free(&self, addr: NonNull<u8>, order: usize) -> Result<()> {
        if order >= self.num_orders {
            log::warn!("buddy '{}': free order {order} >= {}", self.name, self.num_orders);
            return Err(Error::InvalidOrder(order));
        }

        let base = self.region.base_addr();
        let mut addr = addr.as_ptr() as usize;
        if addr < base || addr >= base + self.max_span_pages() * PAGE_SIZE {
            log::warn!("buddy '{}': free {addr:#x} out of range", self.name);
            return Err(Error::OutOfRange(addr));
        }

        let mut areas = self.areas.lock();

        // Counters move exactly once, before any coalescing.
        let pages = 1 << order;
        areas.used_pages -= pages;
        areas.free_pages += pages;

        let mut order = order;
        while order + 1 < self.num_orders {
            let span = PAGE_SIZE << order;
            let right = addr + span;
            let left = addr.checked_sub(span).filter(|&a| a >= base);

            let mut merged_addr = None;
            let mut cursor = areas.lists[order].front_mut();
            loop {
                let node_addr = match cursor.get() {
                    Some(node) => node as *const FreeBlock as usize,
                    None => break,
                };
                if node_addr == right && self.pair_aligned(addr, order) {
                    cursor.remove();
                    merged_addr = Some(addr);
                    break;
                }
                if Some(node_addr) == left && self.pair_aligned(node_addr, order) {
                    cursor.remove();
                    merged_addr = Some(node_addr);
                    break;
                }
                cursor.move_next();
            }

            match merged_addr {
                Some(lower) => {
                    log::trace!(
                        "buddy '{}': merged {lower:#x} order {order} -> {}",
                        self.name,
                        order + 1
                    );
                    addr = lower;
                    order += 1;
                }
                None => break,
            }
        }

        areas.lists[order].push_front(unsafe { FreeBlock::init(addr as *mut FreeBlock) });
        Ok(())
    }

    /// A pair starting at `lower` merges into a valid parent only if the
    /// parent is aligned to its own size and stays inside the managed span.
    fn pair_aligned(&self, lower: usize, order: usize) -> bool {
        let parent_pages = 1usize << (order + 1);
        let page_offset = (lower - self.region.base_addr()) >> PAGE_SHIFT;
        page_offset % parent_pages == 0 && page_offset + parent_pages <= self.max_span_pages()
    }

    pub fn used_count(&self) -> usize {
        self.areas.lock().used_pages
    }

    pub fn free_count(&self) -> usize {
        self.areas.lock().free_pages
    }

    #[cfg(test)]
    /// Free block addresses per order, for structural assertions.
    fn free_blocks(&self) -> std::vec::Vec<std::vec::Vec<usize>> {
        let areas = self.areas.lock();
        (0..self.num_orders)
            .map(|order| {
                areas.lists[order]
                    .iter()
                    .map(|node| node as *const FreeBlock as usize)
                    .collect()
            })
            .collect()
    }
}

impl PageProvider for Buddy {
    unsafe fn with_region(name: &'static str, base: NonNull<u8>, pages: usize) -> Result<Self> {
        Buddy::new(name, base, pages)
    }

    fn alloc_pages(&self, order: usize) -> Result<NonNull<u8>> {
        self.alloc(order)
    }

    fn free_pages(&self, addr: NonNull<u8>, order: usize) -> Result<()> {
        self.free(addr, order)
    }

    fn used_count(&self) -> usize {
        self.used_count()
    }

    fn free_count(&self) -> usize {
        self.free_count()
    }
}
