//! Slab object caches layered over a page provider.
//!
//! A [`SlabAllocator`] manages a set of caches, one per object size. Each
//! cache owns slabs: page blocks obtained from the provider, carved into
//! equally sized objects tracked through an in-block free-index stack. Slabs
//! move between the cache's `full`, `partial` and `free` lists as objects
//! are taken and returned.
//!
//! Cache descriptors themselves are slab objects, served by a descriptor
//! cache that is bootstrapped in place: its own descriptor is the first
//! object of its first slab, so every descriptor lives in region memory and
//! the allocator value stays movable.
//!
//! Slab layout within its page block:
//!
//! ```text
//! [Slab header][free-index: count x u32][colour pad][objects: count x size]
//! ```
//!
//! Lock ordering: per-cache lock, then the descriptor cache lock, then the
//! page provider lock. Only [`SlabAllocator::destroy`] holds all three.

use core::cell::UnsafeCell;
use core::fmt::Write as _;
use core::mem::size_of;
use core::ptr::{self, null_mut, NonNull};

use spin::Mutex;
use static_assertions::const_assert;

use crate::buddy::MAX_ORDERS;
use crate::error::{Error, Result};
use crate::page::{PageProvider, PAGE_SIZE};

/// Cache line size used to stagger object arrays across slabs.
const L1_LINE_SIZE: usize = 64;
/// Maximum cache name length, chosen to keep descriptors compact.
pub const CACHE_NAME_LEN: usize = 20;
/// Block order of the descriptor cache's slabs.
const DESCRIPTOR_CACHE_ORDER: u32 = 0;
/// Reserved name of the cache that serves cache descriptors.
pub const DESCRIPTOR_CACHE_NAME: &str = "descriptor-cache";
/// Name prefix of the size-class caches behind [`SlabAllocator::alloc`].
const CLASS_PREFIX: &str = "size-";

/// Smallest byte request served by [`SlabAllocator::alloc`].
pub const MIN_ALLOC: usize = 32;
/// Largest byte request served by [`SlabAllocator::alloc`].
pub const MAX_ALLOC: usize = 131072;

/// Object construction/destruction hook, run on raw object memory.
pub type ObjectCallback = fn(*mut u8);

/// Header at the base of every slab's page block.
#[repr(C)]
struct Slab {
    /// Cache line multiples the object array is shifted by.
    colour_off: u32,
    /// Objects currently handed out from this slab.
    in_use: u32,
    /// Top of the free-index stack; `free_index[next_free]` is its successor.
    next_free: u32,
    objects: *mut u8,
    free_index: *mut u32,
    prev: *mut Slab,
    next: *mut Slab,
    cache: *mut Cache,
}

/// Descriptor for one object size class. Lives in descriptor-cache slabs.
#[repr(C)]
struct Cache {
    full: *mut Slab,
    partial: *mut Slab,
    free: *mut Slab,
    /// Next cache in the allocator-wide chain.
    next: *mut Cache,
    name: heapless::String<CACHE_NAME_LEN>,
    object_size: usize,
    objects_per_slab: usize,
    /// Objects currently handed out.
    num_active: usize,
    /// Objects currently backed by slabs, handed out or not.
    num_allocations: usize,
    order: u32,
    colour_max: u32,
    colour_next: u32,
    /// Set when the cache grew since the last shrink; blocks one shrink pass.
    growing: bool,
    /// Last failure, in the numeric encoding of [`Error::code`].
    error_code: u8,
    ctor: Option<ObjectCallback>,
    dtor: Option<ObjectCallback>,
    lock: Mutex<()>,
}

// The descriptor cache must fit its own descriptor in one page, and the
// aligned object array must be good enough for descriptor structs.
const_assert!(objects_offset(1) + size_of::<Cache>() <= PAGE_SIZE);
const_assert!(core::mem::align_of::<Cache>() <= OBJECT_ALIGN);
const_assert!(PAGE_SIZE % L1_LINE_SIZE == 0);

impl Cache {
    fn vacant() -> Cache {
        Cache {
            full: null_mut(),
            partial: null_mut(),
            free: null_mut(),
            next: null_mut(),
            name: heapless::String::new(),
            object_size: 0,
            objects_per_slab: 0,
            num_active: 0,
            num_allocations: 0,
            order: 0,
            colour_max: 0,
            colour_next: 0,
            growing: false,
            error_code: 0,
            ctor: None,
            dtor: None,
            lock: Mutex::new(()),
        }
    }
}

/// Opaque handle to a cache descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRef(NonNull<Cache>);

unsafe impl Send for CacheRef {}
unsafe impl Sync for CacheRef {}

impl CacheRef {
    fn as_ptr(self) -> *mut Cache {
        self.0.as_ptr()
    }
}

/// Snapshot of one cache's bookkeeping, taken under its lock.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub name: heapless::String<CACHE_NAME_LEN>,
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub order: u32,
    pub full_slabs: usize,
    pub partial_slabs: usize,
    pub free_slabs: usize,
    pub num_active: usize,
    pub num_allocations: usize,
}

/// Object-cache allocator over a page provider.
pub struct SlabAllocator<P: PageProvider> {
    name: &'static str,
    provider: P,
    descriptor_cache: NonNull<Cache>,
    /// Head of the cache chain, guarded by the descriptor cache's lock.
    chain: UnsafeCell<*mut Cache>,
}

unsafe impl<P: PageProvider + Send> Send for SlabAllocator<P> {}
unsafe impl<P: PageProvider + Sync> Sync for SlabAllocator<P> {}

/// Alignment of the object array inside a slab. Keeps descriptor structs
/// legally addressable and gives byte allocations a usable natural
/// alignment.
const OBJECT_ALIGN: usize = 16;

/// Start of the object array for a slab holding `count` objects, before the
/// colour shift is applied.
const fn objects_offset(count: usize) -> usize {
    (size_of::<Slab>() + size_of::<u32>() * count + (OBJECT_ALIGN - 1)) & !(OBJECT_ALIGN - 1)
}

/// Slab geometry for one object size: block order, objects per slab and the
/// number of spare cache lines available for colouring.
fn slab_geometry(object_size: usize) -> Result<(u32, usize, u32)> {
    let per_object = size_of::<u32>()
        .checked_add(object_size)
        .ok_or(Error::BadArgs)?;
    let needed = per_object
        .checked_add(size_of::<Slab>())
        .ok_or(Error::BadArgs)?;

    let mut order = 0u32;
    let mut capacity = PAGE_SIZE;
    while capacity < needed {
        if order as usize + 1 >= MAX_ORDERS {
            return Err(Error::BadArgs);
        }
        order += 1;
        capacity <<= 1;
    }

    loop {
        let mut remaining = capacity - size_of::<Slab>();
        let mut count = 0;
        while remaining >= per_object {
            count += 1;
            remaining -= per_object;
        }
        // Aligning the object array eats into the budget; back off until
        // everything fits.
        while count > 0 && objects_offset(count) + count * object_size > capacity {
            count -= 1;
        }
        if count > 0 {
            let spare = capacity - objects_offset(count) - count * object_size;
            return Ok((order, count, (spare / L1_LINE_SIZE) as u32));
        }
        if order as usize + 1 >= MAX_ORDERS {
            return Err(Error::BadArgs);
        }
        order += 1;
        capacity <<= 1;
    }
}

/// Lays a fresh slab over `block`: header, free-index stack and, when the
/// cache has one, the constructor over every object slot.
unsafe fn slab_init(block: *mut u8, cache: *mut Cache, colour: u32) -> *mut Slab {
    let slab = block as *mut Slab;
    let count = (*cache).objects_per_slab;
    let free_index = block.add(size_of::<Slab>()) as *mut u32;
    let objects = block.add(objects_offset(count) + L1_LINE_SIZE * colour as usize);

    ptr::write(
        slab,
        Slab {
            colour_off: colour,
            in_use: 0,
            next_free: 0,
            objects,
            free_index,
            prev: null_mut(),
            next: null_mut(),
            cache,
        },
    );

    let mut object = objects;
    for index in 0..count {
        free_index.add(index).write(index as u32 + 1);
        if let Some(ctor) = (*cache).ctor {
            ctor(object);
        }
        object = object.add((*cache).object_size);
    }
    slab
}

unsafe fn list_push(head: &mut *mut Slab, slab: *mut Slab) {
    (*slab).prev = null_mut();
    (*slab).next = *head;
    if !(*head).is_null() {
        (**head).prev = slab;
    }
    *head = slab;
}

unsafe fn list_unlink(head: &mut *mut Slab, slab: *mut Slab) {
    let prev = (*slab).prev;
    let next = (*slab).next;
    if !prev.is_null() {
        (*prev).next = next;
    }
    if !next.is_null() {
        (*next).prev = prev;
    }
    if *head == slab {
        *head = next;
    }
    (*slab).prev = null_mut();
    (*slab).next = null_mut();
}

unsafe fn list_len(head: *mut Slab) -> usize {
    let mut len = 0;
    let mut slab = head;
    while !slab.is_null() {
        len += 1;
        slab = (*slab).next;
    }
    len
}

/// Walks a slab list for the slab whose page block contains `object`.
/// The slab base itself is header memory, never an object, hence strict.
unsafe fn find_slab(head: *mut Slab, object: *mut u8, slab_bytes: usize) -> Option<*mut Slab> {
    let addr = object as usize;
    let mut slab = head;
    while !slab.is_null() {
        let base = slab as usize;
        if addr > base && addr < base + slab_bytes {
            return Some(slab);
        }
        slab = (*slab).next;
    }
    None
}

impl<P: PageProvider> SlabAllocator<P> {
    /// Creates a slab allocator over `pages` pages starting at `base`,
    /// building its own page provider and bootstrapping the descriptor
    /// cache from one provider block.
    ///
    /// # Safety
    ///
    /// `base` must be page aligned and `[base, base + pages * PAGE_SIZE)`
    /// must be owned exclusively by the allocator for its whole lifetime.
    pub unsafe fn new(name: &'static str, base: NonNull<u8>, pages: usize) -> Result<Self> {
        let provider = P::with_region(name, base, pages)?;

        let (order, count, colour_max) = slab_geometry(size_of::<Cache>())?;
        debug_assert_eq!(order, DESCRIPTOR_CACHE_ORDER);

        let block = provider.alloc_pages(DESCRIPTOR_CACHE_ORDER as usize)?;
        let block_ptr = block.as_ptr();
        let free_index = block_ptr.add(size_of::<Slab>()) as *mut u32;
        let descriptors = block_ptr.add(objects_offset(count)) as *mut Cache;

        for index in 0..count {
            free_index.add(index).write(index as u32 + 1);
            ptr::write(descriptors.add(index), Cache::vacant());
        }

        // The descriptor cache describes itself through its first object.
        let cache = descriptors;
        let _ = (*cache).name.push_str(DESCRIPTOR_CACHE_NAME);
        (*cache).object_size = size_of::<Cache>();
        (*cache).objects_per_slab = count;
        (*cache).order = DESCRIPTOR_CACHE_ORDER;
        (*cache).num_active = 1;
        (*cache).num_allocations = count;
        (*cache).colour_max = colour_max;
        (*cache).colour_next = if colour_max > 0 { 1 } else { 0 };

        let slab = block_ptr as *mut Slab;
        ptr::write(
            slab,
            Slab {
                colour_off: 0,
                in_use: 1,
                next_free: 1,
                objects: descriptors as *mut u8,
                free_index,
                prev: null_mut(),
                next: null_mut(),
                cache,
            },
        );
        (*cache).partial = slab;

        log::debug!(
            "slab '{name}': bootstrapped descriptor cache, {count} descriptors per slab"
        );
        Ok(Self {
            name,
            provider,
            descriptor_cache: NonNull::new_unchecked(cache),
            chain: UnsafeCell::new(cache),
        })
    }

    /// Handle to the cache that serves cache descriptors.
    pub fn descriptor_cache(&self) -> CacheRef {
        CacheRef(self.descriptor_cache)
    }

    /// Finds or creates the cache named `name` for `size`-byte objects.
    ///
    /// An existing cache is returned when both name and size match. The
    /// constructor, when given, runs once per object slot at slab growth;
    /// the destructor runs on every free.
    pub fn create(
        &self,
        name: &str,
        size: usize,
        ctor: Option<ObjectCallback>,
        dtor: Option<ObjectCallback>,
    ) -> Result<CacheRef> {
        let descriptor_cache = self.descriptor_cache.as_ptr();
        unsafe {
            let _chain_guard = (*descriptor_cache).lock.lock();
            (*descriptor_cache).error_code = 0;

            if name.is_empty() || name.len() > CACHE_NAME_LEN || size == 0 {
                (*descriptor_cache).error_code = Error::BadArgs.code();
                log::warn!("slab '{}': bad cache args name='{name}' size={size}", self.name);
                return Err(Error::BadArgs);
            }
            if name == DESCRIPTOR_CACHE_NAME {
                (*descriptor_cache).error_code = Error::ReservedName.code();
                log::warn!("slab '{}': cache name '{name}' is reserved", self.name);
                return Err(Error::ReservedName);
            }

            let mut cur = *self.chain.get();
            while !cur.is_null() {
                if (*cur).name.as_str() == name && (*cur).object_size == size {
                    return Ok(CacheRef(NonNull::new_unchecked(cur)));
                }
                cur = (*cur).next;
            }

            let (order, objects_per_slab, colour_max) = match slab_geometry(size) {
                Ok(geometry) => geometry,
                Err(err) => {
                    (*descriptor_cache).error_code = err.code();
                    return Err(err);
                }
            };

            let descriptor = self.alloc_locked(descriptor_cache)? as *mut Cache;
            (*descriptor).name.clear();
            let _ = (*descriptor).name.push_str(name);
            (*descriptor).full = null_mut();
            (*descriptor).partial = null_mut();
            (*descriptor).free = null_mut();
            (*descriptor).object_size = size;
            (*descriptor).objects_per_slab = objects_per_slab;
            (*descriptor).num_active = 0;
            (*descriptor).num_allocations = 0;
            (*descriptor).order = order;
            (*descriptor).colour_max = colour_max;
            (*descriptor).colour_next = 0;
            (*descriptor).growing = false;
            (*descriptor).error_code = 0;
            (*descriptor).ctor = ctor;
            (*descriptor).dtor = dtor;
            (*descriptor).next = *self.chain.get();
            *self.chain.get() = descriptor;

            log::debug!(
                "slab '{}': created cache '{name}', size {size}, order {order}, {objects_per_slab} objects/slab",
                self.name
            );
            Ok(CacheRef(NonNull::new_unchecked(descriptor)))
        }
    }

    /// Takes one object from `cache`.
    pub fn alloc_object(&self, cache: CacheRef) -> Result<NonNull<u8>> {
        let cache = cache.as_ptr();
        unsafe {
            if (&(*cache).name).is_empty() {
                return Err(Error::BadArgs);
            }
            let _guard = (*cache).lock.lock();
            (*cache).error_code = 0;
            let object = self.alloc_locked(cache)?;
            Ok(NonNull::new_unchecked(object))
        }
    }

    /// Returns `object` to `cache`.
    pub fn free_object(&self, cache: CacheRef, object: NonNull<u8>) -> Result<()> {
        let cache = cache.as_ptr();
        unsafe {
            if (&(*cache).name).is_empty() {
                return Err(Error::BadArgs);
            }
            let _guard = (*cache).lock.lock();
            (*cache).error_code = 0;
            self.free_locked(cache, object.as_ptr())
        }
    }

    /// Releases every slab on the cache's free list, unless the cache grew
    /// since the previous shrink. Returns the number of pages freed.
    pub fn shrink(&self, cache: CacheRef) -> usize {
        let cache = cache.as_ptr();
        unsafe {
            let _guard = (*cache).lock.lock();
            (*cache).error_code = 0;

            let mut pages_freed = 0;
            if !(*cache).growing {
                let pages_per_slab = 1usize << (*cache).order;
                while !(*cache).free.is_null() {
                    let slab = (*cache).free;
                    list_unlink(&mut (*cache).free, slab);
                    let _ = self.provider.free_pages(
                        NonNull::new_unchecked(slab as *mut u8),
                        (*cache).order as usize,
                    );
                    (*cache).num_allocations -= (*cache).objects_per_slab;
                    pages_freed += pages_per_slab;
                }
            }
            (*cache).growing = false;

            if pages_freed > 0 {
                log::debug!(
                    "slab '{}': cache '{}' shrank by {pages_freed} pages",
                    self.name,
                    (*cache).name.as_str()
                );
            }
            pages_freed
        }
    }

    /// Unregisters `cache` and releases everything it owns, returning its
    /// descriptor to the descriptor cache.
    pub fn destroy(&self, cache: CacheRef) -> Result<()> {
        let cache = cache.as_ptr();
        let descriptor_cache = self.descriptor_cache.as_ptr();

        unsafe {
            if cache == descriptor_cache {
                let _chain_guard = (*descriptor_cache).lock.lock();
                (*descriptor_cache).error_code = Error::ReservedName.code();
                return Err(Error::ReservedName);
            }
            if (&(*cache).name).is_empty() {
                return Err(Error::BadArgs);
            }

            let cache_guard = (*cache).lock.lock();
            let _chain_guard = (*descriptor_cache).lock.lock();
            (*descriptor_cache).error_code = 0;

            // Locate the slab housing the descriptor before mutating anything.
            let slab_bytes = PAGE_SIZE << (*descriptor_cache).order;
            let (housing_slab, was_full) =
                match find_slab((*descriptor_cache).full, cache as *mut u8, slab_bytes) {
                    Some(slab) => (slab, true),
                    None => match find_slab(
                        (*descriptor_cache).partial,
                        cache as *mut u8,
                        slab_bytes,
                    ) {
                        Some(slab) => (slab, false),
                        None => {
                            (*descriptor_cache).error_code = Error::UnknownCache.code();
                            return Err(Error::UnknownCache);
                        }
                    },
                };

            let chain = self.chain.get();
            let mut prev: *mut Cache = null_mut();
            let mut cur = *chain;
            while !cur.is_null() && cur != cache {
                prev = cur;
                cur = (*cur).next;
            }
            if cur.is_null() {
                (*descriptor_cache).error_code = Error::UnknownCache.code();
                return Err(Error::UnknownCache);
            }
            if prev.is_null() {
                *chain = (*cache).next;
            } else {
                (*prev).next = (*cache).next;
            }
            (*cache).next = null_mut();

            // Hand every slab of the dying cache back to the provider.
            let order = (*cache).order as usize;
            for head in [(*cache).full, (*cache).partial, (*cache).free] {
                let mut slab = head;
                while !slab.is_null() {
                    let next = (*slab).next;
                    let _ = self
                        .provider
                        .free_pages(NonNull::new_unchecked(slab as *mut u8), order);
                    slab = next;
                }
            }
            (*cache).full = null_mut();
            (*cache).partial = null_mut();
            (*cache).free = null_mut();

            // Push the descriptor back onto its housing slab's free stack.
            let index =
                (cache as usize - (*housing_slab).objects as usize) / size_of::<Cache>();
            (*housing_slab).free_index.add(index).write((*housing_slab).next_free);
            (*housing_slab).next_free = index as u32;
            (*housing_slab).in_use -= 1;
            (*descriptor_cache).num_active -= 1;
            (*cache).name.clear();
            (*cache).object_size = 0;

            let now_empty = (*housing_slab).in_use == 0;
            if was_full {
                list_unlink(&mut (*descriptor_cache).full, housing_slab);
                if now_empty {
                    list_push(&mut (*descriptor_cache).free, housing_slab);
                } else {
                    list_push(&mut (*descriptor_cache).partial, housing_slab);
                }
            } else if now_empty {
                list_unlink(&mut (*descriptor_cache).partial, housing_slab);
                list_push(&mut (*descriptor_cache).free, housing_slab);
            }

            // The descriptor is free memory from here on; release its lock
            // before its slab can be handed back to the provider.
            drop(cache_guard);

            let mut free_slabs = list_len((*descriptor_cache).free);
            while free_slabs > 1 {
                let slab = (*descriptor_cache).free;
                list_unlink(&mut (*descriptor_cache).free, slab);
                let _ = self.provider.free_pages(
                    NonNull::new_unchecked(slab as *mut u8),
                    (*descriptor_cache).order as usize,
                );
                (*descriptor_cache).num_allocations -= (*descriptor_cache).objects_per_slab;
                free_slabs -= 1;
            }

            log::debug!("slab '{}': destroyed a cache", self.name);
            Ok(())
        }
    }

    /// Byte-granularity allocation through power-of-two size classes.
    ///
    /// The request is rounded up to the next power of two and served from a
    /// cache named `size-<class>`, created on first use.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        if !(MIN_ALLOC..=MAX_ALLOC).contains(&size) {
            let descriptor_cache = self.descriptor_cache.as_ptr();
            unsafe {
                let _guard = (*descriptor_cache).lock.lock();
                (*descriptor_cache).error_code = Error::BadArgs.code();
            }
            log::warn!(
                "slab '{}': byte request {size} outside [{MIN_ALLOC}, {MAX_ALLOC}]",
                self.name
            );
            return Err(Error::BadArgs);
        }

        let class = size.next_power_of_two();
        let mut name: heapless::String<CACHE_NAME_LEN> = heapless::String::new();
        let _ = write!(&mut name, "{CLASS_PREFIX}{class}");
        let cache = self.create(name.as_str(), class, None, None)?;
        self.alloc_object(cache)
    }

    /// Frees a pointer obtained from [`SlabAllocator::alloc`], locating the
    /// owning size-class cache by scanning slab page ranges. Caches with any
    /// fully free slab are shrunk afterwards.
    pub fn free(&self, object: NonNull<u8>) -> Result<()> {
        let cache = match self.find_class_cache(object.as_ptr()) {
            Some(cache) => cache,
            None => {
                log::warn!(
                    "slab '{}': free of {:#x} matches no size class",
                    self.name,
                    object.as_ptr() as usize
                );
                return Err(Error::UnknownObject);
            }
        };
        self.free_object(cache, object)?;
        unsafe {
            if !(*cache.as_ptr()).free.is_null() {
                self.shrink(cache);
            }
        }
        Ok(())
    }

    /// Frees an object through an interior pointer whose immediately
    /// preceding word stores the object's base address. Used by facade
    /// wrappers that over-align inside a larger object; the recovered
    /// pointer is validated against the owning slab before anything mutates.
    pub fn free_embedded(&self, interior: NonNull<u8>) -> Result<()> {
        let cache = self
            .find_class_cache(interior.as_ptr())
            .ok_or(Error::UnknownObject)?;
        let cache_ptr = cache.as_ptr();

        unsafe {
            let guard = (*cache_ptr).lock.lock();
            (*cache_ptr).error_code = 0;

            let slab_bytes = PAGE_SIZE << (*cache_ptr).order;
            let slab = match find_slab((*cache_ptr).full, interior.as_ptr(), slab_bytes) {
                Some(slab) => slab,
                None => match find_slab((*cache_ptr).partial, interior.as_ptr(), slab_bytes) {
                    Some(slab) => slab,
                    None => return Err(Error::UnknownObject),
                },
            };

            let addr = interior.as_ptr() as usize;
            let objects = (*slab).objects as usize;
            if addr < objects + size_of::<usize>() {
                (*cache_ptr).error_code = Error::MisalignedObject.code();
                return Err(Error::MisalignedObject);
            }
            let raw = *((addr - size_of::<usize>()) as *const usize);
            if raw < objects || raw >= addr || (raw - objects) % (*cache_ptr).object_size != 0 {
                (*cache_ptr).error_code = Error::MisalignedObject.code();
                return Err(Error::MisalignedObject);
            }

            self.free_locked(cache_ptr, raw as *mut u8)?;
            drop(guard);

            if !(*cache_ptr).free.is_null() {
                self.shrink(cache);
            }
        }
        Ok(())
    }

    /// Size class backing `object`, or 0 when the pointer is not exactly at
    /// an object boundary of a size-class slab.
    pub fn alloc_size(&self, object: NonNull<u8>) -> usize {
        let cache = match self.find_class_cache(object.as_ptr()) {
            Some(cache) => cache.as_ptr(),
            None => return 0,
        };
        unsafe {
            let _guard = (*cache).lock.lock();
            let slab_bytes = PAGE_SIZE << (*cache).order;
            let slab = match find_slab((*cache).full, object.as_ptr(), slab_bytes) {
                Some(slab) => slab,
                None => match find_slab((*cache).partial, object.as_ptr(), slab_bytes) {
                    Some(slab) => slab,
                    None => return 0,
                },
            };
            let addr = object.as_ptr() as usize;
            let objects = (*slab).objects as usize;
            if addr >= objects
                && (addr - objects) % (*cache).object_size == 0
                && (addr - objects) / (*cache).object_size < (*cache).objects_per_slab
            {
                (*cache).object_size
            } else {
                0
            }
        }
    }

    /// Last recorded failure of `cache`, if any.
    pub fn last_error(&self, cache: CacheRef) -> Option<Error> {
        let cache = cache.as_ptr();
        unsafe {
            let _guard = (*cache).lock.lock();
            Error::from_code((*cache).error_code)
        }
    }

    pub fn stats(&self, cache: CacheRef) -> CacheStats {
        let cache = cache.as_ptr();
        unsafe {
            let _guard = (*cache).lock.lock();
            CacheStats {
                name: (*cache).name.clone(),
                object_size: (*cache).object_size,
                objects_per_slab: (*cache).objects_per_slab,
                order: (*cache).order,
                full_slabs: list_len((*cache).full),
                partial_slabs: list_len((*cache).partial),
                free_slabs: list_len((*cache).free),
                num_active: (*cache).num_active,
                num_allocations: (*cache).num_allocations,
            }
        }
    }

    /// Logs a one-line occupancy report for `cache`.
    pub fn log_info(&self, cache: CacheRef) {
        let stats = self.stats(cache);
        let slabs = stats.full_slabs + stats.partial_slabs + stats.free_slabs;
        log::info!(
            "cache '{}': {} byte objects, {}/slab, {} slabs of 2^{} pages, {}/{} objects active",
            stats.name.as_str(),
            stats.object_size,
            stats.objects_per_slab,
            slabs,
            stats.order,
            stats.num_active,
            stats.num_allocations,
        );
    }

    /// Logs an occupancy report for every registered cache. The chain is
    /// walked unlocked, as registration and teardown are expected to be
    /// quiescent while diagnostics run.
    pub fn log_all_info(&self) {
        let mut cur = unsafe { *self.chain.get() };
        while !cur.is_null() {
            self.log_info(CacheRef(unsafe { NonNull::new_unchecked(cur) }));
            cur = unsafe { (*cur).next };
        }
    }

    pub fn used_count(&self) -> usize {
        self.provider.used_count()
    }

    pub fn free_count(&self) -> usize {
        self.provider.free_count()
    }

    /// Picks a slab with room (partial first, then free), growing the cache
    /// by one provider block when both lists are empty, and pops one object.
    /// The cache's lock must be held.
    unsafe fn alloc_locked(&self, cache: *mut Cache) -> Result<*mut u8> {
        let mut slab = (*cache).partial;
        let mut from_free = false;
        if slab.is_null() {
            slab = (*cache).free;
            from_free = !slab.is_null();
        }

        if slab.is_null() {
            let block = match self.provider.alloc_pages((*cache).order as usize) {
                Ok(block) => block,
                Err(_) => {
                    (*cache).error_code = Error::NoMemory.code();
                    log::warn!(
                        "slab '{}': cache '{}' cannot grow",
                        self.name,
                        (*cache).name.as_str()
                    );
                    return Err(Error::NoMemory);
                }
            };

            let colour = (*cache).colour_next;
            (*cache).colour_next = ((*cache).colour_next + 1) % ((*cache).colour_max + 1);
            slab = slab_init(block.as_ptr(), cache, colour);
            list_push(&mut (*cache).partial, slab);
            (*cache).num_allocations += (*cache).objects_per_slab;
            (*cache).growing = true;
            log::trace!(
                "slab '{}': cache '{}' grew by one slab (colour {colour})",
                self.name,
                (*cache).name.as_str()
            );
        }

        let object = (*slab)
            .objects
            .add((*slab).next_free as usize * (*cache).object_size);
        (*slab).next_free = *(*slab).free_index.add((*slab).next_free as usize);
        (*slab).in_use += 1;
        (*cache).num_active += 1;

        let now_full = (*slab).in_use as usize == (*cache).objects_per_slab;
        if from_free {
            list_unlink(&mut (*cache).free, slab);
            if now_full {
                list_push(&mut (*cache).full, slab);
            } else {
                list_push(&mut (*cache).partial, slab);
            }
        } else if now_full {
            list_unlink(&mut (*cache).partial, slab);
            list_push(&mut (*cache).full, slab);
        }

        Ok(object)
    }

    /// Validates `object` against the cache's slabs, then pushes its index
    /// and updates list membership. The cache's lock must be held. Nothing
    /// is mutated on a rejected pointer.
    unsafe fn free_locked(&self, cache: *mut Cache, object: *mut u8) -> Result<()> {
        let slab_bytes = PAGE_SIZE << (*cache).order;
        let (slab, was_full) = match find_slab((*cache).full, object, slab_bytes) {
            Some(slab) => (slab, true),
            None => match find_slab((*cache).partial, object, slab_bytes) {
                Some(slab) => (slab, false),
                None => {
                    (*cache).error_code = Error::UnknownObject.code();
                    log::warn!(
                        "slab '{}': {:#x} not owned by cache '{}'",
                        self.name,
                        object as usize,
                        (*cache).name.as_str()
                    );
                    return Err(Error::UnknownObject);
                }
            },
        };

        let addr = object as usize;
        let objects = (*slab).objects as usize;
        let misaligned = addr < objects
            || (addr - objects) % (*cache).object_size != 0
            || (addr - objects) / (*cache).object_size >= (*cache).objects_per_slab;
        if misaligned {
            (*cache).error_code = Error::MisalignedObject.code();
            log::warn!(
                "slab '{}': {:#x} not on an object boundary of cache '{}'",
                self.name,
                addr,
                (*cache).name.as_str()
            );
            return Err(Error::MisalignedObject);
        }

        let index = (addr - objects) / (*cache).object_size;
        (*slab).free_index.add(index).write((*slab).next_free);
        (*slab).next_free = index as u32;
        (*slab).in_use -= 1;
        (*cache).num_active -= 1;

        if let Some(dtor) = (*cache).dtor {
            dtor(object);
        }

        let now_empty = (*slab).in_use == 0;
        if was_full {
            list_unlink(&mut (*cache).full, slab);
            if now_empty {
                list_push(&mut (*cache).free, slab);
            } else {
                list_push(&mut (*cache).partial, slab);
            }
        } else if now_empty {
            list_unlink(&mut (*cache).partial, slab);
            list_push(&mut (*cache).free, slab);
        }
        Ok(())
    }

    /// Owner lookup for size-class objects: scans every `size-` cache's full
    /// and partial slabs for a page range containing `object`. Only caches
    /// of the size-class family may own facade-issued pointers.
    fn find_class_cache(&self, object: *mut u8) -> Option<CacheRef> {
        let descriptor_cache = self.descriptor_cache.as_ptr();
        unsafe {
            let _guard = (*descriptor_cache).lock.lock();
            let mut cur = *self.chain.get();
            while !cur.is_null() {
                if (*cur).name.as_str().starts_with(CLASS_PREFIX) {
                    let slab_bytes = PAGE_SIZE << (*cur).order;
                    if find_slab((*cur).full, object, slab_bytes).is_some()
                        || find_slab((*cur).partial, object, slab_bytes).is_some()
                    {
                        return Some(CacheRef(NonNull::new_unchecked(cur)));
                    }
                }
                cur = (*cur).next;
            }
            None
        }
    }
}
