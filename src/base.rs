use core::{num::NonZeroUsize, ptr::NonNull};

use crate::{page::PhysAddr, polyfill::NonNullStrict};

/// A pointer to the base of the region of memory managed by an allocator.
///
/// Besides carrying the provenance of the region, this translates between
/// host addresses of the backing memory and the physical addresses the
/// allocator hands out.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    phys: PhysAddr,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`, which backs physical address `phys`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, phys: PhysAddr, extent: usize) -> BasePtr {
        ptr.addr()
            .get()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, phys, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn limit(self) -> NonZeroUsize {
        // Checked in `new`.
        NonZeroUsize::new(self.ptr.addr().get() + self.extent).unwrap()
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr < self.limit()
    }

    #[inline]
    pub fn contains_phys(self, phys: PhysAddr) -> bool {
        phys.offset_from(self.phys)
            .map_or(false, |ofs| ofs < self.extent)
    }

    /// Calculates the offset from `self` to `block`.
    #[inline]
    pub fn offset_to(self, block: NonZeroUsize) -> usize {
        block.get().checked_sub(self.ptr.addr().get()).unwrap()
    }

    /// Returns the host address backing physical address `phys`.
    ///
    /// # Panics
    ///
    /// Panics if `phys` is outside the region.
    #[inline]
    pub fn addr_of(self, phys: PhysAddr) -> NonZeroUsize {
        assert!(self.contains_phys(phys), "{phys} is outside the managed region");

        let ofs = phys.offset_from(self.phys).unwrap();
        NonZeroUsize::new(self.ptr.addr().get() + ofs).unwrap()
    }

    /// Returns the physical address backed by host address `addr`.
    #[inline]
    pub fn phys_of(self, addr: NonZeroUsize) -> PhysAddr {
        debug_assert!(self.contains_addr(addr));

        let ofs = self.offset_to(addr);
        self.phys
            .checked_add(ofs)
            .expect("host address maps outside the physical address space")
    }

    /// Initializes a `BlockLink` at the given address.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `BlockLink` values.
    /// - The memory at `addr` must be within the provenance of `self` and valid
    ///   for reads and writes for `size_of::<BlockLink>()` bytes.
    /// - The memory at `addr` must be unallocated by the associated allocator.
    #[inline]
    pub unsafe fn init_link_at(self, addr: NonZeroUsize, link: BlockLink) {
        #[cfg(debug_assertions)]
        {
            debug_assert!(self.contains_addr(addr));
            if let Some(next) = link.next {
                debug_assert!(self.contains_addr(next), "next link out of region");
            }
            if let Some(prev) = link.prev {
                debug_assert!(self.contains_addr(prev), "prev link out of region");
            }
        }

        unsafe {
            self.with_addr(addr)
                .cast::<BlockLink>()
                .as_ptr()
                .write(link)
        };
    }

    /// Returns a mutable reference to the `BlockLink` at `link`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `link` must be a properly aligned address for `BlockLink` values.
    /// - The memory at `link` must contain a properly initialized `BlockLink` value.
    /// - The memory at `link` must be within the provenance of `self` and
    ///   unallocated by the associated allocator.
    #[inline]
    pub unsafe fn link_mut<'a>(self, link: NonZeroUsize) -> &'a mut BlockLink {
        debug_assert!(self.contains_addr(link));

        unsafe { self.ptr.with_addr(link).cast::<BlockLink>().as_mut() }
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        self.ptr.with_addr(addr)
    }

    /// Creates a pointer to the byte backing physical address `phys`.
    ///
    /// Returns `None` if `phys` is outside the region.
    #[inline]
    pub fn with_phys(self, phys: PhysAddr) -> Option<NonNull<u8>> {
        self.contains_phys(phys)
            .then(|| self.with_addr(self.addr_of(phys)))
    }
}

/// A link in a linked list of blocks of memory.
///
/// This type is meant to be embedded in the block itself, forming an intrusive
/// linked list.
#[repr(C)]
pub struct BlockLink {
    // Rather than using pointers, store only the host addresses of the previous
    // and next links.  This avoids accidentally violating stacked borrows; the
    // links "point to" other blocks, but by forgoing actual pointers, no borrow
    // is implied.
    //
    // NOTE: Using this method, any actual pointer to a block must be acquired
    // via the allocator base pointer, and NOT by casting these addresses
    // directly!
    pub prev: Option<NonZeroUsize>,
    pub next: Option<NonZeroUsize>,
}
