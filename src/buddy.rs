//! A binary-buddy allocator over a self-hosted physical region.
//!
//! Free blocks of each order form an intrusive doubly linked list whose links
//! live in the first bytes of the free blocks themselves. Each order also
//! keeps one sibling bit per buddy pair. The bit is flipped whenever either
//! member of the pair is handed out or taken back, so after a free it reads
//! 0 exactly when the other member is free as well and the two can merge.

use core::{array, cmp, fmt, mem, num::NonZeroUsize, ptr::NonNull, slice};

#[cfg(any(feature = "alloc", test))]
use crate::Global;
use crate::{
    base::{BasePtr, BlockLink},
    bitmap::Bitmap,
    diag::FreeAreaReport,
    page::{PageDescriptor, PageType, PhysAddr, PAGE_SIZE},
    polyfill::NonNullStrict,
    pow2,
    region::{block_size, RegionLayout},
    AllocError, AllocInitError, BackingAllocator, Raw, MAX_ORDER,
};

/// Free blocks and sibling bits of a single order.
struct FreeArea {
    order: usize,
    free_list: Option<NonZeroUsize>,
    free_count: usize,
    siblings: Bitmap,
}

impl FreeArea {
    /// Retrieves the index of the sibling bit for the pair containing the page
    /// with index `page_idx`.
    #[inline]
    fn sibling_bit(&self, page_idx: usize) -> usize {
        page_idx >> (self.order + 1)
    }

    /// Pushes a block onto the free list.
    ///
    /// # Safety
    ///
    /// `block` must be the host address of a block of this order inside
    /// `base` that is not currently on any free list.
    unsafe fn free_list_push(&mut self, base: BasePtr, block: NonZeroUsize) {
        assert_eq!(block.get() & (mem::align_of::<BlockLink>() - 1), 0);

        if self.free_list == Some(block) {
            corrupt_free_list(self.order, base.phys_of(block), "block pushed twice");
        }

        let new_head = block;

        if let Some(old_head) = self.free_list {
            let old_head_mut = unsafe { base.link_mut(old_head) };
            old_head_mut.prev = Some(new_head);
        }

        let old_head = self.free_list;

        // If `old_head` exists, it points back to `new_head`.

        unsafe {
            base.init_link_at(
                block,
                BlockLink {
                    next: old_head,
                    prev: None,
                },
            )
        };

        // `new_head` points forward to `old_head`.
        self.free_list = Some(new_head);
        self.free_count += 1;
    }

    /// Removes the specified block from the free list.
    ///
    /// # Panics
    ///
    /// Panics if the links of `block` or its neighbours are inconsistent.
    ///
    /// # Safety
    ///
    /// `block` must be the host address of a block of this order inside
    /// `base` whose first bytes hold a `BlockLink`.
    unsafe fn free_list_remove(&mut self, base: BasePtr, block: NonZeroUsize) {
        let order = self.order;
        let corrupt = |what| -> ! { corrupt_free_list(order, base.phys_of(block), what) };
        let valid_link = |link: NonZeroUsize| {
            base.contains_addr(link) && base.offset_to(link) % block_size(order) == 0
        };

        unsafe {
            let BlockLink { prev, next } = *base.link_mut(block);

            match prev {
                Some(p) => {
                    if !valid_link(p) {
                        corrupt("predecessor link leaves the region");
                    }

                    // Link `prev` forward to `next`.
                    let prev_mut = base.link_mut(p);
                    if prev_mut.next != Some(block) {
                        corrupt("predecessor does not link back");
                    }
                    prev_mut.next = next;
                }

                // If there's no previous block, then `block` must be the head
                // of the free list.
                None => {
                    if self.free_list != Some(block) {
                        corrupt("block has no predecessor but is not the list head");
                    }
                    self.free_list = next;
                }
            }

            if let Some(n) = next {
                if !valid_link(n) {
                    corrupt("successor link leaves the region");
                }

                // Link `next` back to `prev`.
                base.link_mut(n).prev = prev;
            }

            base.init_link_at(block, BlockLink { prev: None, next: None });
        }

        self.free_count -= 1;
    }

    /// Removes and returns the head of the free list.
    unsafe fn free_list_pop(&mut self, base: BasePtr) -> Option<NonZeroUsize> {
        let head = self.free_list?;
        unsafe { self.free_list_remove(base, head) };
        Some(head)
    }
}

#[cold]
#[inline(never)]
fn corrupt_free_list(order: usize, block: PhysAddr, what: &str) -> ! {
    log::error!("order {order} free list is corrupt at {block}: {what}");
    panic!("corrupt free list (order {order}, block {block}): {what}");
}

/// A binary-buddy allocator of physical pages.
///
/// Blocks have orders `0..MAX_ORDER`; a block of order `k` spans `2^k` pages
/// and is aligned to `2^k` pages relative to the start of the region.
/// Addresses handed out are physical addresses. [`as_ptr`](Self::as_ptr)
/// reaches the memory behind them.
pub struct BuddyAllocator<A: BackingAllocator> {
    /// Pointer to the region managed by this allocator.
    base: BasePtr,
    layout: RegionLayout,
    areas: [FreeArea; MAX_ORDER],
    /// The page descriptor array, starting at `layout.usable_end`.
    pages: NonNull<PageDescriptor>,
    backing_allocator: A,
}

// SAFETY: the allocator has exclusive access to the region its pointers refer
// to, so moving it to another thread moves that access along with it.
unsafe impl<A: BackingAllocator + Send> Send for BuddyAllocator<A> {}

impl BuddyAllocator<Raw> {
    /// Constructs a new `BuddyAllocator` managing `memory_start..memory_end`,
    /// backed by the memory at `region`.
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot hold its own metadata plus at
    /// least one page, or if `region` is not page aligned where the region
    /// starts.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be the address of the memory backing physical address
    ///   `memory_start`.
    /// - That memory must be valid for reads and writes up to `memory_end` for
    ///   as long as the allocator exists, and nothing else may access it
    ///   except through blocks handed out by the allocator.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        memory_start: PhysAddr,
        memory_end: PhysAddr,
    ) -> Result<BuddyAllocator<Raw>, AllocInitError> {
        let layout = RegionLayout::new(memory_start, memory_end)?;

        // Skip the bytes dropped by rounding the start up to a page.
        let skip = layout
            .memory_start
            .offset_from(memory_start)
            .ok_or(AllocInitError::InvalidConfig)?;
        let region = unsafe { NonNull::new_unchecked(region.as_ptr().add(skip)) };

        if region.as_ptr().align_offset(PAGE_SIZE) != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        Ok(unsafe { BuddyAllocator::from_parts(region, layout, Raw) })
    }
}

#[cfg(any(feature = "alloc", test))]
impl BuddyAllocator<Global> {
    /// Constructs a new `BuddyAllocator` managing `memory_start..memory_end`,
    /// backed by memory from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot hold its own metadata plus at
    /// least one page, or if the backing memory cannot be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(
        memory_start: PhysAddr,
        memory_end: PhysAddr,
    ) -> Result<BuddyAllocator<Global>, AllocInitError> {
        let layout = RegionLayout::new(memory_start, memory_end)?;
        let host_layout = layout.host_layout()?;

        let region = NonNull::new(unsafe { alloc::alloc::alloc(host_layout) })
            .ok_or(AllocInitError::AllocFailed)?;

        Ok(unsafe { BuddyAllocator::from_parts(region, layout, Global) })
    }
}

impl<A: BackingAllocator> Drop for BuddyAllocator<A> {
    fn drop(&mut self) {
        if let Ok(host_layout) = self.layout.host_layout() {
            unsafe { self.backing_allocator.deallocate(self.base.ptr(), host_layout) };
        }
    }
}

impl<A: BackingAllocator> BuddyAllocator<A> {
    /// Lays out the metadata of a fresh region and seeds the free lists.
    ///
    /// # Safety
    ///
    /// `region` must be page aligned and valid for reads and writes for
    /// `layout.region_bytes()` bytes for the lifetime of the allocator.
    unsafe fn from_parts(region: NonNull<u8>, layout: RegionLayout, backing_allocator: A) -> Self {
        let base = BasePtr::new(region, layout.memory_start, layout.region_bytes());

        log::info!(
            "init memory {}..{}: {} pages",
            layout.memory_start,
            layout.memory_end,
            layout.page_count
        );
        log::debug!(
            "metadata at {}..{}: {} descriptor bytes, {} bitmap bytes for {} sibling bits",
            layout.usable_end,
            layout.memory_end,
            layout.descriptor_bytes,
            layout.bitmap_bytes,
            layout.sibling_bits()
        );

        // All pairs start in the symmetric state.
        let metadata = base.with_phys(layout.usable_end).unwrap();
        unsafe { metadata.as_ptr().write_bytes(0, layout.metadata_bytes()) };

        let mut cursor = base.addr_of(layout.bitmap_start());
        let areas = array::from_fn(|order| {
            let bits = layout.sibling_bits_at(order);
            let map = base.with_addr(cursor).cast::<u64>().as_ptr();
            cursor = cursor.checked_add(Bitmap::map_layout(bits).size()).unwrap();

            FreeArea {
                order,
                free_list: None,
                free_count: 0,
                siblings: unsafe { Bitmap::new(bits, map) },
            }
        });

        let pages = metadata.cast::<PageDescriptor>();
        let usable_pages = layout.usable_pages();
        for idx in 0..layout.page_count {
            let flags = if idx < usable_pages {
                PageType::USABLE | PageType::FREE
            } else {
                PageType::SYSTEM | PageType::IN_USE
            };

            unsafe { pages.as_ptr().add(idx).write(PageDescriptor::new(flags)) };
        }

        let mut allocator = BuddyAllocator {
            base,
            layout,
            areas,
            pages,
            backing_allocator,
        };

        // Only whole top-order strides are offered.
        let top = MAX_ORDER - 1;
        for idx in 0..layout.top_order_blocks() {
            let phys = layout.memory_start.checked_add(idx * block_size(top)).unwrap();
            let block = base.addr_of(phys);
            unsafe { allocator.areas[top].free_list_push(base, block) };
        }

        if layout.top_order_blocks() == 0 {
            log::warn!(
                "usable area {}..{} holds no whole {} KiB block",
                layout.memory_start,
                layout.usable_end,
                block_size(top) / 1024
            );
        }

        allocator.log_free_areas();
        allocator
    }

    /// Returns the layout of the managed region.
    #[inline]
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Returns the number of free blocks of the given order.
    #[inline]
    pub fn free_count(&self, order: usize) -> usize {
        self.areas.get(order).map_or(0, |area| area.free_count)
    }

    /// Returns a snapshot of the free block counts of every order.
    pub fn free_report(&self) -> FreeAreaReport {
        FreeAreaReport::new(array::from_fn(|order| self.areas[order].free_count))
    }

    /// Writes the free block counts to the log.
    pub fn log_free_areas(&self) {
        log::info!("free blocks per order:\n{}", self.free_report());
    }

    /// Returns the descriptors of every page of the region, metadata included.
    pub fn pages(&self) -> &[PageDescriptor] {
        unsafe { slice::from_raw_parts(self.pages.as_ptr(), self.layout.page_count) }
    }

    fn pages_mut(&mut self) -> &mut [PageDescriptor] {
        unsafe { slice::from_raw_parts_mut(self.pages.as_ptr(), self.layout.page_count) }
    }

    fn page_index(&self, addr: PhysAddr) -> Option<usize> {
        let idx = addr.offset_from(self.layout.memory_start)? / PAGE_SIZE;
        (idx < self.layout.page_count).then_some(idx)
    }

    /// Returns the descriptor of the page containing `addr`.
    pub fn page(&self, addr: PhysAddr) -> Option<&PageDescriptor> {
        let idx = self.page_index(addr)?;
        Some(&self.pages()[idx])
    }

    /// Returns the descriptor of the page containing `addr` for updating its
    /// reference count or virtual address.
    pub fn page_mut(&mut self, addr: PhysAddr) -> Option<&mut PageDescriptor> {
        let idx = self.page_index(addr)?;
        Some(&mut self.pages_mut()[idx])
    }

    /// Returns a pointer to the memory backing `addr`.
    ///
    /// Returns `None` for addresses outside the allocatable part of the
    /// region. Dereferencing the pointer is only sound while the containing
    /// block is allocated to the caller.
    pub fn as_ptr(&self, addr: PhysAddr) -> Option<NonNull<u8>> {
        if addr >= self.layout.usable_end {
            return None;
        }

        self.base.with_phys(addr)
    }

    /// Returns a pointer to the allocated page at `addr`, viewed as a `T`.
    pub(crate) fn frame_ptr<T>(&self, addr: PhysAddr) -> Option<NonNull<T>> {
        assert!(mem::size_of::<T>() <= PAGE_SIZE);
        assert!(mem::align_of::<T>() <= PAGE_SIZE);

        if !addr.is_aligned(PAGE_SIZE) || !self.page(addr)?.is_in_use() {
            return None;
        }

        self.as_ptr(addr).map(NonNull::cast)
    }

    /// Fills the allocated page at `addr` with zeroes.
    pub(crate) fn zero_frame(&mut self, addr: PhysAddr) {
        if let Some(frame) = self.frame_ptr::<u8>(addr) {
            unsafe { frame.as_ptr().write_bytes(0, PAGE_SIZE) };
        }
    }

    /// Flips the sibling bit of the pair containing `block` and returns its
    /// new value.
    fn toggle_sibling(&mut self, block: NonZeroUsize, order: usize) -> bool {
        let page_idx = self.base.offset_to(block) / PAGE_SIZE;
        let area = &mut self.areas[order];
        let bit = area.sibling_bit(page_idx);
        area.siblings.toggle(bit)
    }

    fn buddy_of(&self, block: NonZeroUsize, order: usize) -> NonZeroUsize {
        let buddy_ofs = self.base.offset_to(block) ^ block_size(order);
        NonZeroUsize::new(NonNullStrict::addr(self.base.ptr()).get() + buddy_ofs).unwrap()
    }

    /// Updates the descriptors of `block`. A live block records its order on
    /// its first page.
    fn mark_block(&mut self, block: NonZeroUsize, order: usize, live: bool) {
        let (flags, head) = if live {
            (PageType::USABLE | PageType::IN_USE, order as u32 + 1)
        } else {
            (PageType::USABLE | PageType::FREE, 0)
        };

        let first = self.base.offset_to(block) / PAGE_SIZE;
        let pages = &mut self.pages_mut()[first..][..1 << order];
        for page in pages.iter_mut() {
            page.flags = flags;
            page.reserved = 0;
        }
        pages[0].reserved = head;
    }

    /// Allocates a block of `2^order` pages.
    ///
    /// When no block of `order` is free, a larger block is split: the lower
    /// half stays on the free list and the upper half is handed out.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `OrderTooLarge` if `order >= MAX_ORDER`, and `Exhausted` if no
    /// block of `order` or any larger order is free.
    pub fn allocate(&mut self, order: usize) -> Result<PhysAddr, AllocError> {
        if order >= MAX_ORDER {
            return Err(AllocError::OrderTooLarge);
        }

        // Find the smallest order with a free block.
        let mut found = None;
        for level in order..MAX_ORDER {
            if let Some(block) = unsafe { self.areas[level].free_list_pop(self.base) } {
                found = Some((block, level));
                break;
            }
        }

        let Some((mut block, mut level)) = found else {
            log::warn!("no free block of order {order} or above");
            return Err(AllocError::Exhausted);
        };

        self.toggle_sibling(block, level);

        // Split down to the requested order, parking each lower half.
        while level > order {
            level -= 1;

            let upper = block.checked_add(block_size(level)).unwrap();
            unsafe { self.areas[level].free_list_push(self.base, block) };
            self.toggle_sibling(upper, level);

            block = upper;
        }

        self.mark_block(block, order, true);

        let addr = self.base.phys_of(block);
        log::trace!("allocated order {order} block at {addr}");
        Ok(addr)
    }

    /// Frees a block of `2^order` pages previously returned by
    /// [`allocate`](Self::allocate) with the same order, merging it with its
    /// buddy as far up as possible.
    ///
    /// # Errors
    ///
    /// Returns `OrderTooLarge` if `order >= MAX_ORDER`, and `InvalidFree` if
    /// `addr` is outside the allocatable area, is not aligned for `order`, or
    /// does not start a live block allocated with exactly `order`.
    ///
    /// # Panics
    ///
    /// Panics if the free lists are found to be corrupt while merging.
    pub fn free(&mut self, addr: PhysAddr, order: usize) -> Result<(), AllocError> {
        if order >= MAX_ORDER {
            return Err(AllocError::OrderTooLarge);
        }

        let mut block = self.check_allocated(addr, order).map_err(|e| {
            log::warn!("rejected free of order {order} block at {addr}");
            e
        })?;

        self.mark_block(block, order, false);
        log::trace!("freeing order {order} block at {addr}");

        let mut order = order;
        loop {
            let buddy_free = !self.toggle_sibling(block, order);

            if buddy_free && order + 1 < MAX_ORDER {
                let buddy = self.buddy_of(block, order);
                unsafe { self.areas[order].free_list_remove(self.base, buddy) };

                block = cmp::min(block, buddy);
                order += 1;
            } else {
                unsafe { self.areas[order].free_list_push(self.base, block) };
                return Ok(());
            }
        }
    }

    fn check_allocated(&self, addr: PhysAddr, order: usize) -> Result<NonZeroUsize, AllocError> {
        let size = block_size(order);
        let ofs = addr
            .offset_from(self.layout.memory_start)
            .ok_or(AllocError::InvalidFree)?;

        let in_bounds = ofs
            .checked_add(size)
            .map_or(false, |end| end <= self.layout.usable_bytes());
        if ofs % size != 0 || !in_bounds {
            return Err(AllocError::InvalidFree);
        }

        // Tail pages of a live block and blocks freed with the wrong order
        // carry no matching head record.
        let head = &self.pages()[ofs / PAGE_SIZE];
        if !head.is_in_use() || head.block_order() != Some(order) {
            return Err(AllocError::InvalidFree);
        }

        Ok(self.base.addr_of(addr))
    }

    /// Allocates at least `count` contiguous pages, rounded up to a power of
    /// two.
    ///
    /// # Errors
    ///
    /// Returns `ZeroPages` for a count of 0, and otherwise the errors of
    /// [`allocate`](Self::allocate).
    pub fn allocate_pages(&mut self, count: usize) -> Result<PhysAddr, AllocError> {
        self.allocate(Self::order_for(count)?)
    }

    /// Frees pages allocated with [`allocate_pages`](Self::allocate_pages)
    /// using the same `count`.
    pub fn free_pages(&mut self, addr: PhysAddr, count: usize) -> Result<(), AllocError> {
        self.free(addr, Self::order_for(count)?)
    }

    fn order_for(count: usize) -> Result<usize, AllocError> {
        match count {
            0 => Err(AllocError::ZeroPages),
            _ => pow2::order_for_pages(count).ok_or(AllocError::OrderTooLarge),
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for BuddyAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("layout", &self.layout)
            .field("free_counts", &self.free_report().counts())
            .finish_non_exhaustive()
    }
}
