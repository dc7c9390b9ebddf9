//! Sizing of the managed region.
//!
//! The allocator keeps its own metadata at the top of the region it manages:
//!
//! ```text
//! memory_start                  usable_end                          memory_end
//! |  allocatable pages  ...     | page descriptors | ... | sibling bitmaps |
//! ```
//!
//! Sibling bitmaps are laid out order 0 first, one segment of whole `u64`
//! words per order, ending exactly at `memory_end`.

use core::{alloc::Layout, mem};

use crate::{
    bitmap::Bitmap,
    page::{PageDescriptor, PhysAddr, PAGE_SIZE},
    AllocInitError, MAX_ORDER,
};

/// Number of pages in a block of the largest order.
pub const TOP_ORDER_PAGES: usize = 1 << (MAX_ORDER - 1);

/// Size in bytes of a block of the given order.
#[inline]
pub const fn block_size(order: usize) -> usize {
    PAGE_SIZE << order
}

/// The computed layout of a managed region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegionLayout {
    /// First byte of the region, page aligned.
    pub memory_start: PhysAddr,
    /// One past the last byte of the region, page aligned.
    pub memory_end: PhysAddr,
    /// One past the last allocatable byte; metadata starts here.
    pub usable_end: PhysAddr,
    /// Pages in `memory_start..memory_end`, metadata pages included.
    pub page_count: usize,
    /// Bytes taken by the sibling bitmaps of all orders.
    pub bitmap_bytes: usize,
    /// Bytes taken by the page descriptor array.
    pub descriptor_bytes: usize,
}

impl RegionLayout {
    /// Computes the layout of the region `memory_start..memory_end`.
    ///
    /// The start is rounded up and the end rounded down to page boundaries.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the rounded region holds no page, and
    /// `InsufficientCapacity` if the metadata leaves no allocatable page.
    pub fn new(memory_start: PhysAddr, memory_end: PhysAddr) -> Result<RegionLayout, AllocInitError> {
        let memory_start = memory_start
            .align_up(PAGE_SIZE)
            .ok_or(AllocInitError::InvalidConfig)?;
        let memory_end = memory_end.align_down(PAGE_SIZE);

        let region_bytes = match memory_end.offset_from(memory_start) {
            Some(bytes) if bytes > 0 => bytes,
            _ => return Err(AllocInitError::InvalidConfig),
        };

        let page_count = region_bytes / PAGE_SIZE;

        let bitmap_bytes = (0..MAX_ORDER)
            .map(|order| Bitmap::map_layout(Self::pairs_at(page_count, order)).size())
            .sum::<usize>();

        let descriptor_bytes = page_count
            .checked_mul(mem::size_of::<PageDescriptor>())
            .ok_or(AllocInitError::InvalidConfig)?;

        let metadata_bytes = bitmap_bytes + descriptor_bytes;
        if metadata_bytes > region_bytes {
            return Err(AllocInitError::InsufficientCapacity);
        }

        // `memory_end - metadata_bytes` cannot underflow past `memory_start`,
        // so the rounded result stays inside the region.
        let usable_end = PhysAddr::new(memory_end.as_u32() - metadata_bytes as u32).align_down(PAGE_SIZE);
        if usable_end <= memory_start {
            return Err(AllocInitError::InsufficientCapacity);
        }

        Ok(RegionLayout {
            memory_start,
            memory_end,
            usable_end,
            page_count,
            bitmap_bytes,
            descriptor_bytes,
        })
    }

    fn pairs_at(page_count: usize, order: usize) -> usize {
        page_count.div_ceil(1 << (order + 1))
    }

    /// Number of sibling bits (buddy pairs) kept for `order`.
    pub fn sibling_bits_at(&self, order: usize) -> usize {
        Self::pairs_at(self.page_count, order)
    }

    /// Aggregate sibling bit count over all orders, `(2^MAX_ORDER - 1) *
    /// page_count / 2^MAX_ORDER`.
    ///
    /// This is the nominal figure; the bitmaps themselves round every order up
    /// to whole pairs and whole words.
    pub fn sibling_bits(&self) -> usize {
        ((1 << MAX_ORDER) - 1) * self.page_count / (1 << MAX_ORDER)
    }

    /// Size in bytes of the whole region.
    pub fn region_bytes(&self) -> usize {
        self.page_count * PAGE_SIZE
    }

    /// Size in bytes of everything from `usable_end` to `memory_end`.
    pub fn metadata_bytes(&self) -> usize {
        self.region_bytes() - self.usable_bytes()
    }

    pub fn usable_bytes(&self) -> usize {
        // `usable_end > memory_start` by construction.
        self.usable_end.offset_from(self.memory_start).unwrap_or(0)
    }

    pub fn usable_pages(&self) -> usize {
        self.usable_bytes() / PAGE_SIZE
    }

    /// Number of whole top-order blocks offered at start of day.
    pub fn top_order_blocks(&self) -> usize {
        self.usable_pages() / TOP_ORDER_PAGES
    }

    /// Physical address where the order-0 sibling bitmap starts.
    pub fn bitmap_start(&self) -> PhysAddr {
        PhysAddr::new(self.memory_end.as_u32() - self.bitmap_bytes as u32)
    }

    /// Layout of host memory able to back this region.
    pub fn host_layout(&self) -> Result<Layout, AllocInitError> {
        Layout::from_size_align(self.region_bytes(), PAGE_SIZE).map_err(|_| AllocInitError::InvalidConfig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u32 = 1024 * 1024;

    #[test]
    fn sixteen_mib_region() {
        let layout = RegionLayout::new(PhysAddr::new(0), PhysAddr::new(16 * MIB)).unwrap();

        assert_eq!(layout.page_count, 4096);
        assert_eq!(layout.descriptor_bytes, 4096 * 16);
        // 32 + 16 + 8 + 4 + 2 + 6 * 1 words.
        assert_eq!(layout.bitmap_bytes, 68 * 8);
        assert!(layout.usable_end < layout.memory_end);
        assert!(layout.usable_end.is_aligned(PAGE_SIZE));
        assert_eq!(layout.usable_pages(), 4079);
        assert_eq!(layout.top_order_blocks(), 3);
        assert_eq!(layout.sibling_bits(), 4094);
    }

    #[test]
    fn metadata_does_not_overlap_usable_pages() {
        let layout = RegionLayout::new(PhysAddr::new(0x10_0000), PhysAddr::new(7 * MIB + 0x123)).unwrap();

        assert_eq!(layout.memory_end, PhysAddr::new(7 * MIB));
        let descriptors_end = layout.usable_end.checked_add(layout.descriptor_bytes).unwrap();
        assert!(descriptors_end <= layout.bitmap_start());
        assert_eq!(layout.bitmap_start().checked_add(layout.bitmap_bytes), Some(layout.memory_end));
        assert!(layout.bitmap_start().is_aligned(8));
    }

    #[test]
    fn unaligned_bounds_are_rounded_inward() {
        let layout = RegionLayout::new(PhysAddr::new(0x1001), PhysAddr::new(0x40_0FFF)).unwrap();
        assert_eq!(layout.memory_start, PhysAddr::new(0x2000));
        assert_eq!(layout.memory_end, PhysAddr::new(0x40_0000));
    }

    #[test]
    fn every_order_has_a_pair_bit() {
        let layout = RegionLayout::new(PhysAddr::new(0), PhysAddr::new(5 * MIB)).unwrap();
        for order in 0..MAX_ORDER {
            assert!(layout.sibling_bits_at(order) >= 1);
            assert!(layout.sibling_bits_at(order) << (order + 1) >= layout.page_count);
        }
    }

    #[test]
    fn rejects_empty_and_inverted_regions() {
        assert_eq!(
            RegionLayout::new(PhysAddr::new(0x2000), PhysAddr::new(0x2FFF)),
            Err(AllocInitError::InvalidConfig)
        );
        assert_eq!(
            RegionLayout::new(PhysAddr::new(0x4000), PhysAddr::new(0x1000)),
            Err(AllocInitError::InvalidConfig)
        );
        assert_eq!(
            RegionLayout::new(PhysAddr::new(u32::MAX - 2), PhysAddr::new(u32::MAX)),
            Err(AllocInitError::InvalidConfig)
        );
    }

    #[test]
    fn metadata_must_leave_a_usable_page() {
        assert_eq!(
            RegionLayout::new(PhysAddr::new(0), PhysAddr::new(0x1000)),
            Err(AllocInitError::InsufficientCapacity)
        );

        let two = RegionLayout::new(PhysAddr::new(0), PhysAddr::new(0x2000)).unwrap();
        assert_eq!(two.usable_pages(), 1);
        assert_eq!(two.top_order_blocks(), 0);
    }
}
