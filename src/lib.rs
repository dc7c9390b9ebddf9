//! Physical page allocation and address mapping for a small protected-mode
//! kernel.
//!
//! The crate owns a contiguous range of physical memory and serves
//! power-of-two blocks of pages out of it with a binary-buddy allocator. The
//! allocator hosts its own metadata (per-order sibling bitmaps and a page
//! descriptor array) at the top of the region it manages. On top of it,
//! [`paging`] builds two-level page directories, one per address space.
//!
//! ```
//! use buddy_pmm::{BuddyAllocator, PhysAddr};
//!
//! let mut frames = BuddyAllocator::try_new(PhysAddr::new(0), PhysAddr::new(8 << 20)).unwrap();
//! let block = frames.allocate(2).unwrap();
//! assert!(block.is_aligned(4 * buddy_pmm::PAGE_SIZE));
//! frames.free(block, 2).unwrap();
//! ```

#![doc(html_root_url = "https://docs.rs/buddy_pmm/0.1.0")]
#![warn(missing_debug_implementations)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by unstable features.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
pub mod bitmap;
pub mod buddy;
pub mod diag;
pub mod env;
pub mod page;
pub mod paging;
mod polyfill;
pub mod pow2;
pub mod region;
pub mod sync;


use core::{alloc::Layout, ptr::NonNull};

use displaydoc_lite::displaydoc;

pub use crate::{
    buddy::BuddyAllocator,
    diag::FreeAreaReport,
    page::{PageDescriptor, PageType, PhysAddr, VirtAddr, KERN_BASE, PAGE_SIZE},
    paging::{MapError, PageDirectory, PageFlags},
    region::RegionLayout,
    sync::LockedBuddyAllocator,
};

/// Number of block orders. The largest block has order `MAX_ORDER - 1`, i.e.
/// 1024 pages (4 MiB).
pub const MAX_ORDER: usize = 11;

displaydoc! {
    /// Errors returned by the buddy allocator.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum AllocError {
        /// requested order exceeds the largest supported block size.
        OrderTooLarge,
        /// no free block of the requested or any larger order is left.
        Exhausted,
        /// address and order do not describe a currently allocated block.
        InvalidFree,
        /// tried to allocate zero pages.
        ZeroPages,
    }
}

displaydoc! {
    /// The error type for allocator constructors.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum AllocInitError {
        /// the memory backing the managed region could not be allocated.
        AllocFailed,
        /// the managed region bounds are impossible to satisfy.
        InvalidConfig,
        /// the allocator metadata leaves no allocatable page in the region.
        InsufficientCapacity,
    }
}

/// Types which provide the memory backing an allocator.
///
/// This is implemented by the following types:
/// - The `Raw` marker type indicates that the region was handed over as a raw
///   pointer, as it is in the kernel. Nothing is released on drop.
/// - The `Global` marker type indicates that the region was obtained from the
///   global allocator and is returned to it on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// backing allocator with the given `layout`.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
