//! Shared access to an allocator and the address spaces built from it.
//!
//! Free lists and sibling bits are updated in several steps, so every
//! operation that touches the allocator, mapping included, runs under one
//! lock.

use spin::{Mutex, MutexGuard};

use crate::{
    diag::FreeAreaReport,
    page::{PhysAddr, VirtAddr},
    paging::{MapError, PageDirectory, PageFlags},
    AllocError, BackingAllocator, BuddyAllocator,
};

/// A [`BuddyAllocator`] behind a spinlock.
#[derive(Debug)]
pub struct LockedBuddyAllocator<A: BackingAllocator>(Mutex<BuddyAllocator<A>>);

impl<A: BackingAllocator> LockedBuddyAllocator<A> {
    pub const fn new(inner: BuddyAllocator<A>) -> LockedBuddyAllocator<A> {
        LockedBuddyAllocator(Mutex::new(inner))
    }

    /// Locks the allocator for a sequence of operations.
    pub fn lock(&self) -> MutexGuard<'_, BuddyAllocator<A>> {
        self.0.lock()
    }

    pub fn into_inner(self) -> BuddyAllocator<A> {
        self.0.into_inner()
    }

    /// See [`BuddyAllocator::allocate`].
    pub fn allocate(&self, order: usize) -> Result<PhysAddr, AllocError> {
        self.0.lock().allocate(order)
    }

    /// See [`BuddyAllocator::free`].
    pub fn free(&self, addr: PhysAddr, order: usize) -> Result<(), AllocError> {
        self.0.lock().free(addr, order)
    }

    /// See [`BuddyAllocator::allocate_pages`].
    pub fn allocate_pages(&self, count: usize) -> Result<PhysAddr, AllocError> {
        self.0.lock().allocate_pages(count)
    }

    /// See [`BuddyAllocator::free_pages`].
    pub fn free_pages(&self, addr: PhysAddr, count: usize) -> Result<(), AllocError> {
        self.0.lock().free_pages(addr, count)
    }

    pub fn free_report(&self) -> FreeAreaReport {
        self.0.lock().free_report()
    }

    /// See [`PageDirectory::create`].
    pub fn create_address_space(&self) -> Result<PageDirectory, MapError> {
        PageDirectory::create(&mut *self.0.lock())
    }

    /// See [`PageDirectory::map_range`].
    pub fn map_range(
        &self,
        dir: &mut PageDirectory,
        va: VirtAddr,
        pa: PhysAddr,
        size: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        dir.map_range(&mut *self.0.lock(), va, pa, size, flags)
    }

    /// See [`PageDirectory::translate`].
    pub fn translate(&self, dir: &PageDirectory, va: VirtAddr) -> Option<PhysAddr> {
        dir.translate(&*self.0.lock(), va)
    }

    /// See [`PageDirectory::destroy`].
    pub fn destroy_address_space(&self, dir: PageDirectory) {
        dir.destroy(&mut *self.0.lock());
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{sync::Arc, thread, vec::Vec};

    use super::*;
    use crate::{Global, PAGE_SIZE};

    fn locked() -> LockedBuddyAllocator<Global> {
        let inner = BuddyAllocator::try_new(PhysAddr::new(0), PhysAddr::new(9 << 20)).unwrap();
        LockedBuddyAllocator::new(inner)
    }

    #[test]
    fn threads_share_one_allocator() {
        let frames = Arc::new(locked());
        let before = frames.free_report();

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let frames = Arc::clone(&frames);
                thread::spawn(move || {
                    let mut held = Vec::new();
                    for i in 0..64 {
                        held.push((frames.allocate((t + i) % 4).unwrap(), (t + i) % 4));
                    }
                    for (addr, order) in held {
                        frames.free(addr, order).unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(frames.free_report(), before);
    }

    #[test]
    fn address_spaces_through_the_lock() {
        let frames = locked();
        let mut dir = frames.create_address_space().unwrap();

        let frame = frames.allocate_pages(1).unwrap();
        frames
            .map_range(&mut dir, VirtAddr::new(0x1000_0000), frame, PAGE_SIZE, PageFlags::USER)
            .unwrap();
        assert_eq!(frames.translate(&dir, VirtAddr::new(0x1000_0010)), frame.checked_add(0x10));

        frames.destroy_address_space(dir);
        frames.free_pages(frame, 1).unwrap();

        let inner = frames.into_inner();
        assert_eq!(inner.free_count(crate::MAX_ORDER - 1), 2);
    }
}
