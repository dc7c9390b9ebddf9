//! Two-level 32-bit address spaces built from allocator frames.
//!
//! A page directory and each of its page tables occupy one order-0 frame of a
//! [`BuddyAllocator`]. Every entry holds a page aligned physical frame address
//! in its upper 20 bits and [`PageFlags`] in the low 12.

use core::{fmt, mem, ops::RangeInclusive};

use bitflags::bitflags;
use displaydoc_lite::displaydoc;

use crate::{
    page::{PhysAddr, VirtAddr, KERN_BASE, PAGE_SIZE},
    AllocError, BackingAllocator, BuddyAllocator,
};

/// Number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

const FRAME_MASK: u32 = !(PAGE_SIZE as u32 - 1);

bitflags! {
    /// Attribute bits of a directory or table entry.
    #[repr(transparent)]
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const PRESENT = 0x001;
        const WRITABLE = 0x002;
        const USER = 0x004;
        const WRITE_THROUGH = 0x008;
        const CACHE_DISABLE = 0x010;
        const ACCESSED = 0x020;
        const DIRTY = 0x040;
        const HUGE = 0x080;
        const GLOBAL = 0x100;
    }
}

/// A page directory or page table entry.
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Entry(u32);

impl Entry {
    pub const EMPTY: Entry = Entry(0);

    /// Constructs an entry pointing at `frame`, which is rounded down to a page.
    pub const fn new(frame: PhysAddr, flags: PageFlags) -> Entry {
        Entry((frame.as_u32() & FRAME_MASK) | flags.bits())
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & FRAME_MASK)
    }

    #[inline]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Entry")
            .field(&self.frame())
            .field(&self.flags())
            .finish()
    }
}

/// A page directory or page table: one frame of entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Entry; ENTRIES_PER_TABLE],
}

const _: () = assert!(mem::size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    #[inline]
    pub fn entries(&self) -> &[Entry; ENTRIES_PER_TABLE] {
        &self.entries
    }

    /// Iterates over the indices and values of the present entries.
    pub fn present(&self) -> impl Iterator<Item = (usize, Entry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, entry)| entry.is_present())
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("present", &self.present().count())
            .finish_non_exhaustive()
    }
}

displaydoc! {
    /// Errors returned by the address mapping layer.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum MapError {
        /// the range overlaps a page that is already mapped.
        RemapViolation,
        /// no frame was left for a page directory or page table.
        OutOfMemory,
        /// the range wraps around the end of the address space.
        RangeOverflow,
    }
}

impl From<AllocError> for MapError {
    fn from(_: AllocError) -> MapError {
        MapError::OutOfMemory
    }
}

/// A physical range mapped into every new address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SystemMapping {
    pub phys: PhysAddr,
    pub virt: VirtAddr,
    pub size: usize,
    pub flags: PageFlags,
}

/// Mappings installed by [`PageDirectory::create`]: the first 4 MiB of
/// physical memory at the kernel base, writable and kernel only.
pub const SYSTEM_MAPPINGS: &[SystemMapping] = &[SystemMapping {
    phys: PhysAddr::new(0),
    virt: VirtAddr::new(KERN_BASE),
    size: PAGE_SIZE * ENTRIES_PER_TABLE,
    flags: PageFlags::PRESENT.union(PageFlags::WRITABLE),
}];

/// Handle to the directory frame of one address space.
///
/// The directory and its tables live in frames of the allocator passed to
/// [`create`](Self::create); every other method must be given that same
/// allocator and panics if the directory frame is not allocated in it.
#[derive(Debug, PartialEq, Eq)]
pub struct PageDirectory {
    frame: PhysAddr,
}

impl PageDirectory {
    /// Creates an address space carrying the [`SYSTEM_MAPPINGS`].
    pub fn create<A: BackingAllocator>(frames: &mut BuddyAllocator<A>) -> Result<PageDirectory, MapError> {
        PageDirectory::with_mappings(frames, SYSTEM_MAPPINGS)
    }

    /// Creates an address space carrying `mappings`.
    ///
    /// # Errors
    ///
    /// Fails if a frame cannot be allocated or the mappings overlap. Frames
    /// taken by the partially built address space are released first.
    pub fn with_mappings<A: BackingAllocator>(
        frames: &mut BuddyAllocator<A>,
        mappings: &[SystemMapping],
    ) -> Result<PageDirectory, MapError> {
        let frame = frames.allocate(0)?;
        frames.zero_frame(frame);

        let mut dir = PageDirectory { frame };
        for m in mappings {
            if let Err(e) = dir.map_range(frames, m.virt, m.phys, m.size, m.flags) {
                log::warn!("failed to install {} -> {}: {e}", m.virt, m.phys);
                dir.destroy(frames);
                return Err(e);
            }
        }

        log::debug!("created address space {frame} with {} static mappings", mappings.len());
        Ok(dir)
    }

    /// Returns the physical address of the directory frame.
    #[inline]
    pub fn frame(&self) -> PhysAddr {
        self.frame
    }

    /// Returns the directory itself.
    pub fn directory<'a, A: BackingAllocator>(&self, frames: &'a BuddyAllocator<A>) -> &'a PageTable {
        table(frames, self.frame).expect("page directory frame is not allocated")
    }

    fn directory_mut<'a, A: BackingAllocator>(&mut self, frames: &'a mut BuddyAllocator<A>) -> &'a mut PageTable {
        table_mut(frames, self.frame).expect("page directory frame is not allocated")
    }

    /// Returns the table entry for `va`, or `None` if no page table covers it.
    pub fn lookup<'a, A: BackingAllocator>(&self, frames: &'a BuddyAllocator<A>, va: VirtAddr) -> Option<&'a Entry> {
        let pde = self.directory(frames).entries[va.directory_index()];
        if !pde.is_present() {
            return None;
        }

        let table = table(frames, pde.frame())?;
        Some(&table.entries[va.table_index()])
    }

    /// Returns the table entry for `va`, allocating and installing a zeroed
    /// page table if none covers it yet.
    pub fn ensure_table<'a, A: BackingAllocator>(
        &mut self,
        frames: &'a mut BuddyAllocator<A>,
        va: VirtAddr,
    ) -> Result<&'a mut Entry, MapError> {
        let dir_idx = va.directory_index();
        let pde = self.directory(frames).entries[dir_idx];

        let table_frame = if pde.is_present() {
            pde.frame()
        } else {
            let new = frames.allocate(0).map_err(|e| {
                log::warn!("no frame for a page table covering {va}: {e}");
                MapError::from(e)
            })?;
            frames.zero_frame(new);

            self.directory_mut(frames).entries[dir_idx] =
                Entry::new(new, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER);
            log::trace!("installed page table {new} at directory index {dir_idx}");
            new
        };

        let table = table_mut(frames, table_frame).expect("page table frame is not allocated");
        Ok(&mut table.entries[va.table_index()])
    }

    /// Maps every page containing a byte of `va..va + size` to consecutive
    /// frames starting at the frame containing `pa`.
    ///
    /// Both addresses are rounded down to a page boundary; `PRESENT` is
    /// always added to `flags`. Mapping zero bytes does nothing.
    ///
    /// # Errors
    ///
    /// - `RangeOverflow` if either range wraps the 32-bit address space.
    /// - `RemapViolation` if any page of the range is already mapped; nothing
    ///   is changed.
    /// - `OutOfMemory` if a page table cannot be allocated; entries written
    ///   by this call are cleared again, and tables across the range that are
    ///   left empty are released.
    pub fn map_range<A: BackingAllocator>(
        &mut self,
        frames: &mut BuddyAllocator<A>,
        va: VirtAddr,
        pa: PhysAddr,
        size: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if size == 0 {
            return Ok(());
        }

        let start = va.align_down(PAGE_SIZE);
        let pa = pa.align_down(PAGE_SIZE);
        let last = va.checked_add(size - 1).ok_or(MapError::RangeOverflow)?;
        let pages = last
            .align_down(PAGE_SIZE)
            .offset_from(start)
            .ok_or(MapError::RangeOverflow)?
            / PAGE_SIZE
            + 1;
        pa.checked_add((pages - 1) * PAGE_SIZE)
            .ok_or(MapError::RangeOverflow)?;

        let page_va = |idx: usize| VirtAddr::new(start.as_u32() + (idx * PAGE_SIZE) as u32);
        let page_pa = |idx: usize| PhysAddr::new(pa.as_u32() + (idx * PAGE_SIZE) as u32);

        for idx in 0..pages {
            let v = page_va(idx);
            if let Some(entry) = self.lookup(frames, v).filter(|e| e.is_present()) {
                log::warn!("refusing to remap {v}: already mapped to {}", entry.frame());
                return Err(MapError::RemapViolation);
            }
        }

        for idx in 0..pages {
            match self.ensure_table(frames, page_va(idx)) {
                Ok(entry) => *entry = Entry::new(page_pa(idx), flags | PageFlags::PRESENT),
                Err(e) => {
                    for done in 0..idx {
                        if let Ok(entry) = self.ensure_table(frames, page_va(done)) {
                            *entry = Entry::EMPTY;
                        }
                    }
                    let dirs = start.directory_index()..=page_va(idx).directory_index();
                    self.release_empty_tables(frames, dirs);
                    return Err(e);
                }
            }
        }

        log::trace!("mapped {pages} pages at {start} -> {pa} ({flags:?})");
        Ok(())
    }

    /// Uninstalls and frees the tables at `dirs` that map nothing.
    fn release_empty_tables<A: BackingAllocator>(
        &mut self,
        frames: &mut BuddyAllocator<A>,
        dirs: RangeInclusive<usize>,
    ) {
        for dir_idx in dirs {
            let pde = self.directory(frames).entries[dir_idx];
            if !pde.is_present() {
                continue;
            }

            let empty = table(frames, pde.frame()).map_or(false, |t| t.present().next().is_none());
            if !empty {
                continue;
            }

            self.directory_mut(frames).entries[dir_idx] = Entry::EMPTY;
            if let Err(e) = frames.free(pde.frame(), 0) {
                log::warn!("page table {} of {} not released: {e}", pde.frame(), self.frame);
            }
        }
    }

    /// Translates `va` to the physical address it is mapped to.
    pub fn translate<A: BackingAllocator>(&self, frames: &BuddyAllocator<A>, va: VirtAddr) -> Option<PhysAddr> {
        let entry = self.lookup(frames, va).filter(|e| e.is_present())?;
        entry.frame().checked_add(va.as_usize() % PAGE_SIZE)
    }

    /// Releases the page tables and the directory frame.
    ///
    /// The frames the address space maps are left alone.
    pub fn destroy<A: BackingAllocator>(self, frames: &mut BuddyAllocator<A>) {
        for idx in 0..ENTRIES_PER_TABLE {
            let pde = self.directory(frames).entries[idx];
            if !pde.is_present() {
                continue;
            }

            if let Err(e) = frames.free(pde.frame(), 0) {
                log::warn!("page table {} of {} not released: {e}", pde.frame(), self.frame);
            }
        }

        if let Err(e) = frames.free(self.frame, 0) {
            log::warn!("page directory {} not released: {e}", self.frame);
        }

        log::debug!("destroyed address space {}", self.frame);
    }
}

fn table<A: BackingAllocator>(frames: &BuddyAllocator<A>, frame: PhysAddr) -> Option<&PageTable> {
    let ptr = frames.frame_ptr::<PageTable>(frame)?;

    // SAFETY: the frame is allocated and page aligned, and every bit pattern
    // is a valid `PageTable`.
    Some(unsafe { ptr.as_ref() })
}

fn table_mut<A: BackingAllocator>(frames: &mut BuddyAllocator<A>, frame: PhysAddr) -> Option<&mut PageTable> {
    let mut ptr = frames.frame_ptr::<PageTable>(frame)?;

    // SAFETY: as in `table`, and `frames` is borrowed mutably.
    Some(unsafe { ptr.as_mut() })
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;
    use crate::Global;

    fn frames() -> BuddyAllocator<Global> {
        BuddyAllocator::try_new(PhysAddr::new(0), PhysAddr::new(5 << 20)).unwrap()
    }

    fn drain(frames: &mut BuddyAllocator<Global>) -> Vec<PhysAddr> {
        let mut held = Vec::new();
        while let Ok(frame) = frames.allocate(0) {
            held.push(frame);
        }
        held
    }

    #[test]
    fn entry_packs_frame_and_flags() {
        let e = Entry::new(PhysAddr::new(0x0012_3456), PageFlags::PRESENT | PageFlags::USER);
        assert_eq!(e.raw(), 0x0012_3005);
        assert_eq!(e.frame(), PhysAddr::new(0x0012_3000));
        assert_eq!(e.flags(), PageFlags::PRESENT | PageFlags::USER);
        assert!(e.is_present());
        assert!(!Entry::EMPTY.is_present());
    }

    #[test]
    fn new_spaces_carry_system_mappings() {
        let mut frames = frames();
        let before = frames.free_report().free_pages();

        let dir = PageDirectory::create(&mut frames).unwrap();
        // Directory plus one table.
        assert_eq!(frames.free_report().free_pages(), before - 2);

        let kern = VirtAddr::new(KERN_BASE);
        assert_eq!(dir.translate(&frames, kern), Some(PhysAddr::new(0)));
        assert_eq!(
            dir.translate(&frames, VirtAddr::new(KERN_BASE + 0x3F_F123)),
            Some(PhysAddr::new(0x3F_F123))
        );
        assert_eq!(dir.translate(&frames, VirtAddr::new(KERN_BASE + 0x40_0000)), None);
        assert_eq!(dir.translate(&frames, VirtAddr::new(0)), None);

        let flags = dir.lookup(&frames, kern).unwrap().flags();
        assert_eq!(flags, PageFlags::PRESENT | PageFlags::WRITABLE);

        let pde = dir.directory(&frames).entries()[kern.directory_index()];
        assert_eq!(pde.flags(), PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER);
        assert_eq!(dir.directory(&frames).present().count(), 1);

        dir.destroy(&mut frames);
        assert_eq!(frames.free_report().free_pages(), before);
    }

    #[test]
    fn unaligned_range_maps_every_touched_page() {
        let mut frames = frames();
        let mut dir = PageDirectory::with_mappings(&mut frames, &[]).unwrap();

        let va = VirtAddr::new(0x40_0123);
        dir.map_range(&mut frames, va, PhysAddr::new(0x20_0123), 2 * PAGE_SIZE + 100, PageFlags::USER)
            .unwrap();

        for (v, p) in [(0x40_0000, 0x20_0000), (0x40_1000, 0x20_1000), (0x40_2FFF, 0x20_2FFF)] {
            assert_eq!(dir.translate(&frames, VirtAddr::new(v)), Some(PhysAddr::new(p)));
        }
        assert_eq!(dir.translate(&frames, VirtAddr::new(0x40_3000)), None);
        assert_eq!(
            dir.lookup(&frames, VirtAddr::new(0x40_1000)).unwrap().flags(),
            PageFlags::PRESENT | PageFlags::USER
        );

        dir.destroy(&mut frames);
    }

    #[test]
    fn remapping_is_rejected_without_side_effects() {
        let mut frames = frames();
        let mut dir = PageDirectory::create(&mut frames).unwrap();

        dir.map_range(&mut frames, VirtAddr::new(0x40_0000), PhysAddr::new(0x10_0000), 3 * PAGE_SIZE, PageFlags::WRITABLE)
            .unwrap();

        assert_eq!(
            dir.map_range(&mut frames, VirtAddr::new(0x40_1000), PhysAddr::new(0x90_0000), 1, PageFlags::empty()),
            Err(MapError::RemapViolation)
        );

        // Overlaps only the last page; the first must stay unmapped.
        assert_eq!(
            dir.map_range(&mut frames, VirtAddr::new(0x3F_F000), PhysAddr::new(0x90_0000), 2 * PAGE_SIZE, PageFlags::empty()),
            Err(MapError::RemapViolation)
        );
        assert_eq!(dir.translate(&frames, VirtAddr::new(0x3F_F000)), None);
        assert_eq!(dir.translate(&frames, VirtAddr::new(0x40_1000)), Some(PhysAddr::new(0x10_1000)));

        // The static mappings are protected as well.
        assert_eq!(
            dir.map_range(&mut frames, VirtAddr::new(KERN_BASE), PhysAddr::new(0), PAGE_SIZE, PageFlags::empty()),
            Err(MapError::RemapViolation)
        );

        dir.destroy(&mut frames);
    }

    #[test]
    fn ranges_must_not_wrap() {
        let mut frames = frames();
        let mut dir = PageDirectory::with_mappings(&mut frames, &[]).unwrap();

        assert_eq!(
            dir.map_range(&mut frames, VirtAddr::new(0xFFFF_F000), PhysAddr::new(0), 2 * PAGE_SIZE, PageFlags::empty()),
            Err(MapError::RangeOverflow)
        );
        assert_eq!(
            dir.map_range(&mut frames, VirtAddr::new(0), PhysAddr::new(0xFFFF_F000), 2 * PAGE_SIZE, PageFlags::empty()),
            Err(MapError::RangeOverflow)
        );
        assert_eq!(
            dir.map_range(&mut frames, VirtAddr::new(0x1000), PhysAddr::new(0x1000), 0, PageFlags::empty()),
            Ok(())
        );
        assert_eq!(dir.directory(&frames).present().count(), 0);

        dir.destroy(&mut frames);
    }

    #[test]
    fn out_of_memory_rolls_back() {
        let mut frames = frames();
        let mut dir = PageDirectory::with_mappings(&mut frames, &[]).unwrap();

        let mut held = drain(&mut frames);
        assert_eq!(
            dir.map_range(&mut frames, VirtAddr::new(0), PhysAddr::new(0), PAGE_SIZE, PageFlags::empty()),
            Err(MapError::OutOfMemory)
        );

        // Room for one table, but the range needs two.
        frames.free(held.pop().unwrap(), 0).unwrap();
        assert_eq!(
            dir.map_range(&mut frames, VirtAddr::new(0x3F_F000), PhysAddr::new(0), 2 * PAGE_SIZE, PageFlags::empty()),
            Err(MapError::OutOfMemory)
        );
        assert_eq!(dir.translate(&frames, VirtAddr::new(0x3F_F000)), None);

        // The table installed for the first page is empty again and released.
        assert!(dir.lookup(&frames, VirtAddr::new(0x3F_F000)).is_none());
        assert_eq!(dir.directory(&frames).present().count(), 0);
        assert_eq!(frames.free_report().free_pages(), 1);

        for frame in held {
            frames.free(frame, 0).unwrap();
        }
        dir.destroy(&mut frames);
        assert_eq!(frames.free_count(crate::MAX_ORDER - 1), 1);
    }

    #[test]
    fn failed_creation_releases_the_directory() {
        let mut frames = frames();
        let mut held = drain(&mut frames);
        frames.free(held.pop().unwrap(), 0).unwrap();

        // The directory fits, its first table does not.
        assert_eq!(PageDirectory::create(&mut frames).unwrap_err(), MapError::OutOfMemory);
        assert_eq!(frames.free_report().free_pages(), 1);
    }
}
