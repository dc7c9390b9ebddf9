//! Boot-time memory information supplied by the environment.
//!
//! The kernel learns about physical memory from a read-only source filled in
//! before the allocator runs: the firmware memory map and the extent of the
//! loaded kernel image. [`managed_range`] turns both into the physical range
//! handed to the allocator.

use core::ops::Range;

use crate::{
    page::{PhysAddr, VirtAddr},
    AllocInitError,
};

/// Type of a firmware memory zone, numbered as in the E820 map.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ZoneKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Bad,
    Unknown(u32),
}

impl ZoneKind {
    pub fn from_raw(raw: u32) -> ZoneKind {
        match raw {
            1 => ZoneKind::Usable,
            2 => ZoneKind::Reserved,
            3 => ZoneKind::AcpiReclaimable,
            4 => ZoneKind::AcpiNvs,
            5 => ZoneKind::Bad,
            other => ZoneKind::Unknown(other),
        }
    }
}

/// One entry of the firmware memory map.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryZone {
    pub start: u64,
    pub length: u64,
    pub kind: ZoneKind,
}

impl MemoryZone {
    /// One past the last byte of the zone.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    /// Returns `true` if the zone covers all of `range`.
    pub fn contains(&self, range: &Range<PhysAddr>) -> bool {
        self.start <= u64::from(range.start.as_u32()) && u64::from(range.end.as_u32()) <= self.end()
    }
}

/// Memory taken by the kernel image and the top of physical memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CoreMemoryUsage {
    /// First free byte after the kernel image, as a high-half address.
    pub core_space_end: VirtAddr,
    /// One past the last byte of usable physical memory.
    pub memory_end: PhysAddr,
}

/// A read-only source of boot-time memory information.
pub trait Environment {
    /// Returns the firmware memory map. May be empty if none was provided.
    fn memory_zones(&self) -> &[MemoryZone];

    fn core_memory_usage(&self) -> CoreMemoryUsage;
}

/// Computes the physical range the allocator should manage: from the end of
/// the kernel image to the end of memory.
///
/// # Errors
///
/// Returns `InvalidConfig` if the kernel end is not a high-half address, lies
/// at or past the end of memory, or if a memory map is present and no usable
/// zone covers the whole range.
pub fn managed_range<E: Environment + ?Sized>(env: &E) -> Result<Range<PhysAddr>, AllocInitError> {
    let usage = env.core_memory_usage();

    let start = usage.core_space_end.kernel_to_phys().ok_or_else(|| {
        log::warn!("kernel end {} is below the kernel base", usage.core_space_end);
        AllocInitError::InvalidConfig
    })?;
    let end = usage.memory_end;

    if start >= end {
        log::warn!("kernel end {start} leaves no memory below {end}");
        return Err(AllocInitError::InvalidConfig);
    }

    let range = start..end;
    let zones = env.memory_zones();
    if !zones.is_empty()
        && !zones
            .iter()
            .any(|zone| zone.kind == ZoneKind::Usable && zone.contains(&range))
    {
        log::warn!("no usable zone covers {start}..{end}");
        return Err(AllocInitError::InvalidConfig);
    }

    log::debug!("managed range {start}..{end} ({} zones reported)", zones.len());
    Ok(range)
}
