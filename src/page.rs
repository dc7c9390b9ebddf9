//! Addresses, page constants and per-page descriptors.

use core::fmt;

use bitflags::bitflags;

/// The size of a single page in bytes.
///
/// This is also the order-0 block size of the buddy allocator.
pub const PAGE_SIZE: usize = 0x1000;

/// Base of the kernel's high-half virtual mapping.
pub const KERN_BASE: u32 = 0x8000_0000;

macro_rules! address_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Creates an address from its raw value.
            #[inline]
            pub const fn new(addr: u32) -> Self {
                Self(addr)
            }

            /// Returns the raw address.
            #[inline]
            pub const fn as_u32(self) -> u32 {
                self.0
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }

            /// Rounds down to a multiple of `align`, which must be a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                Self(self.0 & !(align as u32).wrapping_sub(1))
            }

            /// Rounds up to a multiple of `align`, which must be a power of two.
            ///
            /// Returns `None` if the result does not fit in 32 bits.
            #[inline]
            pub fn align_up(self, align: usize) -> Option<Self> {
                let mask = u32::try_from(align).ok()?.wrapping_sub(1);
                self.0.checked_add(mask).map(|a| Self(a & !mask))
            }

            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                self.0 as usize & (align - 1) == 0
            }

            /// Adds a byte offset, returning `None` on overflow.
            #[inline]
            pub fn checked_add(self, bytes: usize) -> Option<Self> {
                let bytes = u32::try_from(bytes).ok()?;
                self.0.checked_add(bytes).map(Self)
            }

            /// Returns the number of bytes from `earlier` to `self`.
            #[inline]
            pub fn offset_from(self, earlier: Self) -> Option<usize> {
                self.0.checked_sub(earlier.0).map(|d| d as usize)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#010x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

address_type! {
    /// A 32-bit physical address.
    PhysAddr
}

address_type! {
    /// A 32-bit virtual address.
    VirtAddr
}

impl PhysAddr {
    /// Returns the kernel high-half alias of this physical address.
    pub fn to_kernel_virt(self) -> Option<VirtAddr> {
        self.0.checked_add(KERN_BASE).map(VirtAddr)
    }
}

impl VirtAddr {
    /// Marks a page descriptor whose page has no virtual mapping yet.
    pub const UNMAPPED: VirtAddr = VirtAddr(0xFFFF_FFFF);

    /// Converts a kernel high-half address back to its physical address.
    pub fn kernel_to_phys(self) -> Option<PhysAddr> {
        self.0.checked_sub(KERN_BASE).map(PhysAddr)
    }

    /// Index of the page directory entry covering this address.
    #[inline]
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Index of the page table entry covering this address.
    #[inline]
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) & 0x3FF) as usize
    }
}

bitflags! {
    /// Type and state of a physical page.
    #[repr(transparent)]
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PageType: u32 {
        const USABLE = 0x01;
        const RESERVED = 0x02;
        const SYSTEM = 0x04;
        const HARDWARE = 0x08;
        const FREE = 0x10;
        const IN_USE = 0x20;
    }
}

/// Bookkeeping record for one physical page of the managed region.
///
/// The allocator keeps `flags` current for every page it hands out or takes
/// back. `reference` and `vaddr` belong to higher layers.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageDescriptor {
    pub flags: PageType,
    pub reference: i32,
    pub vaddr: VirtAddr,
    /// `order + 1` on the first page of a live block, 0 on every other page.
    pub(crate) reserved: u32,
}

impl PageDescriptor {
    pub(crate) const fn new(flags: PageType) -> PageDescriptor {
        PageDescriptor {
            flags,
            reference: 0,
            vaddr: VirtAddr::UNMAPPED,
            reserved: 0,
        }
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.flags.contains(PageType::IN_USE)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.flags.contains(PageType::FREE)
    }

    /// Returns the order of the live block starting at this page, or `None`
    /// if no allocated block starts here.
    #[inline]
    pub fn block_order(&self) -> Option<usize> {
        (self.reserved as usize).checked_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use core::mem;

    use super::*;

    #[test]
    fn descriptor_is_four_words() {
        assert_eq!(mem::size_of::<PageDescriptor>(), 16);
        assert_eq!(mem::align_of::<PageDescriptor>(), 4);
    }

    #[test]
    fn alignment_helpers() {
        let a = PhysAddr::new(0x1234);
        assert_eq!(a.align_down(PAGE_SIZE), PhysAddr::new(0x1000));
        assert_eq!(a.align_up(PAGE_SIZE), Some(PhysAddr::new(0x2000)));
        assert_eq!(PhysAddr::new(0x2000).align_up(PAGE_SIZE), Some(PhysAddr::new(0x2000)));
        assert_eq!(PhysAddr::new(u32::MAX).align_up(PAGE_SIZE), None);
        assert!(PhysAddr::new(0x3000).is_aligned(PAGE_SIZE));
        assert!(!a.is_aligned(PAGE_SIZE));
    }

    #[test]
    fn kernel_alias_round_trips() {
        let v = VirtAddr::new(0x8010_0000);
        let p = v.kernel_to_phys().unwrap();
        assert_eq!(p, PhysAddr::new(0x0010_0000));
        assert_eq!(p.to_kernel_virt(), Some(v));
        assert_eq!(VirtAddr::new(0x1000).kernel_to_phys(), None);
    }

    #[test]
    fn directory_and_table_indices() {
        let v = VirtAddr::new(0x8040_3123);
        assert_eq!(v.directory_index(), 0x201);
        assert_eq!(v.table_index(), 0x3);
    }

    #[test]
    fn address_formatting() {
        extern crate std;
        use std::format;

        assert_eq!(format!("{}", PhysAddr::new(0x1000)), "0x00001000");
        assert_eq!(format!("{:?}", VirtAddr::new(0x10)), "VirtAddr(0x00000010)");
    }
}
