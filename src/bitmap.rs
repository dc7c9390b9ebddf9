//! Dense bit sets over raw memory.
//!
//! The allocator places one of these per order inside the metadata tail of
//! the managed region, so a `Bitmap` never owns its storage.

use core::{alloc::Layout, fmt, mem};

/// A fixed-size set of bits backed by a caller-provided array of `u64` words.
pub struct Bitmap {
    num_bits: usize,
    map: *mut u64,
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap").field("num_bits", &self.num_bits).finish_non_exhaustive()
    }
}

impl Bitmap {
    /// Returns the layout of the words backing a bitmap of `num_bits` bits.
    pub fn map_layout(num_bits: usize) -> Layout {
        let num_blocks = Self::num_blocks(num_bits);

        Layout::array::<u64>(num_blocks).expect("bitmap metadata layout error")
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`.
    ///
    /// Every bit starts out clear.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `Bitmap::map_layout(num_bits).size()` bytes, and it must be properly
    ///   aligned.
    /// - No other live reference may alias that memory while the bitmap exists.
    pub unsafe fn new(num_bits: usize, map: *mut u64) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());
        assert!(map.align_offset(mem::align_of::<u64>()) == 0);

        let num_blocks = Self::num_blocks(num_bits);

        for i in 0..num_blocks {
            unsafe { map.add(i).write(0) };
        }

        Bitmap { num_bits, map }
    }

    #[inline]
    pub const fn num_blocks(num_bits: usize) -> usize {
        num_bits.div_ceil(u64::BITS as usize)
    }

    /// Returns the number of bits in the set.
    #[inline]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    #[inline]
    fn block_ptr(&self, index: usize) -> (*mut u64, u64) {
        assert!(
            index < self.num_bits,
            "bit index {index} out of range for bitmap of {} bits",
            self.num_bits
        );

        let (block_idx, mask) = Self::index_and_mask(index);

        // SAFETY: `block_idx` is in bounds because `index < num_bits`.
        (unsafe { self.map.add(block_idx) }, mask)
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        let (block_ptr, mask) = self.block_ptr(index);

        unsafe { block_ptr.read() & mask != 0 }
    }

    /// Sets the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize) {
        let (block_ptr, mask) = self.block_ptr(index);

        unsafe { block_ptr.write(block_ptr.read() | mask) };
    }

    /// Clears the indexed bit.
    #[inline]
    pub fn clear(&mut self, index: usize) {
        let (block_ptr, mask) = self.block_ptr(index);

        unsafe { block_ptr.write(block_ptr.read() & !mask) };
    }

    /// Toggles the indexed bit and returns its new value.
    #[inline]
    pub fn toggle(&mut self, index: usize) -> bool {
        let (block_ptr, mask) = self.block_ptr(index);

        unsafe {
            let block = block_ptr.read() ^ mask;
            block_ptr.write(block);
            block & mask != 0
        }
    }

    /// Returns the index of the first clear bit below `size`.
    ///
    /// Returns `None` when every bit in `0..size` is set; callers treat this
    /// as running out of capacity. `size` is clamped to the bitmap length.
    pub fn find_first_unset(&self, size: usize) -> Option<usize> {
        let size = size.min(self.num_bits);

        for block_idx in 0..Self::num_blocks(size) {
            let block = unsafe { self.map.add(block_idx).read() };
            if block == u64::MAX {
                continue;
            }

            let bit = block_idx * u64::BITS as usize + (!block).trailing_zeros() as usize;
            return (bit < size).then_some(bit);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::mem::ManuallyDrop;
    use std::prelude::rust_2021::*;

    use super::*;

    struct VecBitmap {
        bitmap: ManuallyDrop<Bitmap>,
        len: usize,
        cap: usize,
    }

    impl VecBitmap {
        fn new(num_bits: usize) -> VecBitmap {
            let num_blocks = Bitmap::num_blocks(num_bits);

            // Start from garbage so construction is seen to clear it.
            let v = vec![u64::MAX; num_blocks];

            let mut v = ManuallyDrop::new(v);
            let map = v.as_mut_ptr();
            let len = v.len();
            let cap = v.capacity();

            VecBitmap {
                bitmap: ManuallyDrop::new(unsafe { Bitmap::new(num_bits, map) }),
                len,
                cap,
            }
        }
    }

    impl Drop for VecBitmap {
        fn drop(&mut self) {
            unsafe {
                let Bitmap { map, .. } = ManuallyDrop::take(&mut self.bitmap);

                // Reconstitute the original Vec.
                drop(Vec::from_raw_parts(map, self.len, self.cap));
            }
        }
    }

    #[test]
    fn init_many() {
        for num_bits in 1..=256 {
            let v = VecBitmap::new(num_bits);
            assert!((0..num_bits).all(|i| !v.bitmap.get(i)));
        }
    }

    #[test]
    fn set_clear_toggle() {
        let mut v = VecBitmap::new(130);
        let b = &mut *v.bitmap;

        b.set(0);
        b.set(64);
        b.set(129);
        assert!(b.get(0) && b.get(64) && b.get(129));
        assert!(!b.get(1) && !b.get(63) && !b.get(128));

        b.clear(64);
        assert!(!b.get(64));

        assert!(b.toggle(5));
        assert!(b.get(5));
        assert!(!b.toggle(5));
        assert!(!b.get(5));
    }

    #[test]
    fn find_first_unset_walks_words() {
        let mut v = VecBitmap::new(100);
        let b = &mut *v.bitmap;

        assert_eq!(b.find_first_unset(100), Some(0));

        for i in 0..70 {
            b.set(i);
        }
        assert_eq!(b.find_first_unset(100), Some(70));
        assert_eq!(b.find_first_unset(70), None);
        assert_eq!(b.find_first_unset(64), None);

        b.clear(3);
        assert_eq!(b.find_first_unset(100), Some(3));
    }

    #[test]
    fn find_first_unset_reports_full() {
        let mut v = VecBitmap::new(10);
        let b = &mut *v.bitmap;

        for i in 0..10 {
            b.set(i);
        }
        assert_eq!(b.find_first_unset(10), None);
        // Sizes past the end are clamped.
        assert_eq!(b.find_first_unset(1000), None);
    }

    #[test]
    #[should_panic]
    fn out_of_range_index_panics() {
        let v = VecBitmap::new(8);
        v.bitmap.get(8);
    }
}
