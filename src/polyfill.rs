//! Polyfills for integer and strict-provenance pointer methods.
//!
//! The implementations in this module follow the standard library source.

use core::{num::NonZeroUsize, ptr::NonNull};

pub use sptr::Strict;

// #![feature(int_log)]

pub trait UsizeExt {
    fn log2(self) -> u32;
}

impl UsizeExt for usize {
    #[inline]
    fn log2(self) -> u32 {
        Self::BITS - 1 - self.leading_zeros()
    }
}

// #![feature(strict_provenance)]

pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    #[inline]
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is guaranteed by the type to be non-null,
        // meaning that the address will be non-zero.
        unsafe { NonZeroUsize::new_unchecked(Strict::addr(self.as_ptr())) }
    }

    #[inline]
    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized,
    {
        // SAFETY: The result of `with_addr` is non-null because `addr` is
        // guaranteed to be non-zero.
        unsafe { NonNull::new_unchecked(Strict::with_addr(self.as_ptr(), addr.get())) }
    }
}
