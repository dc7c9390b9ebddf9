//! Power-of-two helpers used to turn page counts into block orders.

use crate::{polyfill::UsizeExt, MAX_ORDER};

/// Rounds `x` up to the nearest power of two.
///
/// Returns 0 for an input of 0, and also when the result would not fit in a
/// `usize`.
#[inline]
pub fn round_up_power_2(x: usize) -> usize {
    match x {
        0 => 0,
        x => x.checked_next_power_of_two().unwrap_or(0),
    }
}

/// Rounds `x` down to the nearest power of two. Returns 0 for an input of 0.
#[inline]
pub fn round_down_power_2(x: usize) -> usize {
    match x {
        0 => 0,
        x => 1 << x.log2(),
    }
}

/// Returns the index of the lowest set bit of `x`.
///
/// For a power of two this is its base-2 logarithm. An input of 0 yields
/// `usize::BITS`.
#[inline]
pub fn trailing_zero(x: usize) -> u32 {
    x.trailing_zeros()
}

/// Returns the order of the smallest block holding `pages` pages.
///
/// Returns `None` for zero pages or for counts above the largest block.
pub fn order_for_pages(pages: usize) -> Option<usize> {
    let rounded = round_up_power_2(pages);
    if rounded == 0 {
        return None;
    }

    let order = trailing_zero(rounded) as usize;
    (order < MAX_ORDER).then_some(order)
}
