//! Free block statistics.

use core::fmt;

use crate::MAX_ORDER;

/// A snapshot of the number of free blocks of each order.
///
/// The `Display` form is a two row table: block sizes in pages, then the
/// free block count for each size.
///
/// ```text
/// block pages: 0001, 0002, 0004, 0008, 0016, 0032, 0064, 0128, 0256, 0512, 1024
/// free blocks: 0000, 0000, 0000, 0000, 0000, 0000, 0000, 0000, 0000, 0000, 0003
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FreeAreaReport {
    counts: [usize; MAX_ORDER],
}

impl FreeAreaReport {
    pub const fn new(counts: [usize; MAX_ORDER]) -> FreeAreaReport {
        FreeAreaReport { counts }
    }

    /// Returns the free block count of every order.
    #[inline]
    pub fn counts(&self) -> &[usize; MAX_ORDER] {
        &self.counts
    }

    /// Returns the number of free pages, each block weighted by its size.
    pub fn free_pages(&self) -> usize {
        self.counts
            .iter()
            .enumerate()
            .map(|(order, &count)| count << order)
            .sum()
    }
}

fn write_row(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    values: impl Iterator<Item = usize>,
) -> fmt::Result {
    f.write_str(label)?;
    for (idx, value) in values.enumerate() {
        let sep = if idx == 0 { " " } else { ", " };
        write!(f, "{sep}{value:04}")?;
    }
    Ok(())
}

impl fmt::Display for FreeAreaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_row(f, "block pages:", (0..MAX_ORDER).map(|order| 1 << order))?;
        f.write_str("\n")?;
        write_row(f, "free blocks:", self.counts.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::ToString;

    use super::*;

    #[test]
    fn weights_counts_by_block_size() {
        let mut counts = [0; MAX_ORDER];
        counts[0] = 3;
        counts[4] = 1;
        counts[MAX_ORDER - 1] = 2;

        assert_eq!(FreeAreaReport::new(counts).free_pages(), 3 + 16 + 2048);
        assert_eq!(FreeAreaReport::default().free_pages(), 0);
    }

    #[test]
    fn renders_two_rows() {
        let mut counts = [0; MAX_ORDER];
        counts[1] = 12;
        counts[MAX_ORDER - 1] = 3;

        let text = FreeAreaReport::new(counts).to_string();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("block pages: 0001, 0002, 0004, 0008, 0016, 0032, 0064, 0128, 0256, 0512, 1024")
        );
        assert_eq!(
            lines.next(),
            Some("free blocks: 0000, 0012, 0000, 0000, 0000, 0000, 0000, 0000, 0000, 0000, 0003")
        );
        assert_eq!(lines.next(), None);
    }
}
