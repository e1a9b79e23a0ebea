//! Range mapping ledger entries

use core::fmt;

use crate::mm::{
    align_down, align_up,
    page_table::{PageTableLevel, PagingMode},
    VirtualAddress,
};

/// One caller-requested mapping
///
/// The range covers `[ptr, ptr + size)` but is materialized at `level`
/// granularity, so the span actually present in the table is the range
/// rounded out to that level's entry size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeMapping {
    pub ptr: VirtualAddress,
    pub size: usize,
    pub level: PageTableLevel,
    /// Number of mapping requests overlapping the rounded span, this one
    /// included
    pub refcnt: u32,
}

impl RangeMapping {
    pub fn new(ptr: VirtualAddress, size: usize, level: PageTableLevel) -> Self {
        Self {
            ptr,
            size,
            level,
            refcnt: 1,
        }
    }

    /// Unrounded end of the request
    pub fn end(&self) -> u64 {
        self.ptr.as_u64().saturating_add(self.size as u64)
    }

    /// Start of the rounded span
    pub fn map_addr(&self, mode: PagingMode) -> u64 {
        align_down(self.ptr.as_u64(), self.level.size(mode))
    }

    /// End of the rounded span
    pub fn map_end(&self, mode: PagingMode) -> u64 {
        align_up(self.end(), self.level.size(mode))
    }

    /// Whether the rounded span intersects `[addr, end)`
    pub fn overlaps(&self, addr: u64, end: u64, mode: PagingMode) -> bool {
        end > self.map_addr(mode) && addr < self.map_end(mode)
    }

    /// Whether `[addr, end)` lies entirely inside the rounded span
    pub fn covers(&self, addr: u64, end: u64, mode: PagingMode) -> bool {
        addr >= self.map_addr(mode) && end <= self.map_end(mode)
    }

    /// Whether `addr` falls inside the rounded span
    pub fn contains(&self, addr: u64, mode: PagingMode) -> bool {
        addr >= self.map_addr(mode) && addr < self.map_end(mode)
    }
}

impl fmt::Display for RangeMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}/{}", self.ptr.as_u64(), self.size, self.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODE: PagingMode = PagingMode::FourLevel;

    #[test]
    fn test_rounded_span() {
        let r = RangeMapping::new(VirtualAddress::new(0x20_1010), 0x10, PageTableLevel::Pmd);
        assert_eq!(r.map_addr(MODE), 0x20_0000);
        assert_eq!(r.map_end(MODE), 0x40_0000);

        let r = RangeMapping::new(VirtualAddress::new(0x1010), 0x1000, PageTableLevel::Pte);
        assert_eq!(r.map_addr(MODE), 0x1000);
        assert_eq!(r.map_end(MODE), 0x3000);
    }

    #[test]
    fn test_overlap_and_cover() {
        let r = RangeMapping::new(VirtualAddress::new(0x20_0000), 0x1000, PageTableLevel::Pmd);
        assert!(r.overlaps(0x3f_f000, 0x40_1000, MODE));
        assert!(!r.overlaps(0x40_0000, 0x40_1000, MODE));
        assert!(!r.overlaps(0x10_0000, 0x20_0000, MODE));
        assert!(r.covers(0x30_0000, 0x30_1000, MODE));
        assert!(!r.covers(0x3f_f000, 0x40_1000, MODE));
        assert!(r.contains(0x3f_ffff, MODE));
        assert!(!r.contains(0x40_0000, MODE));
    }
}
