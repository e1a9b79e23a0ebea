//! Memory management module
//!
//! Address types, page-table entry flags and the pieces needed to build
//! and mutate isolated page tables: the physical memory model, the
//! multi-level page-table walker, decorated page tables and the page
//! fault entry path.

pub mod dpt;
pub mod frame_allocator;
pub mod page_fault;
pub mod page_table;

use core::fmt;

use bitflags::bitflags;

pub use dpt::{Dpt, PageTableGeneration, RangeMapping};
pub use frame_allocator::{FrameNumber, PhysMemory};
pub use page_table::{PageMapper, PageTableEntry, PageTableLevel, PagingMode};

/// Size of a base page (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`]
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the page-aligned part of an address
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Round down to the containing page
    pub const fn page_align_down(&self) -> Self {
        Self(self.0 & PAGE_MASK)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & !PAGE_MASK == 0
    }

    pub const fn frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 >> PAGE_SHIFT)
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn add(&self, offset: usize) -> Self {
        Self(self.0.wrapping_add(offset as u64))
    }

    pub const fn page_align_down(&self) -> Self {
        Self(self.0 & PAGE_MASK)
    }

    /// Page number of this address
    pub const fn page(&self) -> u64 {
        self.0 >> PAGE_SHIFT
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

bitflags! {
    /// x86_64 page-table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// PS bit: 2 MiB / 1 GiB leaf at PMD / PUD level
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        /// Software bit: device (ZONE_DEVICE style) mapping
        const DEVMAP = 1 << 58;
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Flags used for entries pointing to a lower-level table
    pub const KERNEL_TABLE: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::ACCESSED)
        .union(Self::DIRTY);

    /// Flags for an ordinary kernel data page
    pub const KERNEL_DATA: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::ACCESSED)
        .union(Self::DIRTY)
        .union(Self::GLOBAL)
        .union(Self::NO_EXECUTE);

    /// Flags for a kernel text page
    pub const KERNEL_TEXT: Self = Self::PRESENT
        .union(Self::ACCESSED)
        .union(Self::GLOBAL);
}

/// Round `addr` down to a multiple of `size` (a power of two)
pub const fn align_down(addr: u64, size: u64) -> u64 {
    addr & !(size - 1)
}

/// Round `addr` up to a multiple of `size` (a power of two), saturating at
/// the top of the address space
pub const fn align_up(addr: u64, size: u64) -> u64 {
    match addr.checked_add(size - 1) {
        Some(v) => v & !(size - 1),
        None => u64::MAX & !(size - 1),
    }
}
