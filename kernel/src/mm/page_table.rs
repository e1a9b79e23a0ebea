//! Page table structures and walks
//!
//! Entries, levels and the generic walker shared by source page tables and
//! decorated page tables. Tables are addressed by the physical address of
//! their frame inside [`PhysMemory`]; nothing here dereferences raw
//! pointers.
//!
//! Supports 4-level and 5-level paging. With 4-level paging the P4D level is
//! folded into the PGD: it has the PGD's span and is never materialized as
//! a separate table.

use core::fmt;

use super::{
    frame_allocator::PhysMemory, FrameNumber, PageFlags, PhysicalAddress, VirtualAddress,
    PAGE_SHIFT,
};
use crate::error::{KernelError, KernelResult};

/// Number of entries in a page table
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Physical address bits of an entry
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Page table entry
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    /// Create an empty/unused entry
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    /// Wrap a raw entry value
    pub const fn from_raw(entry: u64) -> Self {
        Self { entry }
    }

    /// Build an entry pointing at `addr` with `flags`
    pub const fn new(addr: PhysicalAddress, flags: PageFlags) -> Self {
        Self {
            entry: (addr.as_u64() & ENTRY_ADDR_MASK) | flags.bits(),
        }
    }

    pub const fn raw(&self) -> u64 {
        self.entry
    }

    /// Check if the entry is unused (all bits clear)
    pub const fn is_unused(&self) -> bool {
        self.entry == 0
    }

    /// Check if the entry is present
    pub const fn is_present(&self) -> bool {
        self.entry & PageFlags::PRESENT.bits() != 0
    }

    /// Check if the entry is a huge leaf (only meaningful at PMD/PUD level)
    pub const fn is_huge(&self) -> bool {
        self.entry & PageFlags::HUGE.bits() != 0
    }

    /// Check if the entry maps device memory
    pub const fn is_devmap(&self) -> bool {
        self.entry & PageFlags::DEVMAP.bits() != 0
    }

    /// Physical address this entry points to
    pub const fn addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.entry & ENTRY_ADDR_MASK)
    }

    /// Physical frame this entry points to, if present
    pub fn frame(&self) -> Option<FrameNumber> {
        if self.is_present() {
            Some(self.addr().frame())
        } else {
            None
        }
    }

    /// Get flags for this entry
    pub const fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.entry & !ENTRY_ADDR_MASK)
    }

    /// Set this entry to map to an address with given flags
    pub fn set_addr(&mut self, addr: PhysicalAddress, flags: PageFlags) {
        *self = Self::new(addr, flags);
    }

    /// Clear this entry
    pub fn clear(&mut self) {
        self.entry = 0;
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageTableEntry({:#x})", self.entry)
    }
}

/// Number of page-table levels in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PagingMode {
    /// PGD -> PUD -> PMD -> PTE, P4D folded into PGD
    #[default]
    FourLevel,
    /// PGD -> P4D -> PUD -> PMD -> PTE
    FiveLevel,
}

impl PagingMode {
    pub const fn levels(&self) -> usize {
        match self {
            Self::FourLevel => 4,
            Self::FiveLevel => 5,
        }
    }
}

/// Page-table level, leaf first
///
/// The numeric values are the level numbers used on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum PageTableLevel {
    Pte = 0,
    Pmd = 1,
    Pud = 2,
    P4d = 3,
    Pgd = 4,
}

impl PageTableLevel {
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Pte),
            1 => Some(Self::Pmd),
            2 => Some(Self::Pud),
            3 => Some(Self::P4d),
            4 => Some(Self::Pgd),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pte => "PTE",
            Self::Pmd => "PMD",
            Self::Pud => "PUD",
            Self::P4d => "P4D",
            Self::Pgd => "PGD",
        }
    }

    /// Shift of the address span covered by one entry at this level
    pub const fn shift(&self, mode: PagingMode) -> u32 {
        match (self, mode) {
            (Self::Pte, _) => PAGE_SHIFT,
            (Self::Pmd, _) => 21,
            (Self::Pud, _) => 30,
            (Self::P4d, _) => 39,
            (Self::Pgd, PagingMode::FourLevel) => 39,
            (Self::Pgd, PagingMode::FiveLevel) => 48,
        }
    }

    /// Bytes mapped by one entry at this level
    pub const fn size(&self, mode: PagingMode) -> u64 {
        1u64 << self.shift(mode)
    }

    /// Index of `addr` in a table of this level
    pub const fn index(&self, addr: u64, mode: PagingMode) -> usize {
        ((addr >> self.shift(mode)) as usize) % PAGE_TABLE_ENTRIES
    }

    /// The level this one collapses to in `mode`
    pub const fn folded(self, mode: PagingMode) -> Self {
        match (self, mode) {
            (Self::P4d, PagingMode::FourLevel) => Self::Pgd,
            (level, _) => level,
        }
    }

    /// Next level down the walk, `None` at PTE
    pub const fn lower(&self, mode: PagingMode) -> Option<Self> {
        match (self, mode) {
            (Self::Pgd, PagingMode::FourLevel) => Some(Self::Pud),
            (Self::Pgd, PagingMode::FiveLevel) => Some(Self::P4d),
            (Self::P4d, _) => Some(Self::Pud),
            (Self::Pud, _) => Some(Self::Pmd),
            (Self::Pmd, _) => Some(Self::Pte),
            (Self::Pte, _) => None,
        }
    }

    /// Whether an entry at this level may be a huge leaf
    pub const fn supports_huge(&self) -> bool {
        matches!(self, Self::Pmd | Self::Pud)
    }
}

impl fmt::Display for PageTableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `entry`, found at `level`, terminates a walk
pub(crate) fn is_leaf(entry: PageTableEntry, level: PageTableLevel) -> bool {
    level == PageTableLevel::Pte || (level.supports_huge() && entry.is_huge())
}

/// Result of a successful address translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub phys: PhysicalAddress,
    pub entry: PageTableEntry,
    pub level: PageTableLevel,
}

/// Translate `vaddr` through the table rooted at `root`
pub fn translate(mem: &PhysMemory, root: PhysicalAddress, vaddr: VirtualAddress) -> Option<Translation> {
    let mode = mem.mode();
    let addr = vaddr.as_u64();
    let mut table = root;
    let mut level = PageTableLevel::Pgd;

    loop {
        let entry = PageTableEntry::from_raw(mem.read_entry(table, level.index(addr, mode)));
        if !entry.is_present() {
            return None;
        }
        if is_leaf(entry, level) {
            let span = level.size(mode);
            let base = entry.addr().as_u64() & !(span - 1);
            return Some(Translation {
                phys: PhysicalAddress::new(base | (addr & (span - 1))),
                entry,
                level,
            });
        }
        table = entry.addr();
        level = level.lower(mode)?;
    }
}

/// Read the entry mapping `vaddr` at `target` level, if the walk reaches it
pub fn lookup_entry(
    mem: &PhysMemory,
    root: PhysicalAddress,
    vaddr: VirtualAddress,
    target: PageTableLevel,
) -> Option<PageTableEntry> {
    let mode = mem.mode();
    let target = target.folded(mode);
    let addr = vaddr.as_u64();
    let mut table = root;
    let mut level = PageTableLevel::Pgd;

    loop {
        let entry = PageTableEntry::from_raw(mem.read_entry(table, level.index(addr, mode)));
        if level == target {
            return Some(entry);
        }
        if !entry.is_present() || is_leaf(entry, level) {
            return None;
        }
        table = entry.addr();
        level = level.lower(mode)?;
    }
}

/// Builder for ordinary (source) page tables
///
/// Intermediate tables are allocated on demand with kernel table flags.
/// Source tables are never freed by this type; they model the kernel page
/// table that lives for the whole run.
pub struct PageMapper<'a> {
    mem: &'a PhysMemory,
    root: PhysicalAddress,
}

impl<'a> PageMapper<'a> {
    /// Wrap an existing root table
    pub fn new(mem: &'a PhysMemory, root: PhysicalAddress) -> Self {
        Self { mem, root }
    }

    /// Allocate an empty root table.
    ///
    /// The root is 8 KiB aligned: bit 12 of a CR3 value is reserved to
    /// tell decorated page tables apart from ordinary ones.
    pub fn create(mem: &'a PhysMemory) -> KernelResult<Self> {
        let root = mem.allocate_frames(1, 2)?;
        Ok(Self { mem, root })
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Map a 4 KiB page
    pub fn map_page(
        &mut self,
        page: VirtualAddress,
        frame: PhysicalAddress,
        flags: PageFlags,
    ) -> KernelResult<()> {
        self.map_at(page, frame, PageTableLevel::Pte, flags | PageFlags::PRESENT)
    }

    /// Map `count` consecutive 4 KiB pages starting at `page`
    pub fn map_pages(
        &mut self,
        page: VirtualAddress,
        frame: PhysicalAddress,
        count: usize,
        flags: PageFlags,
    ) -> KernelResult<()> {
        for i in 0..count as u64 {
            self.map_page(
                VirtualAddress::new(page.as_u64() + (i << PAGE_SHIFT)),
                PhysicalAddress::new(frame.as_u64() + (i << PAGE_SHIFT)),
                flags,
            )?;
        }
        Ok(())
    }

    /// Map a huge page at PMD (2 MiB) or PUD (1 GiB) level
    pub fn map_huge(
        &mut self,
        page: VirtualAddress,
        frame: PhysicalAddress,
        level: PageTableLevel,
        flags: PageFlags,
    ) -> KernelResult<()> {
        if !level.supports_huge() {
            return Err(KernelError::InvalidArgument {
                name: "huge page level",
                value: level as u64,
            });
        }
        let span = level.size(self.mem.mode());
        if page.as_u64() & (span - 1) != 0 || frame.as_u64() & (span - 1) != 0 {
            return Err(KernelError::InvalidArgument {
                name: "huge page alignment",
                value: page.as_u64(),
            });
        }
        self.map_at(
            page,
            frame,
            level,
            flags | PageFlags::PRESENT | PageFlags::HUGE,
        )
    }

    /// Write a raw entry at `level` for `page`, creating intermediate tables.
    ///
    /// Used to model entries the regular builders never produce, such as
    /// swapped-out (non-present, non-zero) entries.
    pub fn set_raw_entry(
        &mut self,
        page: VirtualAddress,
        level: PageTableLevel,
        entry: PageTableEntry,
    ) -> KernelResult<()> {
        let (table, index) = self.table_for(page, level)?;
        self.mem.write_entry(table, index, entry.raw())?;
        Ok(())
    }

    /// Unmap a 4 KiB page, returning the frame it pointed to
    pub fn unmap_page(&mut self, page: VirtualAddress) -> KernelResult<PhysicalAddress> {
        let mode = self.mem.mode();
        let addr = page.as_u64();
        let mut table = self.root;
        let mut level = PageTableLevel::Pgd;

        while let Some(lower) = level.lower(mode) {
            let entry = PageTableEntry::from_raw(self.mem.read_entry(table, level.index(addr, mode)));
            if !entry.is_present() || is_leaf(entry, level) {
                return Err(KernelError::UnmappedMemory { addr });
            }
            table = entry.addr();
            level = lower;
        }

        let index = level.index(addr, mode);
        let entry = PageTableEntry::from_raw(self.mem.read_entry(table, index));
        if !entry.is_present() {
            return Err(KernelError::UnmappedMemory { addr });
        }
        self.mem.write_entry(table, index, 0)?;
        Ok(entry.addr())
    }

    fn map_at(
        &mut self,
        page: VirtualAddress,
        frame: PhysicalAddress,
        level: PageTableLevel,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let (table, index) = self.table_for(page, level)?;
        let current = PageTableEntry::from_raw(self.mem.read_entry(table, index));
        if current.is_present() {
            return Err(KernelError::AlreadyMapped {
                addr: page.as_u64(),
                size: level.size(self.mem.mode()),
            });
        }
        self.mem
            .write_entry(table, index, PageTableEntry::new(frame, flags).raw())?;
        Ok(())
    }

    /// Walk down to the table holding the `target` entry for `page`
    fn table_for(
        &mut self,
        page: VirtualAddress,
        target: PageTableLevel,
    ) -> KernelResult<(PhysicalAddress, usize)> {
        let mode = self.mem.mode();
        let target = target.folded(mode);
        let addr = page.as_u64();
        let mut table = self.root;
        let mut level = PageTableLevel::Pgd;

        while level != target {
            let index = level.index(addr, mode);
            let entry = PageTableEntry::from_raw(self.mem.read_entry(table, index));
            let next = if entry.is_unused() {
                let frame = self.mem.allocate_frame()?;
                self.mem.write_entry(
                    table,
                    index,
                    PageTableEntry::new(frame, PageFlags::KERNEL_TABLE).raw(),
                )?;
                frame
            } else if !entry.is_present() || is_leaf(entry, level) {
                return Err(KernelError::Conflict {
                    addr,
                    current: entry.raw(),
                    new: PageFlags::KERNEL_TABLE.bits(),
                });
            } else {
                entry.addr()
            };
            table = next;
            level = match level.lower(mode) {
                Some(lower) => lower,
                None => break,
            };
        }

        Ok((table, level.index(addr, mode)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_accessors() {
        let entry = PageTableEntry::new(
            PhysicalAddress::new(0x1234_5000),
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        );
        assert!(entry.is_present());
        assert!(!entry.is_huge());
        assert_eq!(entry.addr(), PhysicalAddress::new(0x1234_5000));
        assert!(entry.flags().contains(PageFlags::NO_EXECUTE));
        assert_eq!(entry.frame(), Some(FrameNumber::new(0x12345)));
        assert!(PageTableEntry::empty().is_unused());
    }

    #[test]
    fn test_level_geometry() {
        let four = PagingMode::FourLevel;
        let five = PagingMode::FiveLevel;
        assert_eq!(PageTableLevel::Pte.size(four), 0x1000);
        assert_eq!(PageTableLevel::Pmd.size(four), 0x20_0000);
        assert_eq!(PageTableLevel::Pud.size(four), 0x4000_0000);
        assert_eq!(PageTableLevel::Pgd.size(four), 1 << 39);
        assert_eq!(PageTableLevel::Pgd.size(five), 1 << 48);
        assert_eq!(PageTableLevel::P4d.folded(four), PageTableLevel::Pgd);
        assert_eq!(PageTableLevel::P4d.folded(five), PageTableLevel::P4d);
        assert_eq!(PageTableLevel::Pgd.lower(four), Some(PageTableLevel::Pud));
        assert_eq!(PageTableLevel::Pgd.lower(five), Some(PageTableLevel::P4d));
        assert_eq!(PageTableLevel::Pmd.index(0x40_0000, four), 2);
    }

    #[test]
    fn test_map_and_translate_4k() {
        let mem = PhysMemory::new(PagingMode::FourLevel);
        let mut mapper = PageMapper::create(&mem).unwrap();
        let va = VirtualAddress::new(0xffff_8880_0010_0000);
        mapper
            .map_page(va, PhysicalAddress::new(0x7000_0000), PageFlags::KERNEL_DATA)
            .unwrap();

        let t = translate(&mem, mapper.root(), va.add(0x123)).unwrap();
        assert_eq!(t.phys, PhysicalAddress::new(0x7000_0123));
        assert_eq!(t.level, PageTableLevel::Pte);
        assert!(translate(&mem, mapper.root(), va.add(0x1000)).is_none());
    }

    #[test]
    fn test_map_and_translate_huge() {
        let mem = PhysMemory::new(PagingMode::FourLevel);
        let mut mapper = PageMapper::create(&mem).unwrap();
        let va = VirtualAddress::new(0xffff_ffff_8000_0000);
        mapper
            .map_huge(
                va,
                PhysicalAddress::new(0x0100_0000),
                PageTableLevel::Pmd,
                PageFlags::KERNEL_TEXT,
            )
            .unwrap();

        let t = translate(&mem, mapper.root(), va.add(0x3_4567)).unwrap();
        assert_eq!(t.phys, PhysicalAddress::new(0x0103_4567));
        assert_eq!(t.level, PageTableLevel::Pmd);
        assert!(t.entry.is_huge());
    }

    #[test]
    fn test_huge_page_misaligned() {
        let mem = PhysMemory::new(PagingMode::FourLevel);
        let mut mapper = PageMapper::create(&mem).unwrap();
        assert!(mapper
            .map_huge(
                VirtualAddress::new(0x1000),
                PhysicalAddress::new(0),
                PageTableLevel::Pmd,
                PageFlags::KERNEL_DATA,
            )
            .is_err());
    }

    #[test]
    fn test_double_map_rejected() {
        let mem = PhysMemory::new(PagingMode::FourLevel);
        let mut mapper = PageMapper::create(&mem).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        mapper
            .map_page(va, PhysicalAddress::new(0x9000), PageFlags::KERNEL_DATA)
            .unwrap();
        assert!(matches!(
            mapper.map_page(va, PhysicalAddress::new(0xa000), PageFlags::KERNEL_DATA),
            Err(KernelError::AlreadyMapped { .. })
        ));
    }

    #[test]
    fn test_unmap_page() {
        let mem = PhysMemory::new(PagingMode::FiveLevel);
        let mut mapper = PageMapper::create(&mem).unwrap();
        let va = VirtualAddress::new(0x7f00_0000_0000);
        mapper
            .map_page(va, PhysicalAddress::new(0x5000), PageFlags::KERNEL_DATA)
            .unwrap();
        assert_eq!(mapper.unmap_page(va), Ok(PhysicalAddress::new(0x5000)));
        assert!(translate(&mem, mapper.root(), va).is_none());
        assert!(mapper.unmap_page(va).is_err());
    }

    #[test]
    fn test_lookup_entry_levels() {
        let mem = PhysMemory::new(PagingMode::FourLevel);
        let mut mapper = PageMapper::create(&mem).unwrap();
        let va = VirtualAddress::new(0x8000_0000);
        mapper
            .map_page(va, PhysicalAddress::new(0x5000), PageFlags::KERNEL_DATA)
            .unwrap();
        let pmd = lookup_entry(&mem, mapper.root(), va, PageTableLevel::Pmd).unwrap();
        assert!(pmd.is_present());
        assert!(!pmd.is_huge());
        let pte = lookup_entry(&mem, mapper.root(), va, PageTableLevel::Pte).unwrap();
        assert_eq!(pte.addr(), PhysicalAddress::new(0x5000));
    }
}
