//! Page-table copy and clear walkers
//!
//! The copy walk descends the source table and the decorated table in
//! lockstep, allocating decorated tables on demand and copying entries
//! verbatim once it reaches the requested level. The clear walk is its
//! mirror image. Both only ever write into tables recorded as backend pages
//! (the root excepted).

use log::{debug, error, warn};

use super::backend::BackendPages;
use crate::{
    error::{KernelError, KernelResult},
    mm::{
        align_down,
        frame_allocator::PhysMemory,
        page_table::{is_leaf, PageTableEntry, PageTableLevel, PagingMode},
        PageFlags, PhysicalAddress, PAGE_MASK,
    },
};

/// End of the entry containing `addr`, clamped to `end`
fn entry_end(addr: u64, end: u64, span: u64) -> u64 {
    match align_down(addr, span).checked_add(span) {
        Some(boundary) if boundary < end => boundary,
        _ => end,
    }
}

/// Walk state borrowed from a locked decorated page table
pub(super) struct Walker<'a> {
    mem: &'a PhysMemory,
    backend: &'a mut BackendPages,
    mode: PagingMode,
}

impl<'a> Walker<'a> {
    pub(super) fn new(mem: &'a PhysMemory, backend: &'a mut BackendPages) -> Self {
        Self {
            mem,
            backend,
            mode: mem.mode(),
        }
    }

    fn read(&self, table: PhysicalAddress, index: usize) -> PageTableEntry {
        PageTableEntry::from_raw(self.mem.read_entry(table, index))
    }

    /// Copy `[addr, end)` from `src_root` into `dst_root` at `target` level
    pub(super) fn copy_range(
        &mut self,
        dst_root: PhysicalAddress,
        src_root: PhysicalAddress,
        addr: u64,
        end: u64,
        target: PageTableLevel,
    ) -> KernelResult<()> {
        let target = target.folded(self.mode);
        self.copy_level(dst_root, src_root, PageTableLevel::Pgd, addr, end, target)
    }

    fn copy_level(
        &mut self,
        dst_table: PhysicalAddress,
        src_table: PhysicalAddress,
        level: PageTableLevel,
        mut addr: u64,
        end: u64,
        target: PageTableLevel,
    ) -> KernelResult<()> {
        let span = level.size(self.mode);

        while addr < end {
            let next = entry_end(addr, end, span);
            let index = level.index(addr, self.mode);
            let src = self.read(src_table, index);

            if level == target
                || src.is_unused()
                || is_leaf(src, level)
                || (level.supports_huge() && src.is_devmap())
            {
                self.set_entry(dst_table, index, src, level, addr)?;
            } else if !src.is_present() {
                warn!(
                    target: "dpt",
                    "{} not present for [{:#x},{:#x}]",
                    level,
                    addr,
                    next - 1
                );
            } else if let Some(lower) = level.lower(self.mode) {
                let dst_child = self.child_table(dst_table, index, level, lower, addr)?;
                self.copy_level(dst_child, src.addr(), lower, addr, next, target)
                    .map_err(|err| {
                        error!(
                            target: "dpt",
                            "{} error copying {} addr={:#x} next={:#x}",
                            level,
                            lower,
                            addr,
                            next
                        );
                        err
                    })?;
            }

            addr = next;
        }

        Ok(())
    }

    /// Write `value` into an entry, refusing to replace a different entry
    fn set_entry(
        &mut self,
        table: PhysicalAddress,
        index: usize,
        value: PageTableEntry,
        level: PageTableLevel,
        addr: u64,
    ) -> KernelResult<()> {
        let current = self.read(table, index);
        if current == value {
            return Ok(());
        }
        if !current.is_unused() {
            error!(
                target: "dpt",
                "{} for {:#x} overwriting {:#x} with {:#x}",
                level,
                addr,
                current.raw(),
                value.raw()
            );
            return Err(KernelError::Conflict {
                addr,
                current: current.raw(),
                new: value.raw(),
            });
        }
        self.mem.write_entry(table, index, value.raw())?;
        Ok(())
    }

    /// Return the decorated child table below `table[index]`, allocating it
    /// when the entry is empty.
    fn child_table(
        &mut self,
        table: PhysicalAddress,
        index: usize,
        level: PageTableLevel,
        child_level: PageTableLevel,
        addr: u64,
    ) -> KernelResult<PhysicalAddress> {
        let entry = self.read(table, index);

        if entry.is_unused() {
            let page = self.mem.allocate_frame()?;
            if let Err(err) = self.backend.add(page, child_level) {
                self.mem.free_frame(page)?;
                return Err(err);
            }
            self.mem.write_entry(
                table,
                index,
                PageTableEntry::new(page, PageFlags::KERNEL_TABLE).raw(),
            )?;
            debug!(target: "dpt", "new {} table {:#x} for {:#x}", child_level, page, addr);
            return Ok(page);
        }

        if !entry.is_present() || is_leaf(entry, level) {
            error!(
                target: "dpt",
                "{} for {:#x} is {:#x}, not a table",
                level,
                addr,
                entry.raw()
            );
            return Err(KernelError::Conflict {
                addr,
                current: entry.raw(),
                new: PageFlags::KERNEL_TABLE.bits(),
            });
        }

        let child = entry.addr();
        if !self.backend.is_owned(child) {
            error!(target: "dpt", "{} {:#x} not found", child_level, child);
            return Err(KernelError::NotFound {
                resource: "backend page",
                id: child.as_u64(),
            });
        }
        Ok(child)
    }

    /// Clear `[addr, end)` at `target` level, releasing decorated tables
    /// that end up empty.
    pub(super) fn clear_range(
        &mut self,
        root: PhysicalAddress,
        addr: u64,
        end: u64,
        target: PageTableLevel,
    ) -> KernelResult<()> {
        let target = target.folded(self.mode);
        self.clear_level(root, PageTableLevel::Pgd, addr, end, target)
    }

    fn clear_level(
        &mut self,
        table: PhysicalAddress,
        level: PageTableLevel,
        mut addr: u64,
        end: u64,
        target: PageTableLevel,
    ) -> KernelResult<()> {
        let span = level.size(self.mode);

        while addr < end {
            let next = entry_end(addr, end, span);
            let index = level.index(addr, self.mode);
            let entry = self.read(table, index);

            if entry.is_unused() {
                addr = next;
                continue;
            }

            if level == target
                || !entry.is_present()
                || is_leaf(entry, level)
                || (level.supports_huge() && entry.is_devmap())
            {
                self.mem.write_entry(table, index, 0)?;
            } else if let Some(lower) = level.lower(self.mode) {
                let child = entry.addr();
                if !self.backend.is_owned(child) {
                    error!(target: "dpt", "{} {:#x} not found", lower, child);
                } else {
                    self.clear_level(child, lower, addr, next, target)?;
                    if self.mem.is_table_empty(child) {
                        self.backend.remove(child);
                        self.mem.free_frame(child)?;
                        self.mem.write_entry(table, index, 0)?;
                        debug!(target: "dpt", "released {} table {:#x}", lower, child);
                    }
                }
            }

            addr = next;
        }

        Ok(())
    }

    /// Copy the single 4 KiB translation of `addr` from `src_root` into
    /// `dst_root`.
    ///
    /// A huge source mapping is narrowed to a 4 KiB entry for the page
    /// containing `addr`, keeping the huge entry's protection bits.
    pub(super) fn clone_page(
        &mut self,
        dst_root: PhysicalAddress,
        src_root: PhysicalAddress,
        addr: u64,
    ) -> KernelResult<PageTableEntry> {
        let value = self.source_pte(src_root, addr)?;

        let mut table = dst_root;
        let mut level = PageTableLevel::Pgd;
        while let Some(lower) = level.lower(self.mode) {
            let index = level.index(addr, self.mode);
            table = self.child_table(table, index, level, lower, addr)?;
            level = lower;
        }

        let index = level.index(addr, self.mode);
        self.set_entry(table, index, value, level, addr)?;
        Ok(value)
    }

    /// Leaf entry mapping the page of `addr` in the source table
    fn source_pte(&self, root: PhysicalAddress, addr: u64) -> KernelResult<PageTableEntry> {
        let mut table = root;
        let mut level = PageTableLevel::Pgd;

        loop {
            let entry = self.read(table, level.index(addr, self.mode));
            if !entry.is_present() {
                return Err(KernelError::UnmappedMemory { addr });
            }
            if level == PageTableLevel::Pte {
                return Ok(entry);
            }
            if is_leaf(entry, level) {
                let span = level.size(self.mode);
                let base = entry.addr().as_u64() & !(span - 1);
                let frame = PhysicalAddress::new(base + (addr & (span - 1) & PAGE_MASK));
                let flags = entry.flags() - PageFlags::HUGE;
                return Ok(PageTableEntry::new(frame, flags));
            }
            table = entry.addr();
            level = level
                .lower(self.mode)
                .ok_or(KernelError::UnmappedMemory { addr })?;
        }
    }
}
