//! Decorated page tables
//!
//! A decorated page table (DPT) is an isolated page table built by copying
//! selected virtual ranges out of the kernel page table, together with the
//! bookkeeping needed to mutate it safely: the ledger of mapped ranges and
//! the set of pages the table owns.
//!
//! Ranges are copied at a caller-chosen level. Copying at PMD level, for
//! example, shares the source's PTE tables instead of duplicating them,
//! and materializes the whole 2 MiB around the requested range. Overlapping
//! requests are reference counted on their rounded spans, and an unmap only
//! clears the chunks no surviving range still covers.

extern crate alloc;

mod backend;
mod range;
mod walk;

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error};
use spin::Mutex;

pub use backend::BackendPages;
pub use range::RangeMapping;
use walk::Walker;

use super::{
    frame_allocator::PhysMemory,
    page_table::{PageTableEntry, PageTableLevel, PagingMode},
    PhysicalAddress, VirtualAddress, PAGE_SIZE,
};
use crate::{
    error::{KernelError, KernelResult},
    sched::smp::PerCpuLayout,
};

/// Generation counter of a page table.
///
/// Bumped on every change of the table. Clones share the counter, which is
/// how an ASI bound to a DPT notices that its cached translations are stale.
#[derive(Debug, Clone, Default)]
pub struct PageTableGeneration(Arc<AtomicU64>);

impl PageTableGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance the counter, returning the new generation
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Mutable state guarded by the DPT lock
struct DptInner {
    /// Most recent mapping last
    ranges: Vec<RangeMapping>,
    backend: BackendPages,
}

/// Decorated page table
pub struct Dpt {
    mem: Arc<PhysMemory>,
    /// Root of the page table the ranges are copied from
    source: PhysicalAddress,
    inner: Mutex<DptInner>,
    generation: PageTableGeneration,
    pagetable: PhysicalAddress,
    alignment: usize,
    block: PhysicalAddress,
    block_frames: usize,
}

impl Dpt {
    /// Create an empty decorated page table copying from `source`.
    ///
    /// `alignment` must be zero or a power-of-two multiple of the page size.
    /// The root is the last page of a naturally aligned block of
    /// `max(alignment, 2 * PAGE_SIZE)` bytes, so its physical address is
    /// aligned to `PAGE_SIZE` but never to `2 * PAGE_SIZE`.
    pub fn create(
        mem: Arc<PhysMemory>,
        source: PhysicalAddress,
        alignment: usize,
    ) -> KernelResult<Self> {
        if alignment % PAGE_SIZE != 0 || (alignment != 0 && !alignment.is_power_of_two()) {
            return Err(KernelError::InvalidArgument {
                name: "pagetable alignment",
                value: alignment as u64,
            });
        }

        let block_size = alignment.max(2 * PAGE_SIZE);
        let block_frames = block_size / PAGE_SIZE;
        let block = mem.allocate_frames(block_frames, block_frames)?;
        let pagetable = PhysicalAddress::new(block.as_u64() + (block_size - PAGE_SIZE) as u64);

        debug!(
            target: "dpt",
            "created DPT {:#x} (alignment {:#x}, source {:#x})",
            pagetable,
            alignment,
            source
        );

        Ok(Self {
            mem,
            source,
            inner: Mutex::new(DptInner {
                ranges: Vec::new(),
                backend: BackendPages::new(),
            }),
            generation: PageTableGeneration::new(),
            pagetable,
            alignment,
            block,
            block_frames,
        })
    }

    /// Physical address of the root table
    pub fn pagetable(&self) -> PhysicalAddress {
        self.pagetable
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Root of the page table mappings are copied from
    pub fn source(&self) -> PhysicalAddress {
        self.source
    }

    pub fn memory(&self) -> &Arc<PhysMemory> {
        &self.mem
    }

    pub fn generation(&self) -> &PageTableGeneration {
        &self.generation
    }

    /// Map `[ptr, ptr + size)` at `level` granularity.
    ///
    /// Fails with `AlreadyMapped` if the exact same range is already in the
    /// ledger. Every existing range whose rounded span intersects the new
    /// one gets its reference count bumped; the copy is skipped when an
    /// existing range already covers the new rounded span.
    pub fn map_range(
        &self,
        ptr: VirtualAddress,
        size: usize,
        level: PageTableLevel,
    ) -> KernelResult<()> {
        if size == 0 {
            return Err(KernelError::InvalidArgument {
                name: "range size",
                value: 0,
            });
        }
        if ptr.as_u64().checked_add(size as u64).is_none() {
            return Err(KernelError::InvalidArgument {
                name: "range end",
                value: ptr.as_u64(),
            });
        }

        let mode = self.mem.mode();
        let mapping = RangeMapping::new(ptr, size, level);
        let (map_addr, map_end) = (mapping.map_addr(mode), mapping.map_end(mode));
        debug!(
            target: "dpt",
            "MAP {} -> {:#x}-{:#x}",
            mapping,
            map_addr,
            map_end
        );

        let mut inner = self.inner.lock();
        let DptInner { ranges, backend } = &mut *inner;

        if ranges.iter().any(|r| r.ptr == ptr && r.size == size) {
            debug!(target: "dpt", "MAP {} already mapped", mapping);
            return Err(KernelError::AlreadyMapped {
                addr: ptr.as_u64(),
                size: size as u64,
            });
        }

        let mut need_mapping = true;
        for r in ranges.iter().filter(|r| r.overlaps(ptr.as_u64(), mapping.end(), mode)) {
            debug!(target: "dpt", "MAP {} overlaps with {}", mapping, r);
            if r.covers(ptr.as_u64(), mapping.end(), mode) {
                need_mapping = false;
            }
        }

        if need_mapping {
            Walker::new(&self.mem, backend).copy_range(
                self.pagetable,
                self.source,
                map_addr,
                map_end,
                level,
            )?;
        } else {
            debug!(target: "dpt", "MAP {} implicitly mapped", mapping);
        }

        record_range(ranges, mapping, mode);
        self.generation.bump();

        Ok(())
    }

    /// Map `[ptr, ptr + size)` at PTE granularity
    pub fn map(&self, ptr: VirtualAddress, size: usize) -> KernelResult<()> {
        self.map_range(ptr, size, PageTableLevel::Pte)
    }

    /// Remove the range starting at `ptr` and clear the parts of its span
    /// no other range covers. Unknown pointers are ignored.
    pub fn unmap(&self, ptr: VirtualAddress) {
        let mode = self.mem.mode();
        let mut inner = self.inner.lock();
        let DptInner { ranges, backend } = &mut *inner;

        let Some(pos) = ranges.iter().rposition(|r| r.ptr == ptr) else {
            debug!(target: "dpt", "UNMAP {:#x} - not mapped", ptr);
            return;
        };
        let range = ranges.remove(pos);
        debug!(target: "dpt", "UNMAP {}", range);
        self.generation.bump();

        for r in ranges
            .iter_mut()
            .filter(|r| r.overlaps(range.ptr.as_u64(), range.end(), mode))
        {
            r.refcnt = r.refcnt.saturating_sub(1);
        }

        let (addr, end) = (range.map_addr(mode), range.map_end(mode));
        let chunk = range.level.folded(mode).size(mode);
        let mut walker = Walker::new(&self.mem, backend);
        let mut chunk_addr = addr;
        while chunk_addr < end {
            let chunk_end = chunk_addr.saturating_add(chunk).min(end);
            match ranges.iter().find(|r| r.overlaps(chunk_addr, chunk_end, mode)) {
                Some(r) => {
                    debug!(target: "dpt", "UNMAP {} overlaps with {}", range, r);
                }
                None => {
                    debug!(
                        target: "dpt",
                        "UNMAP CHUNK {:#x}/{:#x}/{}",
                        chunk_addr,
                        chunk,
                        range.level
                    );
                    if let Err(err) =
                        walker.clear_range(self.pagetable, chunk_addr, chunk_end, range.level)
                    {
                        error!(target: "dpt", "UNMAP {} failed: {}", range, err);
                    }
                }
            }
            chunk_addr = chunk_end;
        }
    }

    /// Map the instance of a per-CPU variable of every possible CPU.
    ///
    /// On failure the instances mapped by this call are unmapped again.
    pub fn map_percpu(
        &self,
        layout: &PerCpuLayout,
        percpu_ptr: VirtualAddress,
        size: usize,
    ) -> KernelResult<()> {
        debug!(target: "dpt", "MAP PERCPU {:#x}", percpu_ptr);
        let mut mapped = Vec::with_capacity(layout.possible_cpus());
        for (cpu, ptr) in layout.per_cpu_ptrs(percpu_ptr).enumerate() {
            debug!(target: "dpt", "MAP PERCPU{} {:#x}", cpu, ptr);
            if let Err(err) = self.map(ptr, size) {
                for ptr in mapped {
                    self.unmap(ptr);
                }
                return Err(err);
            }
            mapped.push(ptr);
        }
        Ok(())
    }

    /// Unmap the instance of a per-CPU variable of every possible CPU
    pub fn unmap_percpu(&self, layout: &PerCpuLayout, percpu_ptr: VirtualAddress) {
        debug!(target: "dpt", "UNMAP PERCPU {:#x}", percpu_ptr);
        for ptr in layout.per_cpu_ptrs(percpu_ptr) {
            self.unmap(ptr);
        }
    }

    /// Move a mapping held in `slot` to `new_ptr`.
    ///
    /// The slot is cleared as soon as the old range is unmapped and only
    /// set again once `new_ptr` is mapped.
    pub fn remap(
        &self,
        slot: &mut Option<VirtualAddress>,
        new_ptr: VirtualAddress,
        size: usize,
    ) -> KernelResult<()> {
        if *slot == Some(new_ptr) {
            return Ok(());
        }
        if let Some(current) = slot.take() {
            self.unmap(current);
        }
        self.map(new_ptr, size)?;
        *slot = Some(new_ptr);
        Ok(())
    }

    /// Whether `addr` lies in the rounded span of any mapped range
    pub fn search_range_mapping(&self, addr: VirtualAddress) -> bool {
        let mode = self.mem.mode();
        self.inner
            .lock()
            .ranges
            .iter()
            .any(|r| r.contains(addr.as_u64(), mode))
    }

    /// Whether the page containing `offset` is a page-table page owned by
    /// this DPT
    pub fn is_backend_page(&self, offset: PhysicalAddress) -> bool {
        self.inner.lock().backend.is_owned(offset)
    }

    pub fn backend_pages_count(&self) -> usize {
        self.inner.lock().backend.len()
    }

    /// Snapshot of the range ledger, oldest first
    pub fn mappings(&self) -> Vec<RangeMapping> {
        self.inner.lock().ranges.clone()
    }

    /// Copy the single page containing `addr` from the source table.
    ///
    /// The page is recorded in the range ledger as a PTE-level range, so it
    /// can be listed and unmapped like any other mapping.
    pub fn clone_page(&self, addr: VirtualAddress) -> KernelResult<PageTableEntry> {
        let mode = self.mem.mode();
        let page = addr.page_align_down();
        let mut inner = self.inner.lock();
        let DptInner { ranges, backend } = &mut *inner;

        let entry =
            Walker::new(&self.mem, backend).clone_page(self.pagetable, self.source, addr.as_u64())?;
        if !ranges.iter().any(|r| r.ptr == page && r.size == PAGE_SIZE) {
            let mapping = RangeMapping::new(page, PAGE_SIZE, PageTableLevel::Pte);
            debug!(target: "dpt", "CLONE {}", mapping);
            record_range(ranges, mapping, mode);
        }
        self.generation.bump();
        Ok(entry)
    }

    /// Destroy the table, releasing every page it owns
    pub fn destroy(self) {
        drop(self);
    }
}

/// Add `mapping` to the ledger, counting the ranges its span overlaps
fn record_range(ranges: &mut Vec<RangeMapping>, mut mapping: RangeMapping, mode: PagingMode) {
    let (ptr, end) = (mapping.ptr.as_u64(), mapping.end());
    for r in ranges.iter_mut().filter(|r| r.overlaps(ptr, end, mode)) {
        r.refcnt += 1;
        mapping.refcnt += 1;
    }
    ranges.push(mapping);
}

impl Drop for Dpt {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (page, level) in inner.backend.drain() {
            if let Err(err) = self.mem.free_frame(page) {
                error!(target: "dpt", "failed to free {} page {:#x}: {:?}", level, page, err);
            }
        }
        inner.ranges.clear();
        if let Err(err) = self.mem.free_frames(self.block, self.block_frames) {
            error!(target: "dpt", "failed to free DPT {:#x}: {:?}", self.pagetable, err);
        }
        debug!(target: "dpt", "destroyed DPT {:#x}", self.pagetable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{
        page_table::{translate, PageMapper, PagingMode},
        PageFlags,
    };

    const BUF: u64 = 0xffff_8880_0040_0000;

    fn setup() -> (Arc<PhysMemory>, PhysicalAddress) {
        let mem = Arc::new(PhysMemory::new(PagingMode::FourLevel));
        let root = {
            let mut mapper = PageMapper::create(&mem).unwrap();
            mapper
                .map_pages(
                    VirtualAddress::new(BUF),
                    PhysicalAddress::new(0x8000_0000),
                    1024,
                    PageFlags::KERNEL_DATA,
                )
                .unwrap();
            mapper.root()
        };
        (mem, root)
    }

    #[test]
    fn test_create_alignment() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem.clone(), root, 8192).unwrap();
        assert_eq!(dpt.pagetable().as_u64() & 0x1000, 0x1000);
        assert_eq!(dpt.pagetable().as_u64() % 4096, 0);

        let dpt = Dpt::create(mem.clone(), root, 0x4000).unwrap();
        assert_eq!(dpt.pagetable().as_u64() & 0x1000, 0x1000);

        assert!(Dpt::create(mem.clone(), root, 100).is_err());
        assert!(Dpt::create(mem, root, 3 * 4096).is_err());
    }

    #[test]
    fn test_destroy_frees_everything() {
        let (mem, root) = setup();
        let before = mem.allocated_frames();
        let dpt = Dpt::create(mem.clone(), root, 8192).unwrap();
        dpt.map(VirtualAddress::new(BUF), 0x3000).unwrap();
        assert!(dpt.backend_pages_count() > 0);
        dpt.destroy();
        assert_eq!(mem.allocated_frames(), before);
    }

    #[test]
    fn test_map_search_boundaries() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem, root, 8192).unwrap();
        dpt.map(VirtualAddress::new(BUF + 0x1010), 0x20).unwrap();

        assert!(!dpt.search_range_mapping(VirtualAddress::new(BUF + 0xfff)));
        assert!(dpt.search_range_mapping(VirtualAddress::new(BUF + 0x1000)));
        assert!(dpt.search_range_mapping(VirtualAddress::new(BUF + 0x1fff)));
        assert!(!dpt.search_range_mapping(VirtualAddress::new(BUF + 0x2000)));
    }

    #[test]
    fn test_map_zero_size_rejected() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem, root, 8192).unwrap();
        assert!(matches!(
            dpt.map(VirtualAddress::new(BUF), 0),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_duplicate_and_overlap() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem, root, 8192).unwrap();
        dpt.map(VirtualAddress::new(BUF), 0x2000).unwrap();
        assert_eq!(
            dpt.map(VirtualAddress::new(BUF), 0x2000),
            Err(KernelError::AlreadyMapped {
                addr: BUF,
                size: 0x2000
            })
        );

        dpt.map(VirtualAddress::new(BUF + 0x1000), 0x2000).unwrap();
        let ranges = dpt.mappings();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].refcnt, 2);
        assert_eq!(ranges[1].refcnt, 2);

        dpt.map(VirtualAddress::new(BUF + 0x8000), 0x1000).unwrap();
        let ranges = dpt.mappings();
        assert_eq!(ranges[2].refcnt, 1);
        assert_eq!(ranges[0].refcnt, 2);
    }

    #[test]
    fn test_contained_range_skips_copy() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem.clone(), root, 8192).unwrap();
        dpt.map_range(VirtualAddress::new(BUF), 0x1000, PageTableLevel::Pmd)
            .unwrap();
        let pages = dpt.backend_pages_count();

        // Would fail descending into the shared PTE table if it were copied
        dpt.map(VirtualAddress::new(BUF + 0x5000), 0x1000).unwrap();
        assert_eq!(dpt.backend_pages_count(), pages);
        assert!(translate(&mem, dpt.pagetable(), VirtualAddress::new(BUF + 0x5000)).is_some());
    }

    #[test]
    fn test_round_trip_leaves_table_empty() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem.clone(), root, 8192).unwrap();
        dpt.map(VirtualAddress::new(BUF), 0x4000).unwrap();
        assert!(dpt.backend_pages_count() > 0);

        dpt.unmap(VirtualAddress::new(BUF));
        assert!(dpt.mappings().is_empty());
        assert_eq!(dpt.backend_pages_count(), 0);
        assert!(mem.is_table_empty(dpt.pagetable()));
    }

    #[test]
    fn test_unmap_subsumed_range_keeps_entries() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem.clone(), root, 8192).unwrap();
        dpt.map(VirtualAddress::new(BUF), 0x4000).unwrap();
        dpt.map(VirtualAddress::new(BUF + 0x1000), 0x1000).unwrap();

        dpt.unmap(VirtualAddress::new(BUF + 0x1000));
        let ranges = dpt.mappings();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].refcnt, 1);
        for page in 0..4 {
            let va = VirtualAddress::new(BUF + page * 0x1000);
            assert!(translate(&mem, dpt.pagetable(), va).is_some());
        }
    }

    #[test]
    fn test_unmap_partial_overlap_clears_only_uncovered_chunks() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem.clone(), root, 8192).unwrap();
        dpt.map(VirtualAddress::new(BUF), 0x2000).unwrap();
        dpt.map(VirtualAddress::new(BUF + 0x1000), 0x2000).unwrap();

        dpt.unmap(VirtualAddress::new(BUF));
        let pt = dpt.pagetable();
        assert!(translate(&mem, pt, VirtualAddress::new(BUF)).is_none());
        assert!(translate(&mem, pt, VirtualAddress::new(BUF + 0x1000)).is_some());
        assert!(translate(&mem, pt, VirtualAddress::new(BUF + 0x2000)).is_some());
    }

    #[test]
    fn test_unmap_unknown_is_noop() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem, root, 8192).unwrap();
        dpt.map(VirtualAddress::new(BUF), 0x1000).unwrap();
        dpt.unmap(VirtualAddress::new(BUF + 0x1000));
        assert_eq!(dpt.mappings().len(), 1);
    }

    #[test]
    fn test_remap() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem.clone(), root, 8192).unwrap();
        let mut slot = None;
        dpt.remap(&mut slot, VirtualAddress::new(BUF), 0x1000).unwrap();
        assert_eq!(slot, Some(VirtualAddress::new(BUF)));
        dpt.remap(&mut slot, VirtualAddress::new(BUF), 0x1000).unwrap();
        assert_eq!(dpt.mappings().len(), 1);

        dpt.remap(&mut slot, VirtualAddress::new(BUF + 0x10_0000), 0x1000)
            .unwrap();
        assert_eq!(slot, Some(VirtualAddress::new(BUF + 0x10_0000)));
        let ranges = dpt.mappings();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].ptr, VirtualAddress::new(BUF + 0x10_0000));
        assert!(translate(&mem, dpt.pagetable(), VirtualAddress::new(BUF)).is_none());
    }

    #[test]
    fn test_percpu_map_and_unmap() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem, root, 8192).unwrap();
        let layout = PerCpuLayout::new(alloc::vec![0, 0x8000, 0x10000]);

        dpt.map_percpu(&layout, VirtualAddress::new(BUF), 0x100).unwrap();
        assert_eq!(dpt.mappings().len(), 3);
        assert!(dpt.search_range_mapping(VirtualAddress::new(BUF + 0x10000)));

        dpt.unmap_percpu(&layout, VirtualAddress::new(BUF));
        assert!(dpt.mappings().is_empty());
        assert_eq!(dpt.backend_pages_count(), 0);
    }

    #[test]
    fn test_percpu_failure_rolls_back_own_mappings() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem, root, 8192).unwrap();
        let layout = PerCpuLayout::new(alloc::vec![0, 0x8000]);

        // The second CPU's instance is already mapped with the same size
        dpt.map(VirtualAddress::new(BUF + 0x8000), 0x100).unwrap();
        assert!(dpt
            .map_percpu(&layout, VirtualAddress::new(BUF), 0x100)
            .is_err());
        let ranges = dpt.mappings();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].ptr, VirtualAddress::new(BUF + 0x8000));
    }

    #[test]
    fn test_out_of_memory() {
        let mem = Arc::new(PhysMemory::with_frame_limit(PagingMode::FourLevel, 8));
        let root = {
            let mut mapper = PageMapper::create(&mem).unwrap();
            mapper
                .map_page(
                    VirtualAddress::new(BUF),
                    PhysicalAddress::new(0x8000_0000),
                    PageFlags::KERNEL_DATA,
                )
                .unwrap();
            mapper.root()
        };
        // 4 source frames + 2 for the DPT block leave room for 2 tables
        let dpt = Dpt::create(mem, root, 8192).unwrap();
        assert!(matches!(
            dpt.map(VirtualAddress::new(BUF), 0x1000),
            Err(KernelError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_clone_page_joins_ledger() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem.clone(), root, 8192).unwrap();
        let addr = VirtualAddress::new(BUF + 0x3123);

        dpt.clone_page(addr).unwrap();
        let ranges = dpt.mappings();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].ptr, VirtualAddress::new(BUF + 0x3000));
        assert_eq!(ranges[0].size, PAGE_SIZE);
        assert_eq!(ranges[0].level, PageTableLevel::Pte);
        assert!(dpt.search_range_mapping(addr));

        // A second clone of the same page is not recorded twice
        dpt.clone_page(addr).unwrap();
        assert_eq!(dpt.mappings().len(), 1);

        dpt.unmap(VirtualAddress::new(BUF + 0x3000));
        assert!(dpt.mappings().is_empty());
        assert!(translate(&mem, dpt.pagetable(), addr).is_none());
        assert_eq!(dpt.backend_pages_count(), 0);

        // The region can now be mapped at PMD level
        dpt.map_range(VirtualAddress::new(BUF), PAGE_SIZE, PageTableLevel::Pmd)
            .unwrap();
        assert!(translate(&mem, dpt.pagetable(), addr).is_some());
    }

    #[test]
    fn test_generation_follows_changes() {
        let (mem, root) = setup();
        let dpt = Dpt::create(mem, root, 8192).unwrap();
        let gen = dpt.generation().clone();
        assert_eq!(gen.get(), 0);

        dpt.map(VirtualAddress::new(BUF), 0x2000).unwrap();
        assert_eq!(gen.get(), 1);
        assert!(dpt.map(VirtualAddress::new(BUF), 0x2000).is_err());
        assert_eq!(gen.get(), 1);

        dpt.unmap(VirtualAddress::new(BUF));
        assert_eq!(gen.get(), 2);
        dpt.unmap(VirtualAddress::new(BUF));
        assert_eq!(gen.get(), 2);

        dpt.clone_page(VirtualAddress::new(BUF + 0x5000)).unwrap();
        assert_eq!(gen.get(), 3);
    }
}
