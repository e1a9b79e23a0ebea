//! Physical memory model and frame allocator
//!
//! Page tables (the kernel's own and every decorated page table) live in
//! page-sized frames indexed by physical address. [`PhysMemory`] owns those
//! frames: it hands out zeroed, optionally aligned, contiguous runs of
//! frames and lets page-table code read and write 64-bit entries inside
//! them.
//!
//! Freed single frames are recycled before the bump pointer advances.
//! Multi-frame requests always come from the bump pointer so that their
//! natural alignment can be honoured.

extern crate alloc;

use alloc::{
    boxed::Box,
    collections::{BTreeMap, BTreeSet},
};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{page_table::PagingMode, PhysicalAddress, PAGE_SHIFT, PAGE_SIZE};

/// Number of 64-bit entries in a frame used as a page table
pub const ENTRIES_PER_FRAME: usize = PAGE_SIZE / 8;

/// First frame handed out by the allocator (1 MiB)
const FIRST_FRAME: u64 = 0x100;

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(u64);

impl FrameNumber {
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn start_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }
}

/// Frame allocator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocatorError {
    /// Not enough frames left (counts are in frames)
    OutOfMemory { requested: usize, available: usize },
    /// The address is not the start of an allocated frame
    InvalidFrame { addr: u64 },
    /// Zero-sized request or non power-of-two alignment
    InvalidCount { count: usize },
}

/// Allocation statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub allocated_frames: usize,
    pub total_allocations: u64,
    pub total_frees: u64,
}

struct MemoryState {
    /// Backing storage keyed by frame number
    frames: BTreeMap<u64, Box<[u64; ENTRIES_PER_FRAME]>>,
    /// Recyclable single frames
    free_list: BTreeSet<u64>,
    next_frame: u64,
    frame_limit: Option<usize>,
}

impl MemoryState {
    fn available(&self) -> Option<usize> {
        self.frame_limit
            .map(|limit| limit.saturating_sub(self.frames.len()))
    }
}

/// Simulated physical memory holding page-table frames
pub struct PhysMemory {
    mode: PagingMode,
    state: Mutex<MemoryState>,
    total_allocations: AtomicU64,
    total_frees: AtomicU64,
}

impl PhysMemory {
    /// Create an unbounded physical memory using the given paging mode
    pub fn new(mode: PagingMode) -> Self {
        Self::build(mode, None)
    }

    /// Create a physical memory that can hold at most `limit` live frames
    pub fn with_frame_limit(mode: PagingMode, limit: usize) -> Self {
        Self::build(mode, Some(limit))
    }

    fn build(mode: PagingMode, frame_limit: Option<usize>) -> Self {
        Self {
            mode,
            state: Mutex::new(MemoryState {
                frames: BTreeMap::new(),
                free_list: BTreeSet::new(),
                next_frame: FIRST_FRAME,
                frame_limit,
            }),
            total_allocations: AtomicU64::new(0),
            total_frees: AtomicU64::new(0),
        }
    }

    /// Paging mode of the machine this memory belongs to
    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    /// Allocate one zeroed frame
    pub fn allocate_frame(&self) -> Result<PhysicalAddress, FrameAllocatorError> {
        self.allocate_frames(1, 1)
    }

    /// Allocate `count` zeroed, physically contiguous frames whose first
    /// frame number is a multiple of `align_frames`.
    pub fn allocate_frames(
        &self,
        count: usize,
        align_frames: usize,
    ) -> Result<PhysicalAddress, FrameAllocatorError> {
        if count == 0 {
            return Err(FrameAllocatorError::InvalidCount { count });
        }
        if align_frames == 0 || !align_frames.is_power_of_two() {
            return Err(FrameAllocatorError::InvalidCount {
                count: align_frames,
            });
        }

        let mut state = self.state.lock();
        if let Some(available) = state.available() {
            if available < count {
                return Err(FrameAllocatorError::OutOfMemory {
                    requested: count,
                    available,
                });
            }
        }

        let first = if count == 1 && align_frames == 1 {
            match state.free_list.pop_first() {
                Some(frame) => frame,
                None => Self::bump(&mut state, 1, 1),
            }
        } else {
            Self::bump(&mut state, count as u64, align_frames as u64)
        };

        for frame in first..first + count as u64 {
            state
                .frames
                .insert(frame, Box::new([0u64; ENTRIES_PER_FRAME]));
        }
        self.total_allocations.fetch_add(1, Ordering::Relaxed);

        Ok(FrameNumber::new(first).start_address())
    }

    fn bump(state: &mut MemoryState, count: u64, align: u64) -> u64 {
        let first = super::align_up(state.next_frame, align);
        state.next_frame = first + count;
        first
    }

    /// Free `count` frames starting at `addr`
    pub fn free_frames(&self, addr: PhysicalAddress, count: usize) -> Result<(), FrameAllocatorError> {
        if !addr.is_page_aligned() {
            return Err(FrameAllocatorError::InvalidFrame { addr: addr.as_u64() });
        }
        let first = addr.frame().as_u64();
        let mut state = self.state.lock();
        if (first..first + count as u64).any(|f| !state.frames.contains_key(&f)) {
            return Err(FrameAllocatorError::InvalidFrame { addr: addr.as_u64() });
        }
        for frame in first..first + count as u64 {
            state.frames.remove(&frame);
            state.free_list.insert(frame);
        }
        self.total_frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Free a single frame
    pub fn free_frame(&self, addr: PhysicalAddress) -> Result<(), FrameAllocatorError> {
        self.free_frames(addr, 1)
    }

    /// Whether the frame containing `addr` is currently allocated
    pub fn is_allocated(&self, addr: PhysicalAddress) -> bool {
        self.state.lock().frames.contains_key(&addr.frame().as_u64())
    }

    /// Read entry `index` of the table stored in frame `table`.
    ///
    /// Memory that was never allocated reads as zero.
    pub fn read_entry(&self, table: PhysicalAddress, index: usize) -> u64 {
        let state = self.state.lock();
        state
            .frames
            .get(&table.frame().as_u64())
            .map_or(0, |frame| frame[index % ENTRIES_PER_FRAME])
    }

    /// Write entry `index` of the table stored in frame `table`
    pub fn write_entry(
        &self,
        table: PhysicalAddress,
        index: usize,
        value: u64,
    ) -> Result<(), FrameAllocatorError> {
        let mut state = self.state.lock();
        match state.frames.get_mut(&table.frame().as_u64()) {
            Some(frame) => {
                frame[index % ENTRIES_PER_FRAME] = value;
                Ok(())
            }
            None => Err(FrameAllocatorError::InvalidFrame {
                addr: table.as_u64(),
            }),
        }
    }

    /// Whether every entry of the table in frame `table` is zero
    pub fn is_table_empty(&self, table: PhysicalAddress) -> bool {
        let state = self.state.lock();
        state
            .frames
            .get(&table.frame().as_u64())
            .map_or(true, |frame| frame.iter().all(|&e| e == 0))
    }

    /// Number of live frames
    pub fn allocated_frames(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Frames still available under the frame limit, if any
    pub fn available_frames(&self) -> Option<usize> {
        self.state.lock().available()
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            allocated_frames: self.allocated_frames(),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame_allocation_is_zeroed() {
        let mem = PhysMemory::new(PagingMode::FourLevel);
        let frame = mem.allocate_frame().unwrap();
        assert!(frame.is_page_aligned());
        assert!(mem.is_table_empty(frame));
        mem.write_entry(frame, 3, 0xdead_b003).unwrap();
        assert_eq!(mem.read_entry(frame, 3), 0xdead_b003);
        assert!(!mem.is_table_empty(frame));
    }

    #[test]
    fn test_aligned_contiguous_allocation() {
        let mem = PhysMemory::new(PagingMode::FourLevel);
        let _ = mem.allocate_frame().unwrap();
        let block = mem.allocate_frames(4, 4).unwrap();
        assert_eq!(block.as_u64() % (4 * PAGE_SIZE as u64), 0);
        for i in 0..4u64 {
            assert!(mem.is_allocated(PhysicalAddress::new(block.as_u64() + i * 4096)));
        }
    }

    #[test]
    fn test_free_and_recycle() {
        let mem = PhysMemory::new(PagingMode::FourLevel);
        let a = mem.allocate_frame().unwrap();
        mem.write_entry(a, 0, 1).unwrap();
        mem.free_frame(a).unwrap();
        assert!(!mem.is_allocated(a));
        assert_eq!(mem.allocated_frames(), 0);

        let b = mem.allocate_frame().unwrap();
        assert_eq!(a, b);
        assert_eq!(mem.read_entry(b, 0), 0);
    }

    #[test]
    fn test_double_free_rejected() {
        let mem = PhysMemory::new(PagingMode::FourLevel);
        let a = mem.allocate_frame().unwrap();
        mem.free_frame(a).unwrap();
        assert_eq!(
            mem.free_frame(a),
            Err(FrameAllocatorError::InvalidFrame { addr: a.as_u64() })
        );
    }

    #[test]
    fn test_frame_limit() {
        let mem = PhysMemory::with_frame_limit(PagingMode::FourLevel, 2);
        mem.allocate_frame().unwrap();
        mem.allocate_frame().unwrap();
        assert_eq!(
            mem.allocate_frame(),
            Err(FrameAllocatorError::OutOfMemory {
                requested: 1,
                available: 0
            })
        );
        assert_eq!(mem.available_frames(), Some(0));
    }

    #[test]
    fn test_write_to_unbacked_frame_fails() {
        let mem = PhysMemory::new(PagingMode::FourLevel);
        assert!(mem.write_entry(PhysicalAddress::new(0x5000), 0, 1).is_err());
        assert_eq!(mem.read_entry(PhysicalAddress::new(0x5000), 0), 0);
    }
}
