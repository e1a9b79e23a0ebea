//! Common test utilities for the ASI scenario tests
//!
//! [`Machine`] builds a kernel page table covering a small kernel image,
//! the cpu entry area, a module and a data region, plus a set of CPUs
//! running on it.

#![allow(dead_code)]

use std::sync::Arc;

use asi_kernel::{
    asi::{symbols::KernelSymbolTable, Asi, AsiTypeRegistry, KernelLayout, ASI_PGTABLE_MASK},
    mm::{Dpt, PageMapper, PagingMode, PhysMemory, PhysicalAddress, VirtualAddress, PAGE_SIZE},
    mm::PageFlags,
    sched::{Cpu, PerCpuLayout, Task},
};

pub const IMAGE: u64 = 0xffff_ffff_8100_0000;
pub const IMAGE_PAGES: usize = 16;
pub const CPU_ENTRY_AREA: u64 = 0xffff_fe00_0000_0000;
pub const MODULE: u64 = 0xffff_ffff_c000_0000;
pub const MODULE_PAGES: usize = 8;
pub const DATA: u64 = 0xffff_8880_1000_0000;
pub const DATA_PAGES: usize = 512;

/// Physical memory backing the mapped regions. Never allocated, only
/// pointed at.
pub const DATA_PHYS: u64 = 0x4000_0000;
pub const IMAGE_PHYS: u64 = 0x0100_0000;
pub const MODULE_PHYS: u64 = 0x0200_0000;

/// Offset between per-CPU areas
pub const PERCPU_STRIDE: u64 = 0x1000;

/// Kernel PCID used when PCIDs are enabled
pub const KERNEL_PCID: u64 = 1;

pub struct Machine {
    pub mem: Arc<PhysMemory>,
    pub kernel_root: PhysicalAddress,
    pub registry: AsiTypeRegistry,
    pub cpus: Vec<Cpu>,
    pub layout: KernelLayout,
}

impl Machine {
    pub fn new(nr_cpus: usize, pcid: bool) -> Self {
        let mem = Arc::new(PhysMemory::new(PagingMode::FourLevel));
        let kernel_root = {
            let mut mapper = PageMapper::create(&mem).expect("kernel root");
            mapper
                .map_pages(
                    VirtualAddress::new(IMAGE),
                    PhysicalAddress::new(IMAGE_PHYS),
                    IMAGE_PAGES,
                    PageFlags::KERNEL_TEXT,
                )
                .expect("kernel image");
            mapper
                .map_pages(
                    VirtualAddress::new(CPU_ENTRY_AREA),
                    PhysicalAddress::new(DATA_PHYS + 0x100_0000),
                    4,
                    PageFlags::KERNEL_DATA,
                )
                .expect("cpu entry area");
            mapper
                .map_pages(
                    VirtualAddress::new(MODULE),
                    PhysicalAddress::new(MODULE_PHYS),
                    MODULE_PAGES,
                    PageFlags::KERNEL_TEXT,
                )
                .expect("module");
            mapper
                .map_pages(
                    VirtualAddress::new(DATA),
                    PhysicalAddress::new(DATA_PHYS),
                    DATA_PAGES,
                    PageFlags::KERNEL_DATA,
                )
                .expect("data");
            mapper.root()
        };

        let kernel_cr3 = kernel_root.as_u64() | if pcid { KERNEL_PCID } else { 0 };
        let cpus = (0..nr_cpus)
            .map(|id| Cpu::with_soft_cr3(id, kernel_cr3, pcid))
            .collect();

        let offsets = (0..nr_cpus as u64).map(|cpu| cpu * PERCPU_STRIDE).collect();
        let layout = KernelLayout {
            image_start: VirtualAddress::new(IMAGE),
            image_size: IMAGE_PAGES * PAGE_SIZE,
            cpu_entry_area: VirtualAddress::new(CPU_ENTRY_AREA),
            percpu: PerCpuLayout::new(offsets),
            percpu_vars: vec![(data(0x1f0_000), 64)],
        };

        Self {
            mem,
            kernel_root,
            registry: AsiTypeRegistry::with_predefined(nr_cpus).expect("asi types"),
            cpus,
            layout,
        }
    }

    pub fn kernel_cr3(&self) -> u64 {
        self.cpus[0].read_cr3()
    }

    /// Empty decorated page table on top of the kernel page table
    pub fn dpt(&self) -> Dpt {
        Dpt::create(self.mem.clone(), self.kernel_root, ASI_PGTABLE_MASK as usize)
            .expect("dpt")
    }

    /// ASI of type `type_name` using `dpt`
    pub fn asi(&self, type_name: &str, dpt: &Dpt) -> Arc<Asi> {
        let asi_type = self.registry.get(type_name).expect("asi type");
        let mut asi = Asi::create(&asi_type);
        asi.set_dpt(dpt).expect("pagetable");
        Arc::new(asi)
    }

    /// A task whose struct and stack live in the data region
    pub fn task(&self, slot: u64, cpu: usize) -> Task {
        Task::new(data(0x100_000 + slot * 0x10_000), data(0x108_000 + slot * 0x10_000), cpu)
    }
}

pub fn data(offset: u64) -> VirtualAddress {
    VirtualAddress::new(DATA + offset)
}

pub fn module(offset: u64) -> VirtualAddress {
    VirtualAddress::new(MODULE + offset)
}

/// Symbols for the module text: `asidrv_mem_run` spans two pages
pub fn module_symbols() -> KernelSymbolTable {
    let mut symbols = KernelSymbolTable::new();
    symbols.add_text(VirtualAddress::new(IMAGE), IMAGE_PAGES * PAGE_SIZE);
    symbols.add_text(VirtualAddress::new(MODULE), MODULE_PAGES * PAGE_SIZE);
    symbols.add_symbol("schedule", VirtualAddress::new(IMAGE + 0x2000), 0x400);
    symbols.add_module_symbol("asidrv", "asidrv_ioctl", module(0), 0x800);
    symbols.add_module_symbol("asidrv", "asidrv_mem_run", module(0x1000), 0x1800);
    symbols.add_module_symbol("asidrv", "asidrv_nmi_handler", module(0x3000), 0x200);
    symbols.add_dynamic_symbol("bpf_prog_7", module(0x5000), 0x100);
    symbols
}
