//! Address space isolation
//!
//! An ASI runs kernel code on a decorated page table instead of the full
//! kernel page table. Every ASI belongs to an [`AsiType`], which carries
//! the PCID prefix used to tag its CR3 values, the per-CPU TLB state used
//! to skip redundant flushes, and the policy applied when a fault happens
//! while the ASI is active.
//!
//! CR3 layout of an active ASI:
//!
//! ```text
//!   63         12  11          4  3        0
//!  +-------------+---------------+----------+
//!  | DPT address | type prefix   | kernel   |
//!  | (bit 12 set)|               | PCID     |
//!  +-------------+---------------+----------+
//! ```

extern crate alloc;

pub mod fault;
pub mod session;
pub mod symbols;

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use spin::Mutex;

use crate::{
    arch::X86_CR3_PCID_NOFLUSH,
    error::{KernelError, KernelResult},
    mm::{Dpt, PageTableGeneration, PageTableLevel, PhysicalAddress, VirtualAddress},
    sched::smp::PerCpuLayout,
};
pub use fault::{FaultLog, FaultLogEntry, FaultLogPolicy};
pub use session::{AsiSession, AsiState};

// ===========================================================================
// Constants
// ===========================================================================

pub const ASI_PCID_PREFIX_SHIFT: u32 = 4;
pub const ASI_PCID_PREFIX_MASK: u64 = 0xff0;
pub const ASI_KERNEL_PCID_MASK: u64 = 0x00f;

/// Bit 12 of the physical address of every ASI page table is set
pub const ASI_PGTABLE_BIT: u32 = 12;
pub const ASI_PGTABLE_MASK: u64 = 1 << ASI_PGTABLE_BIT;

/// Number of kernel PCIDs (dynamic ASIDs) per CPU
pub const ASI_TLB_NR_DYN_ASIDS: usize = 6;

/// Predefined PCID prefixes
pub const ASI_PCID_PREFIX_USER: u8 = 0x80;
pub const ASI_PCID_PREFIX_VKERNEL: u8 = 0xf0;
pub const ASI_PCID_PREFIX_TEST: u8 = 0xff;

// ===========================================================================
// ASI types
// ===========================================================================

/// Last page table activated with one kernel PCID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsiTlbPgtable {
    pub id: u64,
    pub gen: u64,
}

/// Per-CPU TLB state of an ASI type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsiTlbState {
    pub tlb_pgtables: [AsiTlbPgtable; ASI_TLB_NR_DYN_ASIDS],
}

/// What to do with an instruction fetch that does not look like a
/// legitimate code access
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RejectedFetchPolicy {
    /// Abort isolation and leave the fault to the regular handler
    #[default]
    Abort,
    /// Leave isolation in place and the fault to the regular handler
    Ignore,
}

/// Class of ASIs sharing a PCID prefix and a fault policy
#[derive(Debug)]
pub struct AsiType {
    name: &'static str,
    pcid_prefix: u8,
    tlb_state: Vec<Mutex<AsiTlbState>>,
    last_pgtable_id: AtomicU64,
    fault_abort: bool,
    rejected_fetch: RejectedFetchPolicy,
}

impl AsiType {
    /// Create a type for `nr_cpus` CPUs.
    ///
    /// The PCID prefix must be nonzero: a zero prefix would make ASI CR3
    /// values indistinguishable from kernel ones.
    pub fn new(
        name: &'static str,
        pcid_prefix: u8,
        fault_abort: bool,
        nr_cpus: usize,
    ) -> KernelResult<Self> {
        if pcid_prefix == 0 {
            return Err(KernelError::InvalidArgument {
                name: "pcid prefix",
                value: 0,
            });
        }
        let mut tlb_state = Vec::with_capacity(nr_cpus);
        tlb_state.resize_with(nr_cpus, || Mutex::new(AsiTlbState::default()));

        Ok(Self {
            name,
            pcid_prefix,
            tlb_state,
            last_pgtable_id: AtomicU64::new(1),
            fault_abort,
            rejected_fetch: RejectedFetchPolicy::default(),
        })
    }

    pub fn with_rejected_fetch(mut self, policy: RejectedFetchPolicy) -> Self {
        self.rejected_fetch = policy;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pcid_prefix(&self) -> u8 {
        self.pcid_prefix
    }

    /// Whether faults taken while an ASI of this type is active are
    /// handled by the ASI fault classifier
    pub fn fault_abort(&self) -> bool {
        self.fault_abort
    }

    pub fn rejected_fetch(&self) -> RejectedFetchPolicy {
        self.rejected_fetch
    }

    fn next_pgtable_id(&self) -> u64 {
        self.last_pgtable_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// TLB state of `cpu`, if the type knows that CPU
    pub fn tlb_state(&self, cpu: usize) -> Option<AsiTlbState> {
        self.tlb_state.get(cpu).map(|state| *state.lock())
    }

    /// Decide whether loading `asi_cr3` on `cpu` needs a TLB flush.
    ///
    /// If the kernel PCID slot last activated the same page table id and
    /// generation, the returned value carries the NOFLUSH bit. Otherwise
    /// the slot records the new pair and the value is returned unchanged.
    pub fn update_flush(&self, cpu: usize, asi: &Asi, asi_cr3: u64) -> u64 {
        let pcid = (asi_cr3 & ASI_KERNEL_PCID_MASK) as usize;
        if pcid == 0 || pcid > ASI_TLB_NR_DYN_ASIDS {
            return asi_cr3;
        }
        let Some(state) = self.tlb_state.get(cpu) else {
            warn!(target: "asi", "{}: no TLB state for cpu{}", self.name, cpu);
            return asi_cr3;
        };

        let mut state = state.lock();
        let slot = &mut state.tlb_pgtables[pcid - 1];
        let gen = asi.pgtable_gen();
        if slot.id == asi.pgtable_id() && slot.gen == gen {
            asi_cr3 | X86_CR3_PCID_NOFLUSH
        } else {
            slot.id = asi.pgtable_id();
            slot.gen = gen;
            asi_cr3
        }
    }
}

/// Registry of ASI types, keyed by PCID prefix
#[derive(Debug, Default)]
pub struct AsiTypeRegistry {
    types: Vec<Arc<AsiType>>,
}

impl AsiTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the predefined `user`, `test` and `vkernel` types
    pub fn with_predefined(nr_cpus: usize) -> KernelResult<Self> {
        let mut registry = Self::new();
        registry.register(AsiType::new("user", ASI_PCID_PREFIX_USER, false, nr_cpus)?)?;
        registry.register(AsiType::new("test", ASI_PCID_PREFIX_TEST, true, nr_cpus)?)?;
        registry.register(AsiType::new("vkernel", ASI_PCID_PREFIX_VKERNEL, true, nr_cpus)?)?;
        Ok(registry)
    }

    /// Register a type. PCID prefixes and names must be unique.
    pub fn register(&mut self, asi_type: AsiType) -> KernelResult<Arc<AsiType>> {
        if self
            .types
            .iter()
            .any(|t| t.pcid_prefix == asi_type.pcid_prefix || t.name == asi_type.name)
        {
            return Err(KernelError::AlreadyExists {
                resource: "asi type",
                id: u64::from(asi_type.pcid_prefix),
            });
        }
        debug!(
            target: "asi",
            "registered ASI type {} (prefix {:#x}, fault abort {})",
            asi_type.name,
            asi_type.pcid_prefix,
            asi_type.fault_abort
        );
        let asi_type = Arc::new(asi_type);
        self.types.push(asi_type.clone());
        Ok(asi_type)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AsiType>> {
        self.types.iter().find(|t| t.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// ===========================================================================
// ASI instances
// ===========================================================================

/// An address space isolation instance
#[derive(Debug)]
pub struct Asi {
    asi_type: Arc<AsiType>,
    pagetable: Option<PhysicalAddress>,
    base_cr3: u64,
    pgtable_id: u64,
    pgtable_gen: PageTableGeneration,
    fault_log: Mutex<FaultLog>,
}

impl Asi {
    /// Create an ASI with no page table. Only kernel faults are logged.
    pub fn create(asi_type: &Arc<AsiType>) -> Self {
        let pgtable_id = asi_type.next_pgtable_id();
        debug!(target: "asi", "created {} ASI, pgtable id {}", asi_type.name, pgtable_id);
        Self {
            asi_type: asi_type.clone(),
            pagetable: None,
            base_cr3: 0,
            pgtable_id,
            pgtable_gen: PageTableGeneration::new(),
            fault_log: Mutex::new(FaultLog::new(FaultLogPolicy::KERNEL)),
        }
    }

    /// Bind the ASI to the page table at `pagetable`.
    ///
    /// The table must have bit 12 of its address set. Otherwise the ASI is
    /// left without page table and entering or exiting it does nothing.
    pub fn set_pagetable(&mut self, pagetable: PhysicalAddress) -> KernelResult<()> {
        if pagetable.as_u64() & ASI_PGTABLE_MASK == 0 {
            warn!(target: "asi", "ASI {}: invalid ASI pagetable {:#x}", self.pgtable_id, pagetable);
            self.pagetable = None;
            self.base_cr3 = 0;
            return Err(KernelError::InvalidArgument {
                name: "asi pagetable",
                value: pagetable.as_u64(),
            });
        }
        self.pagetable = Some(pagetable);
        self.base_cr3 =
            pagetable.as_u64() | (u64::from(self.asi_type.pcid_prefix) << ASI_PCID_PREFIX_SHIFT);
        Ok(())
    }

    /// Bind the ASI to the page table of `dpt`.
    ///
    /// The ASI then follows the generation of the DPT: any map or unmap
    /// makes the next activation flush the TLB.
    pub fn set_dpt(&mut self, dpt: &Dpt) -> KernelResult<()> {
        self.set_pagetable(dpt.pagetable())?;
        self.pgtable_gen = dpt.generation().clone();
        Ok(())
    }

    pub fn asi_type(&self) -> &Arc<AsiType> {
        &self.asi_type
    }

    pub fn pagetable(&self) -> Option<PhysicalAddress> {
        self.pagetable
    }

    /// CR3 value of the ASI without the kernel PCID
    pub fn base_cr3(&self) -> u64 {
        self.base_cr3
    }

    pub fn pgtable_id(&self) -> u64 {
        self.pgtable_id
    }

    pub fn pgtable_gen(&self) -> u64 {
        self.pgtable_gen.get()
    }

    /// Record a change of the page table so the next activation flushes
    pub fn bump_pgtable_gen(&self) -> u64 {
        self.pgtable_gen.bump()
    }

    pub fn fault_log(&self) -> &Mutex<FaultLog> {
        &self.fault_log
    }

    /// Snapshot of the fault log entries, oldest first
    pub fn faults(&self) -> Vec<FaultLogEntry> {
        self.fault_log.lock().entries().to_vec()
    }

    pub fn clear_faults(&self) {
        self.fault_log.lock().clear();
        debug!(target: "asi", "ASI {}: faults cleared", self.pgtable_id);
    }

    pub fn fault_log_policy(&self) -> FaultLogPolicy {
        self.fault_log.lock().policy()
    }

    /// Enable or disable stack dumps for logged faults
    pub fn set_fault_log_stack(&self, log_stack: bool) {
        let mut log = self.fault_log.lock();
        let mut policy = log.policy();
        policy.set(FaultLogPolicy::STACK, log_stack);
        log.set_policy(policy);
    }

    pub fn set_fault_log_policy(&self, policy: FaultLogPolicy) {
        self.fault_log.lock().set_policy(policy);
    }

    /// Destroy the ASI. The page table it is bound to is left untouched.
    pub fn destroy(self) {
        debug!(target: "asi", "destroyed ASI {}", self.pgtable_id);
    }
}

/// Whether `a` and `b` are the same ASI
pub fn same_asi(a: &Arc<Asi>, b: &Arc<Asi>) -> bool {
    Arc::ptr_eq(a, b)
}

// ===========================================================================
// Minimal DPT setup
// ===========================================================================

/// Kernel regions every ASI page table needs
#[derive(Debug, Clone)]
pub struct KernelLayout {
    /// Start and size of the kernel image
    pub image_start: VirtualAddress,
    pub image_size: usize,
    /// Per-CPU part of the cpu entry area (GDT, entry stacks)
    pub cpu_entry_area: VirtualAddress,
    pub percpu: PerCpuLayout,
    /// Per-CPU variables used by the entry code and the scheduler
    pub percpu_vars: Vec<(VirtualAddress, usize)>,
}

/// Map the minimum needed to run with an ASI into `dpt`.
///
/// No stack is mapped: the task entering the ASI must map its own.
pub fn asi_init_dpt(dpt: &Dpt, layout: &KernelLayout) -> KernelResult<()> {
    dpt.map(layout.image_start, layout.image_size)?;

    let p4d_size = PageTableLevel::P4d.size(dpt.memory().mode()) as usize;
    dpt.map_range(layout.cpu_entry_area, p4d_size, PageTableLevel::P4d)?;

    for &(var, size) in &layout.percpu_vars {
        dpt.map_percpu(&layout.percpu, var, size)?;
    }
    Ok(())
}
