//! Per-CPU execution context
//!
//! A [`Cpu`] bundles the state that only the owning processor ever
//! touches: its CR3 register, its interrupt flag and its live ASI session.
//! Code that runs "on" a CPU receives `&mut Cpu`, so the session is never
//! shared or locked.

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};

use log::warn;

use crate::{
    arch::{Cr3Register, SoftCr3, CR3_ADDR_MASK, X86_CR3_PCID_NOFLUSH},
    asi::{fault::FaultEnv, session::AsiSession},
    error::{KernelError, KernelResult},
    mm::{
        page_fault::{page_fault_entry, AccessKind, FaultOrigin, FaultOutcome, PageFaultInfo},
        page_table::translate,
        PhysicalAddress, VirtualAddress,
    },
};

/// Number of times an access is retried after its page fault was handled
const ACCESS_MAX_RETRIES: usize = 4;

/// Placement of per-CPU variable instances
///
/// The instance of a per-CPU variable for `cpu` lives at the variable's
/// address plus the CPU's offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerCpuLayout {
    offsets: Vec<u64>,
}

impl PerCpuLayout {
    pub fn new(offsets: Vec<u64>) -> Self {
        Self { offsets }
    }

    /// Number of possible CPUs
    pub fn possible_cpus(&self) -> usize {
        self.offsets.len()
    }

    /// Address of `cpu`'s instance of the per-CPU variable at `ptr`, or
    /// `None` if `cpu` is not a possible CPU
    pub fn per_cpu_ptr(&self, ptr: VirtualAddress, cpu: usize) -> Option<VirtualAddress> {
        self.offsets.get(cpu).map(|&offset| ptr.add(offset as usize))
    }

    /// Instances of the per-CPU variable at `ptr`, by CPU id
    pub fn per_cpu_ptrs(&self, ptr: VirtualAddress) -> impl Iterator<Item = VirtualAddress> + '_ {
        self.offsets.iter().map(move |&offset| ptr.add(offset as usize))
    }
}

/// CR3 write accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cr3Stats {
    /// Total CR3 loads
    pub writes: u64,
    /// Loads that flushed the TLB entries of the new PCID
    pub flushes: u64,
    /// Loads with the NOFLUSH bit set
    pub noflush: u64,
    /// Last value loaded, NOFLUSH bit included
    pub last_written: u64,
}

/// A logical processor
pub struct Cpu {
    id: usize,
    cr3: Box<dyn Cr3Register + Send>,
    pcid_enabled: bool,
    irqs_enabled: bool,
    pub(crate) session: AsiSession,
    stats: Cr3Stats,
}

impl Cpu {
    pub fn new(id: usize, cr3: Box<dyn Cr3Register + Send>, pcid_enabled: bool) -> Self {
        Self {
            id,
            cr3,
            pcid_enabled,
            irqs_enabled: true,
            session: AsiSession::default(),
            stats: Cr3Stats::default(),
        }
    }

    /// CPU backed by a software CR3 register initially holding `kernel_cr3`
    pub fn with_soft_cr3(id: usize, kernel_cr3: u64, pcid_enabled: bool) -> Self {
        Self::new(id, Box::new(SoftCr3::new(kernel_cr3)), pcid_enabled)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pcid_enabled(&self) -> bool {
        self.pcid_enabled
    }

    pub fn read_cr3(&self) -> u64 {
        self.cr3.read()
    }

    /// Load CR3
    pub(crate) fn write_cr3(&mut self, value: u64) {
        self.stats.writes += 1;
        if value & X86_CR3_PCID_NOFLUSH != 0 {
            self.stats.noflush += 1;
        } else {
            self.stats.flushes += 1;
        }
        self.stats.last_written = value;
        self.cr3.write(value);
    }

    pub fn cr3_stats(&self) -> Cr3Stats {
        self.stats
    }

    pub fn irqs_enabled(&self) -> bool {
        self.irqs_enabled
    }

    pub fn set_irqs_enabled(&mut self, enabled: bool) {
        self.irqs_enabled = enabled;
    }

    /// Run `f` with interrupts disabled, restoring the previous state after
    pub fn with_irqs_disabled<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let flags = self.irqs_enabled;
        self.irqs_enabled = false;
        let ret = f(self);
        self.irqs_enabled = flags;
        ret
    }

    /// The live ASI session of this CPU
    pub fn session(&self) -> &AsiSession {
        &self.session
    }

    /// Perform a memory access through the page table loaded in CR3.
    ///
    /// A missing translation raises a page fault through the regular entry
    /// path. The access is retried when the fault was handled by mapping
    /// the page, and completes through the kernel page table when the
    /// regular handler served it.
    pub fn access(
        &mut self,
        env: &FaultEnv<'_>,
        addr: VirtualAddress,
        kind: AccessKind,
        ip: VirtualAddress,
        sp: VirtualAddress,
    ) -> KernelResult<PhysicalAddress> {
        let mem = env.dpt.memory();
        for _ in 0..=ACCESS_MAX_RETRIES {
            let root = PhysicalAddress::new(self.read_cr3() & CR3_ADDR_MASK);
            if let Some(t) = translate(mem, root, addr) {
                return Ok(t.phys);
            }

            let info = PageFaultInfo::for_access(addr, kind, FaultOrigin::Kernel, ip, sp);
            match page_fault_entry(self, env, &info) {
                FaultOutcome::Retry => continue,
                FaultOutcome::Resolved(phys) => return Ok(phys),
                FaultOutcome::Unresolved(reason) => {
                    warn!(
                        target: "asi",
                        "cpu{}: unhandled page fault at {:#x} (ip {:#x}): {:?}",
                        self.id,
                        addr,
                        ip,
                        reason
                    );
                    return Err(KernelError::UnmappedMemory { addr: addr.as_u64() });
                }
            }
        }
        warn!(target: "asi", "cpu{}: page fault loop at {:#x}", self.id, addr);
        Err(KernelError::UnmappedMemory { addr: addr.as_u64() })
    }
}

impl core::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.id)
            .field("cr3", &format_args!("{:#x}", self.read_cr3()))
            .field("pcid_enabled", &self.pcid_enabled)
            .field("irqs_enabled", &self.irqs_enabled)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_cpu_ptr() {
        let layout = PerCpuLayout::new(alloc::vec![0, 0x4_0000, 0x8_0000]);
        let var = VirtualAddress::new(0xffff_8880_0001_0000);
        assert_eq!(layout.possible_cpus(), 3);
        assert_eq!(layout.per_cpu_ptr(var, 0), Some(var));
        assert_eq!(
            layout.per_cpu_ptr(var, 2),
            Some(VirtualAddress::new(0xffff_8880_0009_0000))
        );
        assert_eq!(layout.per_cpu_ptr(var, 3), None);
        assert_eq!(layout.per_cpu_ptrs(var).count(), 3);
    }

    #[test]
    fn test_cr3_write_accounting() {
        let mut cpu = Cpu::with_soft_cr3(0, 0x10_0000, true);
        cpu.write_cr3(0x20_0001);
        cpu.write_cr3(0x10_0001 | X86_CR3_PCID_NOFLUSH);
        let stats = cpu.cr3_stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.noflush, 1);
        assert_eq!(cpu.read_cr3(), 0x10_0001);
    }

    #[test]
    fn test_with_irqs_disabled_restores_flag() {
        let mut cpu = Cpu::with_soft_cr3(0, 0x10_0000, false);
        assert!(cpu.irqs_enabled());
        let inner = cpu.with_irqs_disabled(|cpu| cpu.irqs_enabled());
        assert!(!inner);
        assert!(cpu.irqs_enabled());
    }
}
