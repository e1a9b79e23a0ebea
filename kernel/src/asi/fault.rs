//! ASI page fault handling
//!
//! A page fault taken while an ASI is active usually means the decorated
//! page table lacks a mapping the code needs. For ASI types with the
//! fault-abort policy the fault is recorded in the ASI fault log, keyed by
//! instruction pointer, and the faulting page is copied from the kernel
//! page table so the instruction can be retried under isolation.

extern crate alloc;

use alloc::vec::Vec;

use bitflags::bitflags;
use log::{info, warn};

use super::{
    symbols::{format_symbol, SymbolResolver},
    Asi, RejectedFetchPolicy,
};
use crate::{
    mm::{
        page_fault::{FaultOrigin, PageFaultInfo},
        Dpt, VirtualAddress,
    },
    sched::smp::Cpu,
};

/// Number of distinct faults an ASI remembers
pub const ASI_FAULT_LOG_SIZE: usize = 128;

bitflags! {
    /// Which ASI faults get logged
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FaultLogPolicy: u32 {
        /// Faults in kernel context
        const KERNEL = 1 << 0;
        /// Faults in user context
        const USER = 1 << 1;
        /// Also dump the stack of logged faults
        const STACK = 1 << 2;
    }
}

impl FaultLogPolicy {
    fn logs(self, origin: FaultOrigin) -> bool {
        match origin {
            FaultOrigin::Kernel => self.contains(Self::KERNEL),
            FaultOrigin::User => self.contains(Self::USER),
        }
    }
}

/// One logged fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultLogEntry {
    /// Instruction pointer of the faulting instruction
    pub address: VirtualAddress,
    pub count: u32,
}

/// Result of recording a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultRecord {
    /// First fault at this instruction, stored at the given slot
    New(usize),
    /// Known instruction, new count
    Repeated(u32),
    /// Unknown instruction and no room left
    Full,
}

/// Fixed-size fault log of an ASI
#[derive(Debug, Clone)]
pub struct FaultLog {
    entries: Vec<FaultLogEntry>,
    policy: FaultLogPolicy,
}

impl FaultLog {
    pub fn new(policy: FaultLogPolicy) -> Self {
        Self {
            entries: Vec::with_capacity(ASI_FAULT_LOG_SIZE),
            policy,
        }
    }

    pub fn policy(&self) -> FaultLogPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: FaultLogPolicy) {
        self.policy = policy;
    }

    /// Count a fault at `ip`. Once the log is full, new instructions are
    /// dropped and the existing entries kept.
    pub fn record(&mut self, ip: VirtualAddress) -> FaultRecord {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == ip) {
            entry.count = entry.count.saturating_add(1);
            return FaultRecord::Repeated(entry.count);
        }
        if self.entries.len() >= ASI_FAULT_LOG_SIZE {
            return FaultRecord::Full;
        }
        self.entries.push(FaultLogEntry {
            address: ip,
            count: 1,
        });
        FaultRecord::New(self.entries.len() - 1)
    }

    pub fn entries(&self) -> &[FaultLogEntry] {
        &self.entries
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= ASI_FAULT_LOG_SIZE
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// What the fault classifier needs besides the CPU
pub struct FaultEnv<'a> {
    /// Decorated page table faulting pages are cloned into
    pub dpt: &'a Dpt,
    pub symbols: &'a dyn SymbolResolver,
}

/// Log a fault if the ASI policy asks for it
fn asi_log_fault(asi: &Asi, symbols: &dyn SymbolResolver, info: &PageFaultInfo) {
    let mut log = asi.fault_log().lock();
    let policy = log.policy();
    if !policy.logs(info.origin) {
        return;
    }

    let slot = match log.record(info.ip) {
        FaultRecord::Repeated(_) => return,
        FaultRecord::New(slot) => slot,
        FaultRecord::Full => {
            warn!(
                target: "asi",
                "ASI {}: fault log buffer is full [{}]",
                asi.pgtable_id(),
                ASI_FAULT_LOG_SIZE
            );
            ASI_FAULT_LOG_SIZE
        }
    };

    info!(
        target: "asi",
        "ASI {}: PF#{} ({:#x}) at {} on {:#x}",
        asi.pgtable_id(),
        slot,
        info.error_code.bits(),
        format_symbol(symbols, info.ip),
        info.address
    );
    if policy.contains(FaultLogPolicy::STACK) {
        info!(target: "asi", "ASI {}: fault stack at {:#x}", asi.pgtable_id(), info.sp);
    }
}

/// Whether an instruction fetch at `addr` targets legitimate code.
///
/// The address must be kernel or module text covered by a static symbol.
/// Mid-function addresses are only accepted on the page following an
/// already logged fault in the same function.
fn asi_verify_code_access(asi: &Asi, symbols: &dyn SymbolResolver, addr: VirtualAddress) -> bool {
    if !symbols.is_text(addr) {
        return false;
    }
    let Some(symbol) = symbols.lookup(addr) else {
        return false;
    };
    if symbol.dynamic {
        return false;
    }
    if symbol.offset == 0 {
        return true;
    }

    let log = asi.fault_log().lock();
    log.entries().iter().any(|entry| {
        addr.page() == entry.address.page() + 1
            && symbols
                .lookup(entry.address)
                .is_some_and(|prev| prev.start == symbol.start)
    })
}

/// ASI page fault hook.
///
/// Returns `true` when the faulting page was mapped into the ASI page
/// table and the access can be retried. Returns `false` when the regular
/// page fault handler must deal with the fault: no ASI was active, the
/// fault did not happen under the ASI, the ASI type does not intercept
/// faults, or the page could not be mapped (the ASI is then aborted).
pub fn asi_fault(cpu: &mut Cpu, env: &FaultEnv<'_>, info: &PageFaultInfo) -> bool {
    // The exception entry already interrupted the ASI, so a fault taken
    // under the ASI page table shows up with a depth of one.
    let Some(asi) = cpu.session.asi.clone() else {
        return false;
    };
    if cpu.session.idepth > 1 {
        return false;
    }
    if !asi.asi_type().fault_abort() {
        return false;
    }

    asi_log_fault(&asi, env.symbols, info);

    if info.is_instruction_fetch() && !asi_verify_code_access(&asi, env.symbols, info.address) {
        warn!(
            target: "asi",
            "ASI {}: rejected instruction fetch at {}",
            asi.pgtable_id(),
            format_symbol(env.symbols, info.address)
        );
        if asi.asi_type().rejected_fetch() == RejectedFetchPolicy::Abort {
            cpu.session.clear();
        }
        return false;
    }

    match env.dpt.clone_page(info.address) {
        Ok(_) => true,
        Err(err) => {
            warn!(
                target: "asi",
                "ASI {}: cannot map {:#x}, aborting isolation: {}",
                asi.pgtable_id(),
                info.address,
                err
            );
            cpu.session.clear();
            false
        }
    }
}
