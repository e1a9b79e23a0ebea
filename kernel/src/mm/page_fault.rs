//! Page fault handling
//!
//! Architecture trap handlers build a [`PageFaultInfo`] and hand it to
//! [`page_fault_entry`]. The entry path first interrupts any active
//! address space isolation, gives the ASI fault classifier a chance to map
//! the faulting page on demand, and otherwise falls back to the regular
//! handler, which resolves the access against the kernel page table.

use bitflags::bitflags;

use crate::{
    arch::{entry, CR3_ADDR_MASK},
    asi::fault::{asi_fault, FaultEnv},
    mm::{page_table::translate, PageFlags, PhysicalAddress, VirtualAddress},
    sched::smp::Cpu,
};

bitflags! {
    /// x86_64 page fault error code
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFaultErrorCode: u64 {
        /// Protection violation (clear: page not present)
        const PROTECTION_VIOLATION = 1 << 0;
        const CAUSED_BY_WRITE = 1 << 1;
        const USER_MODE = 1 << 2;
        const MALFORMED_TABLE = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
        const PROTECTION_KEY = 1 << 5;
    }
}

/// Privilege level of the faulting context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    Kernel,
    User,
}

/// Reason a page fault occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultReason {
    /// Page is not present in the page table.
    NotPresent,
    /// A protection violation was detected (e.g., access rights mismatch).
    ProtectionViolation,
    /// Write to a read-only page.
    WriteToReadOnly,
    /// Attempt to execute a page marked as no-execute.
    ExecuteNoExecute,
    /// User-mode code tried to access a kernel-only page.
    UserModeKernelAccess,
}

/// Kind of memory access performed by a CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Information about a page fault collected by the trap handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultInfo {
    /// The virtual address that caused the fault.
    pub address: VirtualAddress,
    pub error_code: PageFaultErrorCode,
    /// Instruction pointer at the time of the fault.
    pub ip: VirtualAddress,
    /// Stack pointer at the time of the fault.
    pub sp: VirtualAddress,
    pub origin: FaultOrigin,
}

impl PageFaultInfo {
    /// Build the fault raised by a not-present `kind` access to `address`
    pub fn for_access(
        address: VirtualAddress,
        kind: AccessKind,
        origin: FaultOrigin,
        ip: VirtualAddress,
        sp: VirtualAddress,
    ) -> Self {
        let mut error_code = match kind {
            AccessKind::Read => PageFaultErrorCode::empty(),
            AccessKind::Write => PageFaultErrorCode::CAUSED_BY_WRITE,
            AccessKind::Execute => PageFaultErrorCode::INSTRUCTION_FETCH,
        };
        if origin == FaultOrigin::User {
            error_code |= PageFaultErrorCode::USER_MODE;
        }
        Self {
            address,
            error_code,
            ip,
            sp,
            origin,
        }
    }

    pub fn is_instruction_fetch(&self) -> bool {
        self.error_code
            .contains(PageFaultErrorCode::INSTRUCTION_FETCH)
    }

    pub fn is_write(&self) -> bool {
        self.error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
    }

    /// Classify the fault from its error code
    pub fn reason(&self) -> PageFaultReason {
        let code = self.error_code;
        if !code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
            PageFaultReason::NotPresent
        } else if code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
            PageFaultReason::ExecuteNoExecute
        } else if code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
            PageFaultReason::WriteToReadOnly
        } else if code.contains(PageFaultErrorCode::USER_MODE) {
            PageFaultReason::UserModeKernelAccess
        } else {
            PageFaultReason::ProtectionViolation
        }
    }
}

/// Build a [`PageFaultInfo`] from an x86_64 page fault error code and CR2.
///
/// Error code bits (from Intel SDM):
/// - Bit 0 (P):    0 = not-present, 1 = protection violation
/// - Bit 1 (W/R):  0 = read, 1 = write
/// - Bit 2 (U/S):  0 = supervisor, 1 = user
/// - Bit 4 (I/D):  1 = instruction fetch
pub fn from_x86_64(error_code: u64, cr2: u64, rip: u64, rsp: u64) -> PageFaultInfo {
    let error_code = PageFaultErrorCode::from_bits_truncate(error_code);
    let origin = if error_code.contains(PageFaultErrorCode::USER_MODE) {
        FaultOrigin::User
    } else {
        FaultOrigin::Kernel
    };

    PageFaultInfo {
        address: VirtualAddress::new(cr2),
        error_code,
        ip: VirtualAddress::new(rip),
        sp: VirtualAddress::new(rsp),
        origin,
    }
}

/// How a page fault was dealt with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page was mapped into the isolated table; retry the access.
    Retry,
    /// The regular handler served the access through the kernel table.
    Resolved(PhysicalAddress),
    /// Nobody could handle the fault.
    Unresolved(PageFaultReason),
}

/// Whether `flags` allow the access described by `info`
fn access_permitted(flags: PageFlags, info: &PageFaultInfo) -> Result<(), PageFaultReason> {
    if info.is_write() && !flags.contains(PageFlags::WRITABLE) {
        return Err(PageFaultReason::WriteToReadOnly);
    }
    if info.is_instruction_fetch() && flags.contains(PageFlags::NO_EXECUTE) {
        return Err(PageFaultReason::ExecuteNoExecute);
    }
    if info.origin == FaultOrigin::User && !flags.contains(PageFlags::USER) {
        return Err(PageFaultReason::UserModeKernelAccess);
    }
    Ok(())
}

/// Page fault handler body, run with isolation already interrupted.
///
/// The ASI classifier runs first. If it does not take the fault, the
/// access is resolved through the page table currently loaded in CR3,
/// which is the original kernel table.
pub fn handle_page_fault(cpu: &mut Cpu, env: &FaultEnv<'_>, info: &PageFaultInfo) -> FaultOutcome {
    if asi_fault(cpu, env, info) {
        return FaultOutcome::Retry;
    }

    let root = PhysicalAddress::new(cpu.read_cr3() & CR3_ADDR_MASK);
    match translate(env.dpt.memory(), root, info.address) {
        Some(t) => match access_permitted(t.entry.flags(), info) {
            Ok(()) => FaultOutcome::Resolved(t.phys),
            Err(reason) => FaultOutcome::Unresolved(reason),
        },
        None => FaultOutcome::Unresolved(PageFaultReason::NotPresent),
    }
}

/// Exception entry for a page fault: interrupt isolation, handle the fault,
/// then resume isolation.
pub fn page_fault_entry(cpu: &mut Cpu, env: &FaultEnv<'_>, info: &PageFaultInfo) -> FaultOutcome {
    entry::exception(cpu, |cpu| handle_page_fault(cpu, env, info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_x86_64_decodes_error_code() {
        let info = from_x86_64(0x14, 0xffff_ffff_8100_0000, 0xffff_ffff_8100_0000, 0x7000);
        assert!(info.is_instruction_fetch());
        assert!(!info.is_write());
        assert_eq!(info.origin, FaultOrigin::User);
        assert_eq!(info.reason(), PageFaultReason::NotPresent);

        let info = from_x86_64(0x3, 0x1000, 0x2000, 0x3000);
        assert!(info.is_write());
        assert_eq!(info.origin, FaultOrigin::Kernel);
        assert_eq!(info.reason(), PageFaultReason::WriteToReadOnly);
    }

    #[test]
    fn test_for_access_error_codes() {
        let va = VirtualAddress::new(0x1000);
        let ip = VirtualAddress::new(0x2000);
        let sp = VirtualAddress::new(0x3000);

        let read = PageFaultInfo::for_access(va, AccessKind::Read, FaultOrigin::Kernel, ip, sp);
        assert!(read.error_code.is_empty());

        let fetch = PageFaultInfo::for_access(va, AccessKind::Execute, FaultOrigin::User, ip, sp);
        assert_eq!(
            fetch.error_code,
            PageFaultErrorCode::INSTRUCTION_FETCH | PageFaultErrorCode::USER_MODE
        );
    }

    #[test]
    fn test_access_permissions() {
        let va = VirtualAddress::new(0x1000);
        let ip = VirtualAddress::new(0x2000);
        let write = PageFaultInfo::for_access(va, AccessKind::Write, FaultOrigin::Kernel, ip, ip);
        assert_eq!(
            access_permitted(PageFlags::KERNEL_TEXT, &write),
            Err(PageFaultReason::WriteToReadOnly)
        );
        assert_eq!(access_permitted(PageFlags::KERNEL_DATA, &write), Ok(()));

        let fetch = PageFaultInfo::for_access(va, AccessKind::Execute, FaultOrigin::Kernel, ip, ip);
        assert_eq!(
            access_permitted(PageFlags::KERNEL_DATA, &fetch),
            Err(PageFaultReason::ExecuteNoExecute)
        );

        let user = PageFaultInfo::for_access(va, AccessKind::Read, FaultOrigin::User, ip, ip);
        assert_eq!(
            access_permitted(PageFlags::KERNEL_DATA, &user),
            Err(PageFaultReason::UserModeKernelAccess)
        );
    }
}
