//! x86_64 MMU access
//!
//! The hardware implementation of [`Cr3Register`], the CR2 fault address
//! register and the page fault error-code decoder used by the IDT handler.
//! Only usable in ring 0.

use ::x86_64::{
    registers::control::{Cr2, Cr3},
    structures::idt::{InterruptStackFrame, PageFaultErrorCode},
};

use crate::{
    arch::Cr3Register,
    mm::{
        page_fault::{self, PageFaultInfo},
        VirtualAddress,
    },
};

/// The CR3 register of the executing CPU
#[derive(Debug, Default)]
pub struct HardwareCr3;

impl Cr3Register for HardwareCr3 {
    fn read(&self) -> u64 {
        let (frame, low_bits) = Cr3::read_raw();
        frame.start_address().as_u64() | u64::from(low_bits)
    }

    fn write(&mut self, value: u64) {
        // SAFETY: callers only load CR3 values built from a valid root table
        // (the kernel page table or a decorated page table whose kernel
        // mappings cover the code performing the switch). Bit 63 is the
        // architectural NOFLUSH bit and is accepted by the instruction.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
        }
    }
}

/// Read CR2 (page fault linear address)
pub fn read_cr2() -> VirtualAddress {
    VirtualAddress::new(Cr2::read_raw())
}

/// Decode a page fault delivered through the IDT
pub fn decode_page_fault(
    stack_frame: &InterruptStackFrame,
    error_code: PageFaultErrorCode,
) -> PageFaultInfo {
    page_fault::from_x86_64(
        error_code.bits(),
        read_cr2().as_u64(),
        stack_frame.instruction_pointer.as_u64(),
        stack_frame.stack_pointer.as_u64(),
    )
}
