//! Architecture support
//!
//! The ASI engine only touches one piece of hardware state: the root
//! page-table register (CR3 on x86_64). It is reached through the
//! [`Cr3Register`] trait so the engine runs unchanged against the real
//! register or against [`SoftCr3`] under the host test harness.

pub mod entry;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

// ===========================================================================
// CR3 layout
// ===========================================================================

/// Bits 0..11 of CR3 hold the PCID when PCIDs are enabled
pub const CR3_PCID_MASK: u64 = 0xfff;

/// Physical address of the root table
pub const CR3_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Bit 63: do not flush the TLB entries tagged with the new PCID
pub const X86_CR3_PCID_NOFLUSH_BIT: u32 = 63;
pub const X86_CR3_PCID_NOFLUSH: u64 = 1 << X86_CR3_PCID_NOFLUSH_BIT;

/// Access to the root page-table register of the executing CPU
pub trait Cr3Register {
    /// Current register value. The NOFLUSH bit always reads as zero.
    fn read(&self) -> u64;

    /// Load a new value, NOFLUSH bit included.
    fn write(&mut self, value: u64);
}

/// Software CR3 used when running on the host
#[derive(Debug, Clone, Default)]
pub struct SoftCr3 {
    value: u64,
}

impl SoftCr3 {
    pub const fn new(value: u64) -> Self {
        Self { value }
    }
}

impl Cr3Register for SoftCr3 {
    fn read(&self) -> u64 {
        self.value
    }

    fn write(&mut self, value: u64) {
        self.value = value & !X86_CR3_PCID_NOFLUSH;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_cr3_drops_noflush() {
        let mut cr3 = SoftCr3::new(0x1000);
        assert_eq!(cr3.read(), 0x1000);
        cr3.write(0x3000 | 0x801 | X86_CR3_PCID_NOFLUSH);
        assert_eq!(cr3.read(), 0x3801);
        assert_eq!(cr3.read() & CR3_ADDR_MASK, 0x3000);
        assert_eq!(cr3.read() & CR3_PCID_MASK, 0x801);
    }
}
