//! x86_64 support

pub mod mmu;
