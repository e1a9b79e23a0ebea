//! Address Space Isolation kernel library
//!
//! Lets kernel code run on a restricted, decorated page table instead of
//! the full kernel page table, switching CR3 transparently on interrupts,
//! NMIs, scheduling and page faults.
//!
//! - [`mm::dpt`] builds and maintains decorated page tables.
//! - [`asi`] holds ASI types and instances, the per-CPU session engine and
//!   the ASI page fault classifier.
//! - [`drivers::asi`] is the privileged control interface used to inspect
//!   and exercise an ASI.
//!
//! The library is `no_std` and only needs `alloc`. Under the host test
//! harness, page tables live in [`mm::PhysMemory`] and CR3 is the software
//! register [`arch::SoftCr3`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod asi;
pub mod drivers;
pub mod error;
pub mod mm;
pub mod sched;

pub use asi::{Asi, AsiType, AsiTypeRegistry};
pub use error::{KernelError, KernelResult};
pub use mm::{Dpt, PhysMemory, PhysicalAddress, VirtualAddress};
pub use sched::{Cpu, Task};
