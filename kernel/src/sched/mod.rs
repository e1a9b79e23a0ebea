//! Scheduling
//!
//! The pieces of the scheduler that address space isolation hooks into:
//! per-CPU execution contexts, task control blocks and the context switch.

pub mod smp;
pub mod task;

pub use smp::{Cpu, PerCpuLayout};
pub use task::{Task, TaskId};

/// Switch `cpu` from `prev` to `next`.
///
/// The isolation session of `prev` is saved before the switch and the one
/// of `next`, if any, restored after it.
pub fn context_switch(cpu: &mut Cpu, prev: &mut Task, next: &mut Task) {
    log::trace!(target: "asi", "cpu{}: switch {:?} -> {:?}", cpu.id(), prev.id, next.id);
    cpu.asi_schedule_out(prev);
    cpu.asi_schedule_in(next);
}
