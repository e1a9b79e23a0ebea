//! Interrupt and exception entry thunks
//!
//! Every asynchronous entry into the kernel leaves address space isolation
//! before running its handler and re-enters it on the way out. Regular
//! interrupts and exceptions go through the nesting-depth hooks
//! ([`Cpu::asi_interrupt`] / [`Cpu::asi_resume`]). NMIs can arrive in the
//! middle of those hooks, so they use the paranoid variant which decides
//! from the live CR3 value alone.

use crate::sched::smp::Cpu;

/// Run `handler` as an exception handler (page fault, general protection).
///
/// The interrupt flag is left as it was at the time of the exception.
pub fn exception<R>(cpu: &mut Cpu, handler: impl FnOnce(&mut Cpu) -> R) -> R {
    cpu.asi_interrupt();
    let ret = handler(cpu);
    cpu.asi_resume();
    ret
}

/// Run `handler` as a maskable interrupt handler.
///
/// The interrupt is not delivered, and `None` is returned, while the CPU
/// has interrupts disabled.
pub fn interrupt<R>(cpu: &mut Cpu, handler: impl FnOnce(&mut Cpu) -> R) -> Option<R> {
    if !cpu.irqs_enabled() {
        return None;
    }
    Some(cpu.with_irqs_disabled(|cpu| exception(cpu, handler)))
}

/// Run `handler` as an NMI handler
pub fn nmi<R>(cpu: &mut Cpu, handler: impl FnOnce(&mut Cpu) -> R) -> R {
    let saved_cr3 = cpu.asi_paranoid_entry();
    let ret = cpu.with_irqs_disabled(handler);
    cpu.asi_paranoid_exit(saved_cr3);
    ret
}
