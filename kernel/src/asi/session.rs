//! ASI sessions and CR3 switching
//!
//! Each CPU has one live [`AsiSession`]. It records which ASI is in use,
//! the CR3 values to switch between, and how deeply the ASI is currently
//! interrupted:
//!
//! - `Inactive`: no ASI.
//! - `Active`: the ASI CR3 is loaded (`idepth == 0`).
//! - `Interrupted(n)`: an interrupt, exception or NMI switched back to the
//!   original kernel CR3; `n` counts the nesting.
//!
//! CR3 holds the ASI value iff an ASI is set and the depth is zero. The
//! hooks must be called in strict LIFO order; only the depth counter is
//! checked. When a task is scheduled out its session moves into the task
//! control block, and moves back when it is scheduled in again.

extern crate alloc;

use alloc::sync::Arc;
use core::{fmt, mem};

use log::{debug, warn};

use super::{Asi, ASI_KERNEL_PCID_MASK, ASI_PCID_PREFIX_MASK, ASI_PCID_PREFIX_SHIFT, ASI_PGTABLE_MASK};
use crate::{
    arch::X86_CR3_PCID_NOFLUSH,
    error::{KernelError, KernelResult},
    sched::{smp::Cpu, task::Task},
};

/// ASI state of a CPU or of a scheduled-out task
#[derive(Clone, Default)]
pub struct AsiSession {
    pub asi: Option<Arc<Asi>>,
    /// CR3 value loaded while the ASI is active, NOFLUSH bit included
    pub isolation_cr3: u64,
    /// Kernel CR3 value to restore when the ASI is interrupted or exited
    pub original_cr3: u64,
    /// Interrupt nesting depth
    pub idepth: u32,
}

/// Observable state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsiState {
    Inactive,
    Active,
    Interrupted(u32),
}

impl AsiSession {
    pub fn state(&self) -> AsiState {
        match (&self.asi, self.idepth) {
            (None, _) => AsiState::Inactive,
            (Some(_), 0) => AsiState::Active,
            (Some(_), depth) => AsiState::Interrupted(depth),
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Whether `asi` is the ASI of this session
    pub fn is(&self, asi: &Arc<Asi>) -> bool {
        self.asi.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, asi))
    }
}

impl fmt::Debug for AsiSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsiSession")
            .field("asi", &self.asi.as_ref().map(|asi| asi.pgtable_id()))
            .field("isolation_cr3", &format_args!("{:#x}", self.isolation_cr3))
            .field("original_cr3", &format_args!("{:#x}", self.original_cr3))
            .field("idepth", &self.idepth)
            .finish()
    }
}

/// When the ASI CR3 is loaded by [`Cpu::switch_to_asi_cr3`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchSchedule {
    Now,
    OnResume,
}

impl Cpu {
    // =======================================================================
    // CR3 switching
    // =======================================================================

    /// Kernel CR3 value to load when leaving the ASI
    fn kernel_cr3(&self, original_cr3: u64) -> u64 {
        if self.pcid_enabled() {
            original_cr3 | X86_CR3_PCID_NOFLUSH
        } else {
            original_cr3
        }
    }

    /// ASI CR3 value for `asi` given the current kernel CR3
    fn asi_cr3(&self, asi: &Asi, original_cr3: u64) -> u64 {
        if self.pcid_enabled() {
            let asi_cr3 = asi.base_cr3() | (original_cr3 & ASI_KERNEL_PCID_MASK);
            asi.asi_type().update_flush(self.id(), asi, asi_cr3)
        } else {
            asi.base_cr3()
        }
    }

    fn switch_to_asi_cr3(&mut self, asi: &Arc<Asi>, schedule: SwitchSchedule) {
        if self.irqs_enabled() {
            warn!(target: "asi", "cpu{}: switching to ASI CR3 with interrupts enabled", self.id());
        }

        let original_cr3 = self.read_cr3();
        self.session.asi = Some(asi.clone());
        self.session.original_cr3 = original_cr3;

        match schedule {
            SwitchSchedule::Now => {
                let isolation_cr3 = self.asi_cr3(asi, original_cr3);
                self.session.isolation_cr3 = isolation_cr3;
                self.session.idepth = 0;
                self.write_cr3(isolation_cr3);
            }
            SwitchSchedule::OnResume => {
                // The flush decision is taken by the resume that loads it
                self.session.isolation_cr3 =
                    asi.base_cr3() | (original_cr3 & ASI_KERNEL_PCID_MASK);
                self.session.idepth = 1;
            }
        }
    }

    fn switch_to_kernel_cr3(&mut self) {
        let cr3 = self.kernel_cr3(self.session.original_cr3);
        self.write_cr3(cr3);
        self.session.clear();
    }

    // =======================================================================
    // Enter / exit
    // =======================================================================

    fn check_enter(&self, asi: &Arc<Asi>) -> KernelResult<bool> {
        if asi.pagetable().is_none() {
            debug!(target: "asi", "cpu{}: ASI {} has no pagetable", self.id(), asi.pgtable_id());
            return Ok(false);
        }
        match &self.session.asi {
            Some(current) if Arc::ptr_eq(current, asi) => Ok(false),
            Some(current) => {
                warn!(
                    target: "asi",
                    "cpu{}: entering ASI {} while ASI {} is active",
                    self.id(),
                    asi.pgtable_id(),
                    current.pgtable_id()
                );
                Err(KernelError::Busy { cpu: self.id() })
            }
            None => Ok(true),
        }
    }

    /// Enter `asi` on this CPU.
    ///
    /// Entering the ASI that is already active succeeds without doing
    /// anything. Entering while another ASI is active fails with `Busy`.
    /// An ASI without page table is never entered.
    pub fn asi_enter(&mut self, asi: &Arc<Asi>) -> KernelResult<()> {
        if self.check_enter(asi)? {
            self.with_irqs_disabled(|cpu| cpu.switch_to_asi_cr3(asi, SwitchSchedule::Now));
        }
        Ok(())
    }

    /// Prepare to enter `asi` when the current interrupt returns.
    ///
    /// Must be called from an interrupt or exception handler: the session
    /// is set up as interrupted once, and the matching [`Cpu::asi_resume`]
    /// loads the ASI CR3.
    pub fn asi_deferred_enter(&mut self, asi: &Arc<Asi>) -> KernelResult<()> {
        if self.check_enter(asi)? {
            self.with_irqs_disabled(|cpu| cpu.switch_to_asi_cr3(asi, SwitchSchedule::OnResume));
        }
        Ok(())
    }

    /// Exit `asi` on this CPU
    pub fn asi_exit(&mut self, asi: &Arc<Asi>) {
        let Some(current) = &self.session.asi else {
            return;
        };
        if !Arc::ptr_eq(current, asi) {
            warn!(
                target: "asi",
                "cpu{}: exiting ASI {} while ASI {} is active",
                self.id(),
                asi.pgtable_id(),
                current.pgtable_id()
            );
        }

        if self.session.idepth == 0 {
            self.with_irqs_disabled(|cpu| cpu.switch_to_kernel_cr3());
        } else {
            // CR3 already holds the original value
            self.session.clear();
        }
    }

    // =======================================================================
    // Interrupt hooks
    // =======================================================================

    /// Interrupt the ASI, if any, at the start of an interrupt or exception
    pub fn asi_interrupt(&mut self) {
        if self.session.asi.is_none() {
            return;
        }
        self.session.idepth += 1;
        if self.session.idepth == 1 {
            let cr3 = self.kernel_cr3(self.session.original_cr3);
            self.write_cr3(cr3);
        }
    }

    /// Resume the ASI, if any, when an interrupt or exception returns
    pub fn asi_resume(&mut self) {
        let Some(asi) = self.session.asi.clone() else {
            return;
        };
        if self.session.idepth == 0 {
            warn!(target: "asi", "cpu{}: ASI resume without interrupt", self.id());
            return;
        }
        self.session.idepth -= 1;
        if self.session.idepth == 0 {
            let original_cr3 = self.read_cr3();
            let isolation_cr3 = self.asi_cr3(&asi, original_cr3);
            self.session.original_cr3 = original_cr3;
            self.session.isolation_cr3 = isolation_cr3;
            self.write_cr3(isolation_cr3);
        }
    }

    /// NMI entry. Returns the CR3 value to hand back to
    /// [`Cpu::asi_paranoid_exit`].
    ///
    /// An NMI can hit in the middle of the other hooks, so the decision is
    /// taken from CR3 itself: only an ASI page table has bit 12 set.
    pub fn asi_paranoid_entry(&mut self) -> u64 {
        let saved_cr3 = self.read_cr3();
        if saved_cr3 & ASI_PGTABLE_MASK != 0 {
            if self.session.asi.is_none() {
                // No original CR3 to switch to, stay on the current table.
                warn!(target: "asi", "cpu{}: ASI CR3 {:#x} without ASI session", self.id(), saved_cr3);
                return saved_cr3;
            }
            self.session.idepth += 1;
            let cr3 = self.kernel_cr3(self.session.original_cr3);
            self.write_cr3(cr3);
        }
        saved_cr3
    }

    /// NMI exit: restore the CR3 value saved by [`Cpu::asi_paranoid_entry`]
    pub fn asi_paranoid_exit(&mut self, saved_cr3: u64) {
        if saved_cr3 & ASI_PGTABLE_MASK == 0 {
            let cr3 = self.kernel_cr3(saved_cr3);
            self.write_cr3(cr3);
            return;
        }

        let Some(asi) = self.session.asi.clone() else {
            // Entry left CR3 untouched
            return;
        };
        let isolation_cr3 = if self.pcid_enabled() {
            asi.asi_type().update_flush(self.id(), &asi, saved_cr3)
        } else {
            saved_cr3
        };
        self.session.isolation_cr3 = isolation_cr3;
        self.session.idepth = self.session.idepth.saturating_sub(1);
        self.write_cr3(isolation_cr3);
    }

    // =======================================================================
    // Scheduler hooks
    // =======================================================================

    /// Save the session of `task` before it is switched out
    pub fn asi_schedule_out(&mut self, task: &mut Task) {
        let Some(asi) = self.session.asi.clone() else {
            return;
        };

        if self.session.idepth == 0 {
            // The session is restored with an immediate switch, only the
            // ASI needs to be kept.
            self.with_irqs_disabled(|cpu| cpu.switch_to_kernel_cr3());
            task.asi_session = AsiSession {
                asi: Some(asi),
                ..AsiSession::default()
            };
        } else {
            task.asi_session = mem::take(&mut self.session);
        }
    }

    /// Restore the session of `task` after it is switched in
    pub fn asi_schedule_in(&mut self, task: &mut Task) {
        let Some(asi) = task.asi_session.asi.clone() else {
            return;
        };
        if let Some(current) = &self.session.asi {
            warn!(
                target: "asi",
                "cpu{}: scheduling in ASI {} over active ASI {}, dropping it",
                self.id(),
                asi.pgtable_id(),
                current.pgtable_id()
            );
            if self.session.idepth == 0 {
                self.with_irqs_disabled(|cpu| cpu.switch_to_kernel_cr3());
            } else {
                self.session.clear();
            }
        }

        let saved = mem::take(&mut task.asi_session);
        if saved.idepth == 0 {
            self.with_irqs_disabled(|cpu| cpu.switch_to_asi_cr3(&asi, SwitchSchedule::Now));
        } else {
            self.session = saved;
        }
    }

    // =======================================================================
    // Queries
    // =======================================================================

    pub fn asi_state(&self) -> AsiState {
        self.session.state()
    }

    /// Whether `asi` is active on this CPU with a consistent CR3 value
    pub fn is_asi_active(&self, asi: &Arc<Asi>) -> bool {
        let is_active = match &self.session.asi {
            Some(current) if Arc::ptr_eq(current, asi) => self.session.idepth == 0,
            Some(current) => {
                debug!(
                    target: "asi",
                    "cpu{}: ASI {} is active (testing ASI {})",
                    self.id(),
                    current.pgtable_id(),
                    asi.pgtable_id()
                );
                false
            }
            None => false,
        };

        let cr3 = self.read_cr3();
        if is_active {
            if (cr3 ^ asi.base_cr3()) >> ASI_PCID_PREFIX_SHIFT == 0 {
                return true;
            }
            warn!(
                target: "asi",
                "ASI {}: active ASI has inconsistent CR3 value (cr3={:#x}, ASI base={:#x})",
                asi.pgtable_id(),
                cr3,
                asi.base_cr3()
            );
        } else if cr3 & ASI_PCID_PREFIX_MASK != 0 {
            warn!(
                target: "asi",
                "ASI {}: inactive ASI has inconsistent CR3 value (cr3={:#x}, ASI base={:#x})",
                asi.pgtable_id(),
                cr3,
                asi.base_cr3()
            );
        }
        false
    }
}
