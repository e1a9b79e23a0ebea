//! Scripted isolation test sequences
//!
//! A sequence runs on the CPU of the calling task while the test ASI is
//! active. Sequences that need a second CPU (to send an interrupt or an
//! NMI) queue work for it; the work is carried out when the test CPU
//! waits for it, so the whole exchange stays deterministic.

extern crate alloc;

use alloc::collections::VecDeque;

use log::{debug, info, warn};

use super::{AsiDriver, ASIDRV_MEM_READ_COUNT, ASIDRV_SCHED_LOOP_COUNT, ASIDRV_TEST_BUFFER_SIZE};
use crate::{
    arch::entry,
    asi::{fault::FaultEnv, AsiState},
    error::KernelError,
    mm::page_fault::AccessKind,
    sched::{context_switch, smp::Cpu, task::Task},
};

/// Test sequences, numbered as on the control channel
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    Nop = 0,
    Printk = 1,
    Mem = 2,
    Memmap = 3,
    Interrupt = 4,
    Nmi = 5,
    IntrNmi = 6,
    Sched = 7,
}

impl Sequence {
    pub const ALL: [Sequence; 8] = [
        Sequence::Nop,
        Sequence::Printk,
        Sequence::Mem,
        Sequence::Memmap,
        Sequence::Interrupt,
        Sequence::Nmi,
        Sequence::IntrNmi,
        Sequence::Sched,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Sequence::Nop => "nop",
            Sequence::Printk => "printk",
            Sequence::Mem => "mem",
            Sequence::Memmap => "memmap",
            Sequence::Interrupt => "interrupt",
            Sequence::Nmi => "nmi",
            Sequence::IntrNmi => "intrnmi",
            Sequence::Sched => "sched",
        }
    }
}

impl TryFrom<u32> for Sequence {
    type Error = KernelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Sequence::ALL
            .get(value as usize)
            .copied()
            .ok_or(KernelError::SequenceError { sequence: value })
    }
}

/// Outcome of a sequence run, numbered as on the control channel
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunError {
    #[default]
    None = 0,
    Sequence = 1,
    MapStack = 2,
    MapTask = 3,
    Enter = 4,
    Active = 5,
    MapBuffer = 6,
    Ncpus = 7,
    Intr = 8,
    IntrAsiActive = 9,
    Timeout = 10,
    Nmi = 11,
    NmiReg = 12,
    NmiAsiActive = 13,
    Kthread = 14,
}

impl RunError {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => RunError::None,
            1 => RunError::Sequence,
            2 => RunError::MapStack,
            3 => RunError::MapTask,
            4 => RunError::Enter,
            5 => RunError::Active,
            6 => RunError::MapBuffer,
            7 => RunError::Ncpus,
            8 => RunError::Intr,
            9 => RunError::IntrAsiActive,
            10 => RunError::Timeout,
            11 => RunError::Nmi,
            12 => RunError::NmiReg,
            13 => RunError::NmiAsiActive,
            14 => RunError::Kthread,
            _ => return None,
        })
    }
}

/// Progress of the interrupt and NMI sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestState {
    #[default]
    None,
    Start,
    IntrWaiting,
    IntrReceived,
    NmiWaiting,
    NmiReceived,
}

/// Work carried out by the helper CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Work {
    SendInterrupt,
    SendNmi,
}

/// Pending helper CPU work
pub(super) type WorkQueue = VecDeque<Work>;

impl AsiDriver {
    // =======================================================================
    // Setup and cleanup
    // =======================================================================

    pub(super) fn sequence_setup(&mut self, sequence: Sequence) -> RunError {
        self.state = TestState::None;
        self.intrnmi = false;
        self.work.clear();

        match sequence {
            Sequence::Memmap => match self.dpt.map(self.config.buffer, ASIDRV_TEST_BUFFER_SIZE) {
                // Already cloned by faults of a previous mem run
                Ok(()) | Err(KernelError::AlreadyMapped { .. }) => {}
                Err(err) => {
                    warn!(target: "asidrv", "failed to map test buffer: {}", err);
                    return RunError::MapBuffer;
                }
            },
            Sequence::Interrupt => {
                self.work.push_back(Work::SendInterrupt);
            }
            Sequence::Nmi => {
                if self.nmi_registered {
                    return RunError::NmiReg;
                }
                self.nmi_registered = true;
                self.work.push_back(Work::SendNmi);
            }
            Sequence::IntrNmi => {
                self.intrnmi = true;
                self.work.push_back(Work::SendInterrupt);
                self.work.push_back(Work::SendNmi);
            }
            Sequence::Sched => {
                let (task_struct, stack) = self.config.kthread;
                self.kthread = Some(Task::new(task_struct, stack, self.cpu));
                self.count = 0;
                self.kthread_done = false;
            }
            Sequence::Nop | Sequence::Printk | Sequence::Mem => {}
        }
        RunError::None
    }

    pub(super) fn sequence_cleanup(&mut self, sequence: Sequence) {
        self.work.clear();
        self.state = TestState::None;
        match sequence {
            Sequence::Memmap => self.dpt.unmap(self.config.buffer),
            Sequence::Nmi => self.nmi_registered = false,
            Sequence::Sched => self.kthread = None,
            _ => {}
        }
    }

    /// Whether the sequence needs a helper CPU
    pub(super) fn needs_helper(&self) -> bool {
        !self.work.is_empty()
    }

    // =======================================================================
    // Sequences
    // =======================================================================

    pub(super) fn sequence_run(
        &mut self,
        sequence: Sequence,
        cpu: &mut Cpu,
        current: &mut Task,
    ) -> RunError {
        match sequence {
            Sequence::Nop => RunError::None,
            Sequence::Printk => {
                info!(target: "asidrv", "asidrv printk test...");
                RunError::None
            }
            Sequence::Mem | Sequence::Memmap => self.mem_run(cpu, current),
            Sequence::Interrupt => self.intr_run(cpu),
            Sequence::Nmi => self.nmi_run(cpu),
            Sequence::IntrNmi => self.intrnmi_run(cpu),
            Sequence::Sched => self.sched_run(cpu, current),
        }
    }

    fn next_buffer_index(&mut self) -> usize {
        self.seed = self
            .seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.seed >> 33) as usize % ASIDRV_TEST_BUFFER_SIZE
    }

    /// Read random bytes of the test buffer
    fn mem_run(&mut self, cpu: &mut Cpu, current: &Task) -> RunError {
        let sp = current.stack_top();
        for _ in 0..ASIDRV_MEM_READ_COUNT {
            let index = self.next_buffer_index();
            let addr = self.config.buffer.add(index);
            let env = FaultEnv {
                dpt: &self.dpt,
                symbols: &self.symbols,
            };
            if let Err(err) = cpu.access(&env, addr, AccessKind::Read, self.config.mem_run_ip, sp) {
                warn!(target: "asidrv", "read of {:#x} failed: {}", addr, err);
                break;
            }
            if !cpu.is_asi_active(&self.asi) {
                warn!(target: "asidrv", "ASI inactive after reading {:#x}", addr);
                break;
            }
        }
        RunError::None
    }

    /// Wait until the test reaches `state`, letting the helper CPU act.
    ///
    /// Returns the run error set by a handler, or `timeout` when the state
    /// was never reached.
    fn wait(&mut self, cpu: &mut Cpu, state: TestState, timeout: RunError) -> RunError {
        self.helper_step(cpu);
        if self.run_error != RunError::None {
            return self.run_error;
        }
        if self.state == state {
            RunError::None
        } else {
            timeout
        }
    }

    /// Run the next piece of helper CPU work
    fn helper_step(&mut self, cpu: &mut Cpu) {
        let Some(work) = self.work.pop_front() else {
            return;
        };
        match work {
            Work::SendInterrupt => {
                if self.state != TestState::IntrWaiting {
                    warn!(target: "asidrv", "cpu{} is not waiting for an interrupt", cpu.id());
                    return;
                }
                debug!(target: "asidrv", "sending interrupt to cpu{}", cpu.id());
                if entry::interrupt(cpu, |cpu| self.intr_handler(cpu)).is_none() {
                    debug!(target: "asidrv", "cpu{} has interrupts disabled", cpu.id());
                }
            }
            Work::SendNmi => {
                if self.state != TestState::NmiWaiting {
                    warn!(target: "asidrv", "cpu{} is not waiting for an NMI", cpu.id());
                    return;
                }
                debug!(target: "asidrv", "sending NMI to cpu{}", cpu.id());
                self.nmi_target = true;
                entry::nmi(cpu, |cpu| self.nmi_handler(cpu));
            }
        }
    }

    fn intr_handler(&mut self, cpu: &mut Cpu) {
        if cpu.is_asi_active(&self.asi) {
            self.run_error = RunError::IntrAsiActive;
            self.state = TestState::IntrReceived;
            return;
        }
        self.state = TestState::IntrReceived;

        if self.intrnmi {
            let err = self.nmi_run(cpu);
            if err != RunError::None && self.run_error == RunError::None {
                self.run_error = err;
            }
        }
    }

    fn nmi_handler(&mut self, cpu: &mut Cpu) {
        if !self.nmi_target {
            return;
        }
        self.nmi_target = false;
        if cpu.is_asi_active(&self.asi) {
            self.run_error = RunError::NmiAsiActive;
        }
        self.state = TestState::NmiReceived;
    }

    fn intr_run(&mut self, cpu: &mut Cpu) -> RunError {
        self.state = TestState::IntrWaiting;
        self.wait(cpu, TestState::IntrReceived, RunError::Intr)
    }

    /// Wait for an NMI with interrupts disabled
    fn nmi_run(&mut self, cpu: &mut Cpu) -> RunError {
        cpu.with_irqs_disabled(|cpu| {
            self.state = TestState::NmiWaiting;
            self.wait(cpu, TestState::NmiReceived, RunError::Nmi)
        })
    }

    /// Interrupt whose handler then waits for an NMI
    fn intrnmi_run(&mut self, cpu: &mut Cpu) -> RunError {
        self.state = TestState::IntrWaiting;
        match self.wait(cpu, TestState::NmiReceived, RunError::Timeout) {
            RunError::Timeout if self.state == TestState::IntrWaiting => RunError::Intr,
            RunError::Timeout => RunError::Nmi,
            err => err,
        }
    }

    /// Ping-pong with a kernel thread bound to the same CPU
    fn sched_run(&mut self, cpu: &mut Cpu, current: &mut Task) -> RunError {
        let Some(mut kthread) = self.kthread.take() else {
            return RunError::Kthread;
        };
        self.state = TestState::Start;

        while self.count < ASIDRV_SCHED_LOOP_COUNT {
            self.count += 1;
            let last_count = self.count;
            while last_count == self.count {
                context_switch(cpu, current, &mut kthread);
                self.kthread_step(cpu);
                context_switch(cpu, &mut kthread, current);
                if self.kthread_done && last_count == self.count {
                    warn!(target: "asidrv", "kthread exited early");
                    self.kthread = Some(kthread);
                    return RunError::Kthread;
                }
            }
        }
        self.count += 1;
        debug!(target: "asidrv", "sched ping-pong done, count {}", self.count);

        self.kthread = Some(kthread);
        RunError::None
    }

    /// One scheduling slice of the kernel thread
    fn kthread_step(&mut self, cpu: &Cpu) {
        if self.kthread_done {
            return;
        }
        if cpu.asi_state() != AsiState::Inactive {
            warn!(target: "asidrv", "kthread running with ASI on cpu{}", cpu.id());
        }
        self.count += 1;
        if self.count > ASIDRV_SCHED_LOOP_COUNT {
            self.kthread_done = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers() {
        assert_eq!(Sequence::try_from(0).unwrap(), Sequence::Nop);
        assert_eq!(Sequence::try_from(7).unwrap(), Sequence::Sched);
        assert_eq!(
            Sequence::try_from(8),
            Err(KernelError::SequenceError { sequence: 8 })
        );
        assert_eq!(Sequence::IntrNmi.name(), "intrnmi");
    }

    #[test]
    fn test_run_error_numbers() {
        assert_eq!(RunError::Enter.as_u32(), 4);
        assert_eq!(RunError::Kthread.as_u32(), 14);
        for value in 0..15 {
            assert_eq!(RunError::from_u32(value).unwrap().as_u32(), value);
        }
        assert!(RunError::from_u32(15).is_none());
    }
}
