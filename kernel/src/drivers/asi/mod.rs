//! ASI test driver
//!
//! Privileged control interface used to inspect and exercise a test ASI.
//! The driver builds a decorated page table holding the minimal kernel
//! mappings plus its own code and data, and a test ASI using it. Requests
//! are served through [`AsiDriver::ioctl`]:
//!
//! | nr | request           | argument                                    |
//! |----|-------------------|---------------------------------------------|
//! | 1  | `RUN_SEQUENCE`    | [`wire::RunParam`], results written back    |
//! | 2  | `LIST_FAULT`      | fault list                                  |
//! | 3  | `CLEAR_FAULT`     | none                                        |
//! | 4  | `LOG_FAULT_STACK` | `u32` flag                                  |
//! | 5  | `ADD_MAPPING`     | mapping list                                |
//! | 6  | `CLEAR_MAPPING`   | mapping list                                |
//! | 7  | `LIST_MAPPING`    | mapping list                                |

extern crate alloc;

pub mod sequence;
pub mod wire;

use alloc::sync::Arc;

use log::{debug, info, warn};

use self::{
    sequence::{RunError, Sequence, TestState, WorkQueue},
    wire::{FaultRecord, MappingRecord, RunParam},
};
use crate::{
    asi::{
        asi_init_dpt,
        fault::ASI_FAULT_LOG_SIZE,
        symbols::{format_symbol, KernelSymbolTable},
        Asi, AsiTypeRegistry, KernelLayout, ASI_PGTABLE_MASK,
    },
    error::{KernelError, KernelResult},
    mm::{page_table::PageTableLevel, Dpt, PhysMemory, PhysicalAddress, VirtualAddress, PAGE_SIZE},
    sched::{
        smp::Cpu,
        task::{Task, TASK_STRUCT_SIZE},
    },
};

/// Size of the buffer read by the `mem` sequences
pub const ASIDRV_TEST_BUFFER_SIZE: usize = PAGE_SIZE;

/// Number of reads done by the `mem` sequences
pub const ASIDRV_MEM_READ_COUNT: usize = 1000;

/// Ping-pong rounds of the `sched` sequence
pub const ASIDRV_SCHED_LOOP_COUNT: u32 = 20;

/// Maximum number of records returned by `LIST_MAPPING`
pub const LIST_MAPPING_MAX: usize = 512;

/// Control channel request numbers
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    RunSequence = 1,
    ListFault = 2,
    ClearFault = 3,
    LogFaultStack = 4,
    AddMapping = 5,
    ClearMapping = 6,
    ListMapping = 7,
}

impl TryFrom<u32> for IoctlCmd {
    type Error = KernelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => IoctlCmd::RunSequence,
            2 => IoctlCmd::ListFault,
            3 => IoctlCmd::ClearFault,
            4 => IoctlCmd::LogFaultStack,
            5 => IoctlCmd::AddMapping,
            6 => IoctlCmd::ClearMapping,
            7 => IoctlCmd::ListMapping,
            _ => {
                return Err(KernelError::InvalidArgument {
                    name: "ioctl",
                    value: value as u64,
                })
            }
        })
    }
}

/// Where the driver and its test data live
#[derive(Debug, Clone)]
pub struct AsiDriverConfig {
    pub kernel: KernelLayout,
    /// Text and data of the driver module
    pub module: (VirtualAddress, usize),
    /// Driver state read by the sequences under isolation
    pub test_struct: (VirtualAddress, usize),
    /// The test ASI itself
    pub asi_struct: (VirtualAddress, usize),
    /// Buffer read by the `mem` sequences
    pub buffer: VirtualAddress,
    /// Instruction doing the `mem` reads
    pub mem_run_ip: VirtualAddress,
    /// Task struct and stack of the `sched` kernel thread
    pub kthread: (VirtualAddress, VirtualAddress),
}

/// Result of a sequence run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub run_error: RunError,
    /// Whether the ASI was still active at the end of the sequence
    pub asi_active: bool,
}

/// The test driver
pub struct AsiDriver {
    dpt: Dpt,
    asi: Arc<Asi>,
    symbols: KernelSymbolTable,
    config: AsiDriverConfig,
    /// CPU the current run is bound to
    cpu: usize,
    state: TestState,
    run_error: RunError,
    intrnmi: bool,
    nmi_registered: bool,
    nmi_target: bool,
    work: WorkQueue,
    kthread: Option<Task>,
    kthread_done: bool,
    count: u32,
    seed: u64,
}

impl AsiDriver {
    /// Build the test page table and ASI
    pub fn create(
        mem: Arc<PhysMemory>,
        kernel_pagetable: PhysicalAddress,
        registry: &AsiTypeRegistry,
        config: AsiDriverConfig,
        symbols: KernelSymbolTable,
    ) -> KernelResult<Self> {
        let dpt = Dpt::create(mem, kernel_pagetable, ASI_PGTABLE_MASK as usize)?;
        asi_init_dpt(&dpt, &config.kernel)?;

        let (module, module_size) = config.module;
        dpt.map(module, module_size)?;
        let (test, test_size) = config.test_struct;
        dpt.map(test, test_size)?;

        let asi_type = registry.get("test").ok_or(KernelError::NotFound {
            resource: "asi type",
            id: 0,
        })?;
        let mut asi = Asi::create(&asi_type);

        let (asi_struct, asi_size) = config.asi_struct;
        dpt.map(asi_struct, asi_size)?;
        asi.set_dpt(&dpt)?;

        info!(
            target: "asidrv",
            "test ASI {} using page table {:#x}",
            asi.pgtable_id(),
            dpt.pagetable()
        );

        Ok(Self {
            dpt,
            asi: Arc::new(asi),
            symbols,
            config,
            cpu: 0,
            state: TestState::None,
            run_error: RunError::None,
            intrnmi: false,
            nmi_registered: false,
            nmi_target: false,
            work: WorkQueue::new(),
            kthread: None,
            kthread_done: false,
            count: 0,
            seed: 0x2545_f491_4f6c_dd1d,
        })
    }

    pub fn asi(&self) -> &Arc<Asi> {
        &self.asi
    }

    pub fn dpt(&self) -> &Dpt {
        &self.dpt
    }

    pub fn symbols(&self) -> &KernelSymbolTable {
        &self.symbols
    }

    pub fn state(&self) -> TestState {
        self.state
    }

    // =======================================================================
    // Sequence runs
    // =======================================================================

    /// Bind the run to the CPU of `current` and map its task and stack
    fn run_init(&mut self, cpus: &[Cpu], current: &Task) -> RunError {
        self.run_error = RunError::None;
        if current.cpu >= cpus.len() {
            return RunError::Ncpus;
        }
        self.cpu = current.cpu;

        if let Err(err) = self.dpt.map(current.stack, current.stack_size) {
            warn!(target: "asidrv", "failed to map stack: {}", err);
            return RunError::MapStack;
        }
        if let Err(err) = self.dpt.map(current.task_struct, TASK_STRUCT_SIZE) {
            warn!(target: "asidrv", "failed to map task: {}", err);
            self.dpt.unmap(current.stack);
            return RunError::MapTask;
        }
        RunError::None
    }

    fn run_fini(&mut self, current: &Task) {
        self.dpt.unmap(current.task_struct);
        self.dpt.unmap(current.stack);
    }

    fn run(&mut self, cpus: &mut [Cpu], current: &mut Task, sequence: Sequence) -> RunResult {
        let mut result = RunResult {
            run_error: self.sequence_setup(sequence),
            asi_active: false,
        };
        if result.run_error != RunError::None {
            self.sequence_cleanup(sequence);
            return result;
        }
        if self.needs_helper() && cpus.len() < 2 {
            warn!(target: "asidrv", "{} needs another cpu", sequence.name());
            self.sequence_cleanup(sequence);
            result.run_error = RunError::Ncpus;
            return result;
        }

        let cpu = &mut cpus[self.cpu];
        if let Err(err) = cpu.asi_enter(&self.asi) {
            warn!(target: "asidrv", "asi_enter failed: {}", err);
            self.sequence_cleanup(sequence);
            result.run_error = RunError::Enter;
            return result;
        }

        if !cpu.is_asi_active(&self.asi) {
            result.run_error = RunError::Active;
        } else {
            result.run_error = self.sequence_run(sequence, cpu, current);
            result.asi_active = cpu.is_asi_active(&self.asi);
        }

        cpu.asi_exit(&self.asi);
        self.sequence_cleanup(sequence);
        result
    }

    /// Run `sequence` on the CPU of `current` under the test ASI
    pub fn run_sequence(&mut self, cpus: &mut [Cpu], current: &mut Task, sequence: u32) -> RunResult {
        let Ok(sequence) = Sequence::try_from(sequence) else {
            return RunResult {
                run_error: RunError::Sequence,
                asi_active: false,
            };
        };
        debug!(target: "asidrv", "running sequence {}", sequence.name());

        let run_error = self.run_init(cpus, current);
        if run_error != RunError::None {
            return RunResult {
                run_error,
                asi_active: false,
            };
        }
        let result = self.run(cpus, current, sequence);
        self.run_fini(current);
        result
    }

    // =======================================================================
    // Control channel
    // =======================================================================

    /// Serve a control channel request.
    ///
    /// `arg` is the request argument buffer; responses are written back
    /// into it. Mapping updates return the number of leading records
    /// applied when only some of them succeeded, zero otherwise.
    pub fn ioctl(
        &mut self,
        cpus: &mut [Cpu],
        current: &mut Task,
        cmd: u32,
        arg: &mut [u8],
    ) -> KernelResult<usize> {
        match IoctlCmd::try_from(cmd)? {
            IoctlCmd::RunSequence => {
                let mut param = RunParam::from_bytes(arg)?;
                let result = self.run_sequence(cpus, current, param.sequence);
                param.run_error = result.run_error.as_u32();
                param.asi_active = result.asi_active;
                arg[..RunParam::SIZE].copy_from_slice(&param.to_bytes());
                Ok(0)
            }
            IoctlCmd::ListFault => self.list_fault(arg).map(|_| 0),
            IoctlCmd::ClearFault => {
                self.asi.clear_faults();
                Ok(0)
            }
            IoctlCmd::LogFaultStack => {
                let enable = arg.len() >= 4 && u32::from_le_bytes([arg[0], arg[1], arg[2], arg[3]]) != 0;
                self.asi.set_fault_log_stack(enable);
                Ok(0)
            }
            IoctlCmd::AddMapping => self.add_mapping(arg),
            IoctlCmd::ClearMapping => self.clear_mapping(arg),
            IoctlCmd::ListMapping => self.list_mapping(arg).map(|_| 0),
        }
    }

    /// Copy the fault log into a fault list. The list length is set to
    /// the number of logged faults, which can exceed the records written.
    fn list_fault(&self, buf: &mut [u8]) -> KernelResult<()> {
        let len = (wire::read_list_length(buf)? as usize).min(ASI_FAULT_LOG_SIZE);
        let faults = self.asi.faults();

        for (i, fault) in faults.iter().take(len).enumerate() {
            FaultRecord {
                addr: fault.address.as_u64(),
                symbol: format_symbol(&self.symbols, fault.address),
                count: fault.count,
            }
            .write_at(buf, i)?;
        }

        if faults.len() >= ASI_FAULT_LOG_SIZE {
            warn!(target: "asidrv", "ASI fault log is full");
        }
        wire::write_list_length(buf, faults.len() as u32)
    }

    /// Copy the range ledger into a mapping list
    fn list_mapping(&self, buf: &mut [u8]) -> KernelResult<()> {
        let len = (wire::read_list_length(buf)? as usize).min(LIST_MAPPING_MAX);
        let mappings = self.dpt.mappings();

        for (i, mapping) in mappings.iter().take(len).enumerate() {
            MappingRecord {
                addr: mapping.ptr.as_u64(),
                size: mapping.size as u64,
                level: mapping.level as u32,
                percpu: false,
            }
            .write_at(buf, i)?;
        }
        wire::write_list_length(buf, mappings.len() as u32)
    }

    fn apply_mappings(
        &self,
        buf: &[u8],
        op: impl Fn(&Self, &MappingRecord) -> KernelResult<()>,
    ) -> KernelResult<usize> {
        let len = wire::read_list_length(buf)? as usize;
        for i in 0..len {
            let res = MappingRecord::read_at(buf, i).and_then(|record| op(self, &record));
            if let Err(err) = res {
                debug!(target: "asidrv", "mapping record {} failed: {}", i, err);
                return if i == 0 { Err(err) } else { Ok(i) };
            }
        }
        Ok(0)
    }

    fn add_mapping(&mut self, buf: &[u8]) -> KernelResult<usize> {
        self.apply_mappings(buf, |drv, record| {
            let ptr = VirtualAddress::new(record.addr);
            let level = PageTableLevel::from_u32(record.level).ok_or(KernelError::InvalidArgument {
                name: "mapping level",
                value: record.level as u64,
            })?;
            if record.percpu {
                if level != PageTableLevel::Pte {
                    return Err(KernelError::InvalidArgument {
                        name: "percpu mapping level",
                        value: record.level as u64,
                    });
                }
                drv.dpt.map_percpu(&drv.config.kernel.percpu, ptr, record.size as usize)
            } else {
                drv.dpt.map_range(ptr, record.size as usize, level)
            }
        })
    }

    fn clear_mapping(&mut self, buf: &[u8]) -> KernelResult<usize> {
        self.apply_mappings(buf, |drv, record| {
            let ptr = VirtualAddress::new(record.addr);
            if record.percpu {
                drv.dpt.unmap_percpu(&drv.config.kernel.percpu, ptr);
            } else {
                drv.dpt.unmap(ptr);
            }
            Ok(())
        })
    }

    /// Tear the driver down, releasing the test page table
    pub fn destroy(self) {
        let Self { dpt, asi, .. } = self;
        match Arc::try_unwrap(asi) {
            Ok(asi) => asi.destroy(),
            Err(_) => warn!(target: "asidrv", "test ASI still referenced"),
        }
        dpt.destroy();
    }
}

impl core::fmt::Debug for AsiDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsiDriver")
            .field("asi", &self.asi.pgtable_id())
            .field("pagetable", &self.dpt.pagetable())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::{
        asi::AsiType,
        mm::{page_table::{PageMapper, PagingMode}, PageFlags},
        sched::smp::PerCpuLayout,
    };

    const IMAGE: u64 = 0xffff_ffff_8100_0000;
    const CEA: u64 = 0xffff_fe00_0000_0000;
    const MODULE: u64 = 0xffff_ffff_c000_0000;
    const DATA: u64 = 0xffff_8880_1000_0000;

    fn setup() -> (AsiDriver, Vec<Cpu>, Task) {
        let mem = Arc::new(PhysMemory::new(PagingMode::FourLevel));
        let mut mapper = PageMapper::create(&mem).unwrap();
        let frame = mem.allocate_frame().unwrap();
        mapper
            .map_pages(VirtualAddress::new(IMAGE), frame, 4, PageFlags::KERNEL_TEXT)
            .unwrap();
        mapper
            .map_pages(VirtualAddress::new(CEA), frame, 1, PageFlags::KERNEL_DATA)
            .unwrap();
        mapper
            .map_pages(VirtualAddress::new(MODULE), frame, 4, PageFlags::KERNEL_TEXT)
            .unwrap();
        mapper
            .map_pages(VirtualAddress::new(DATA), frame, 64, PageFlags::KERNEL_DATA)
            .unwrap();
        let root = mapper.root();

        let mut registry = AsiTypeRegistry::new();
        registry
            .register(AsiType::new("test", 0xff, true, 2).unwrap())
            .unwrap();

        let config = AsiDriverConfig {
            kernel: KernelLayout {
                image_start: VirtualAddress::new(IMAGE),
                image_size: 4 * PAGE_SIZE,
                cpu_entry_area: VirtualAddress::new(CEA),
                percpu: PerCpuLayout::new(alloc::vec![0, 0x1000]),
                percpu_vars: alloc::vec![(VirtualAddress::new(DATA + 0x3e000), 8)],
            },
            module: (VirtualAddress::new(MODULE), 4 * PAGE_SIZE),
            test_struct: (VirtualAddress::new(DATA), 0x100),
            asi_struct: (VirtualAddress::new(DATA + 0x1000), 0x200),
            buffer: VirtualAddress::new(DATA + 0x8000),
            mem_run_ip: VirtualAddress::new(MODULE + 0x40),
            kthread: (VirtualAddress::new(DATA + 0x30000), VirtualAddress::new(DATA + 0x34000)),
        };
        let driver = AsiDriver::create(mem, root, &registry, config, KernelSymbolTable::new()).unwrap();
        let cpus = alloc::vec![
            Cpu::with_soft_cr3(0, root.as_u64(), true),
            Cpu::with_soft_cr3(1, root.as_u64(), true),
        ];
        let task = Task::new(
            VirtualAddress::new(DATA + 0x10000),
            VirtualAddress::new(DATA + 0x20000),
            0,
        );
        (driver, cpus, task)
    }

    #[test]
    fn test_unknown_ioctl() {
        let (mut driver, mut cpus, mut task) = setup();
        assert_eq!(
            driver.ioctl(&mut cpus, &mut task, 42, &mut []),
            Err(KernelError::InvalidArgument {
                name: "ioctl",
                value: 42
            })
        );
    }

    #[test]
    fn test_run_unknown_sequence() {
        let (mut driver, mut cpus, mut task) = setup();
        let result = driver.run_sequence(&mut cpus, &mut task, 99);
        assert_eq!(result.run_error, RunError::Sequence);
    }

    #[test]
    fn test_run_nop_cleans_up() {
        let (mut driver, mut cpus, mut task) = setup();
        let ranges = driver.dpt().mappings().len();
        let gen = driver.asi().pgtable_gen();
        let result = driver.run_sequence(&mut cpus, &mut task, Sequence::Nop as u32);
        assert_eq!(result.run_error, RunError::None);
        assert!(result.asi_active);
        assert_eq!(driver.dpt().mappings().len(), ranges);
        // Stack and task mapped, then unmapped
        assert_eq!(driver.asi().pgtable_gen(), gen + 4);
        assert!(cpus[0].session().asi.is_none());
    }

    #[test]
    fn test_interrupt_needs_second_cpu() {
        let (mut driver, mut cpus, mut task) = setup();
        let result = driver.run_sequence(&mut cpus[..1], &mut task, Sequence::Interrupt as u32);
        assert_eq!(result.run_error, RunError::Ncpus);
    }

    #[test]
    fn test_log_fault_stack() {
        let (mut driver, mut cpus, mut task) = setup();
        let mut arg = 1u32.to_le_bytes();
        driver
            .ioctl(&mut cpus, &mut task, IoctlCmd::LogFaultStack as u32, &mut arg)
            .unwrap();
        assert!(driver
            .asi()
            .fault_log_policy()
            .contains(crate::asi::FaultLogPolicy::STACK));

        let mut arg = 0u32.to_le_bytes();
        driver
            .ioctl(&mut cpus, &mut task, IoctlCmd::LogFaultStack as u32, &mut arg)
            .unwrap();
        assert!(!driver
            .asi()
            .fault_log_policy()
            .contains(crate::asi::FaultLogPolicy::STACK));
    }
}
