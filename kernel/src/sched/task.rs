//! Task control block

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{asi::session::AsiSession, mm::VirtualAddress};

/// Kernel stack size of a task (16 KiB)
pub const THREAD_SIZE: usize = 4 * crate::mm::PAGE_SIZE;

/// Size of the task control block as seen by page-table code
pub const TASK_STRUCT_SIZE: usize = 0x1a00;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

/// Task control block
///
/// Only the parts the isolation engine needs are modelled: where the task
/// and its kernel stack live, the CPU it is bound to, and the ASI session
/// saved while the task is scheduled out.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    /// Address of the task control block
    pub task_struct: VirtualAddress,
    /// Base of the kernel stack
    pub stack: VirtualAddress,
    pub stack_size: usize,
    /// CPU the task is bound to
    pub cpu: usize,
    pub(crate) asi_session: AsiSession,
}

impl Task {
    pub fn new(task_struct: VirtualAddress, stack: VirtualAddress, cpu: usize) -> Self {
        Self {
            id: TaskId(NEXT_TID.fetch_add(1, Ordering::Relaxed)),
            task_struct,
            stack,
            stack_size: THREAD_SIZE,
            cpu,
            asi_session: AsiSession::default(),
        }
    }

    /// Top of the kernel stack
    pub fn stack_top(&self) -> VirtualAddress {
        self.stack.add(self.stack_size)
    }

    /// ASI session saved when the task was scheduled out
    pub fn asi_session(&self) -> &AsiSession {
        &self.asi_session
    }
}
