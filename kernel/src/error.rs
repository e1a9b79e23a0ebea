//! Error types for the address space isolation kernel
//!
//! Every fallible operation of the DPT and ASI engines reports a
//! [`KernelError`]. Variants carry enough context to produce a useful
//! diagnostic without allocating.

use core::fmt;

use crate::mm::frame_allocator::FrameAllocatorError;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Misaligned pointer or size, bad table alignment, null page.
    InvalidArgument {
        name: &'static str,
        value: u64,
    },

    /// The exact same (pointer, size) range is already mapped.
    AlreadyMapped {
        addr: u64,
        size: u64,
    },

    /// A backend page is registered twice.
    AlreadyOwned {
        addr: u64,
    },

    /// Attempt to overwrite a different, already-present page-table entry.
    Conflict {
        addr: u64,
        current: u64,
        new: u64,
    },

    /// Frame allocation failure while growing a page table.
    OutOfMemory {
        requested: usize,
        available: usize,
    },

    /// Another ASI is already active on this CPU.
    Busy {
        cpu: usize,
    },

    /// An internal pointer does not belong to any tracked object.
    NotFound {
        resource: &'static str,
        id: u64,
    },

    /// Registration of something that must be unique.
    AlreadyExists {
        resource: &'static str,
        id: u64,
    },

    /// No translation for the address in the page table consulted.
    UnmappedMemory {
        addr: u64,
    },

    /// Administrative test harness timeout.
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },

    /// Unknown administrative test sequence.
    SequenceError {
        sequence: u32,
    },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': 0x{:x}", name, value)
            }
            Self::AlreadyMapped { addr, size } => {
                write!(f, "Range 0x{:x}/0x{:x} is already mapped", addr, size)
            }
            Self::AlreadyOwned { addr } => {
                write!(f, "Page 0x{:x} is already a backend page", addr)
            }
            Self::Conflict { addr, current, new } => write!(
                f,
                "Entry at 0x{:x}: overwriting 0x{:x} with 0x{:x}",
                addr, current, new
            ),
            Self::OutOfMemory {
                requested,
                available,
            } => {
                write!(
                    f,
                    "Out of memory: requested {} bytes, {} available",
                    requested, available
                )
            }
            Self::Busy { cpu } => write!(f, "Another ASI is active on CPU {}", cpu),
            Self::NotFound { resource, id } => write!(f, "{} 0x{:x} not found", resource, id),
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} with id {} already exists", resource, id)
            }
            Self::UnmappedMemory { addr } => write!(f, "Unmapped memory at 0x{:x}", addr),
            Self::Timeout {
                operation,
                duration_ms,
            } => {
                write!(f, "Timeout during {}: {} ms", operation, duration_ms)
            }
            Self::SequenceError { sequence } => write!(f, "Unknown sequence {}", sequence),
        }
    }
}

impl From<FrameAllocatorError> for KernelError {
    fn from(err: FrameAllocatorError) -> Self {
        match err {
            FrameAllocatorError::OutOfMemory {
                requested,
                available,
            } => Self::OutOfMemory {
                requested: requested * crate::mm::PAGE_SIZE,
                available: available * crate::mm::PAGE_SIZE,
            },
            FrameAllocatorError::InvalidFrame { addr } => Self::InvalidArgument {
                name: "frame",
                value: addr,
            },
            FrameAllocatorError::InvalidCount { count } => Self::InvalidArgument {
                name: "frame count",
                value: count as u64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display_conflict() {
        let err = KernelError::Conflict {
            addr: 0x1000,
            current: 0x2003,
            new: 0x3003,
        };
        assert_eq!(
            err.to_string(),
            "Entry at 0x1000: overwriting 0x2003 with 0x3003"
        );
    }

    #[test]
    fn test_frame_error_conversion() {
        let err: KernelError = FrameAllocatorError::OutOfMemory {
            requested: 2,
            available: 1,
        }
        .into();
        assert_eq!(
            err,
            KernelError::OutOfMemory {
                requested: 8192,
                available: 4096
            }
        );
    }
}
