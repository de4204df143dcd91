use crate::block::block_error::BlockError;
use thiserror::Error;

/// Who a failed virtual memory operation takes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The faulting process is terminated; the kernel carries on.
    Process,
    /// The kernel cannot continue.
    Kernel,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("no frame available and nothing could be evicted")]
    AllocationError,
    #[error("swap device is full")]
    SwapExhausted,
    #[error("swap device: {0}")]
    Device(#[from] BlockError),
    #[error("no swap device registered")]
    NoSwapDevice,
    #[error("internal invariant violated: {0}")]
    InvariantViolation(&'static str),
    #[error("access to unmapped address {0:#x}")]
    InvalidAccess(usize),
    #[error("write to read-only page at {0:#x}")]
    ReadOnly(usize),
    #[error("short read from backing file at offset {0}")]
    FileRead(u64),
    #[error("page {0:#x} is already registered")]
    PageAlreadyRegistered(usize),
    #[error("bad page layout at {0:#x}")]
    BadPageLayout(usize),
}

impl VmError {
    pub fn severity(&self) -> Severity {
        match self {
            VmError::InvalidAccess(_)
            | VmError::ReadOnly(_)
            | VmError::FileRead(_)
            | VmError::PageAlreadyRegistered(_)
            | VmError::BadPageLayout(_) => Severity::Process,
            VmError::AllocationError
            | VmError::SwapExhausted
            | VmError::Device(_)
            | VmError::NoSwapDevice
            | VmError::InvariantViolation(_) => Severity::Kernel,
        }
    }
}
