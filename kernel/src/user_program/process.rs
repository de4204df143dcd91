use super::loader::{self, LoadError, ProgramSegment};
use crate::fs::File;
use crate::mem::user::{copy_from_user, copy_to_user};
use crate::vm::{fault, AddressSpace, Severity, VirtualMemory, VmError};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU16, Ordering};
use log::{error, warn};

pub type Pid = u16;
pub type AtomicPid = AtomicU16;

/// Exit status of a process killed by the kernel.
pub const KILLED_EXIT_CODE: i32 = -1;

pub struct ProcessState {
    next_pid: AtomicPid,
}

impl Default for ProcessState {
    fn default() -> Self {
        ProcessState {
            next_pid: AtomicPid::new(1),
        }
    }
}

impl ProcessState {
    pub fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid == 0 {
            panic!("PID overflow");
        }
        pid
    }
}

/// What a page fault did to the process that took it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The faulting instruction can be retried.
    Resolved,
    /// The process was killed with the given exit status.
    Terminated(i32),
}

pub struct Process {
    pid: Pid,
    address_space: Arc<AddressSpace>,
    exit_code: Option<i32>,
}

impl Process {
    pub fn new(state: &ProcessState) -> Self {
        let pid = state.allocate_pid();
        Process {
            pid,
            address_space: AddressSpace::new(pid),
            exit_code: None,
        }
    }

    /// Creates a process with `segments` of `file` registered for lazy
    /// loading. Returns it with its initial stack pointer.
    pub fn load(
        state: &ProcessState,
        file: &Arc<dyn File>,
        segments: &[ProgramSegment],
    ) -> Result<(Self, usize), LoadError> {
        let process = Self::new(state);
        let esp = loader::load(&process.address_space, file, segments)?;
        Ok((process, esp))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.address_space
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code.is_some()
    }

    /// Entry point for a not-present fault at `addr` taken by this process.
    ///
    /// Panics if the fault exposes a kernel-level failure.
    pub fn page_fault(&mut self, vm: &VirtualMemory, addr: usize) -> FaultOutcome {
        match fault::handle_page_fault(vm, &self.address_space, addr) {
            Ok(()) => FaultOutcome::Resolved,
            Err(err) => self.kill_or_panic(vm, err),
        }
    }

    /// Reads a user buffer on behalf of a system call. Returns [`None`] if the
    /// process was killed because the buffer is invalid.
    pub fn read_user(&mut self, vm: &VirtualMemory, pointer: usize, count: usize) -> Option<Vec<u8>> {
        match copy_from_user(vm, &self.address_space, pointer, count) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                self.kill_or_panic(vm, err);
                None
            }
        }
    }

    /// Writes a user buffer on behalf of a system call. Returns `false` if the
    /// process was killed because the buffer is invalid.
    pub fn write_user(&mut self, vm: &VirtualMemory, pointer: usize, data: &[u8]) -> bool {
        match copy_to_user(vm, &self.address_space, pointer, data) {
            Ok(()) => true,
            Err(err) => {
                self.kill_or_panic(vm, err);
                false
            }
        }
    }

    fn kill_or_panic(&mut self, vm: &VirtualMemory, err: VmError) -> FaultOutcome {
        match err.severity() {
            Severity::Process => {
                warn!("Process {} killed: {}", self.pid, err);
                self.exit(vm, KILLED_EXIT_CODE);
                FaultOutcome::Terminated(KILLED_EXIT_CODE)
            }
            Severity::Kernel => {
                error!("Process {}: unrecoverable memory failure: {}", self.pid, err);
                panic!("virtual memory failure: {}", err);
            }
        }
    }

    /// Releases everything the process holds in memory and swap and records
    /// its exit status. Exiting twice has no further effect.
    pub fn exit(&mut self, vm: &VirtualMemory, status: i32) {
        if self.has_exited() {
            return;
        }
        if let Err(err) = self.address_space.destroy(vm) {
            error!("Process {}: teardown failed: {}", self.pid, err);
            panic!("process teardown failed: {}", err);
        }
        self.exit_code = Some(status);
    }
}
