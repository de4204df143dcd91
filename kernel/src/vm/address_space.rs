use super::{error::VmError, page::SupplementalPageTable, VirtualMemory};
use crate::fs::File;
use crate::paging::PageManager;
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::user_program::process::Pid;
use alloc::sync::Arc;
use core::mem;
use log::debug;

/// The user half of one process's memory: its supplemental page table and the
/// page tables the MMU walks, behind a single lock.
pub struct AddressSpace {
    pid: Pid,
    inner: Mutex<AddressSpaceInner>,
}

#[derive(Default)]
pub struct AddressSpaceInner {
    pub page_table: SupplementalPageTable,
    pub page_manager: PageManager,
}

impl AddressSpace {
    pub fn new(pid: Pid) -> Arc<Self> {
        Arc::new(AddressSpace {
            pid,
            inner: Mutex::default(),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn lock(&self) -> MutexGuard<AddressSpaceInner> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<AddressSpaceInner>> {
        self.inner.try_lock()
    }

    pub fn register_lazy(
        &self,
        vaddr: usize,
        file: Option<Arc<dyn File>>,
        file_offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        self.lock().page_table.register_lazy(
            vaddr,
            file,
            file_offset,
            read_bytes,
            zero_bytes,
            writable,
        )
    }

    /// Releases every frame and swap slot the address space holds, then drops
    /// its page tables. The page tables stay intact until the supplemental
    /// table has been fully torn down.
    ///
    /// The supplemental table is detached first and released without the
    /// address space lock held.
    pub fn destroy(&self, vm: &VirtualMemory) -> Result<(), VmError> {
        let mut detached = mem::take(&mut self.lock().page_table);
        let pages = detached.len();
        let result = detached.teardown(vm.frames(), vm.swap());
        self.lock().page_manager.clear();
        debug!("Destroyed address space of process {} ({} pages)", self.pid, pages);
        result
    }
}
