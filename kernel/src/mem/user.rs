//! Kernel access to user buffers.
//!
//! Each page of the buffer is faulted in if needed and its frame is pinned
//! for the duration of the copy, so eviction cannot take it away midway.

use crate::mem::Frame;
use crate::vm::{fault::handle_page_fault, AddressSpace, VirtualMemory, VmError};
use alloc::{sync::Arc, vec::Vec};
use vmkernel_shared::mem::{page_offset, OFFSET, PAGE_FRAME_SIZE};

fn check_user_range(pointer: usize, count: usize) -> Result<(), VmError> {
    match pointer.checked_add(count) {
        Some(end) if end <= OFFSET => Ok(()),
        _ => Err(VmError::InvalidAccess(pointer)),
    }
}

/// Pins the frame backing `addr`, loading the page first if it is not
/// resident. Marks the page accessed, and dirty for writes.
fn pin_user_page(
    vm: &VirtualMemory,
    space: &Arc<AddressSpace>,
    addr: usize,
    write: bool,
) -> Result<Frame, VmError> {
    loop {
        {
            let mut inner = space.lock();
            if let Some(frame) = inner.page_manager.translate(addr) {
                if write && !inner.page_manager.is_writable(addr) {
                    return Err(VmError::ReadOnly(addr));
                }
                vm.frames().pin(frame)?;
                inner.page_manager.set_accessed(addr, true);
                if write {
                    inner.page_manager.set_dirty(addr, true);
                }
                return Ok(frame);
            }
        }
        handle_page_fault(vm, space, addr)?;
    }
}

fn for_each_user_chunk(
    vm: &VirtualMemory,
    space: &Arc<AddressSpace>,
    pointer: usize,
    count: usize,
    write: bool,
    mut f: impl FnMut(&mut [u8], usize),
) -> Result<(), VmError> {
    check_user_range(pointer, count)?;

    let mut done = 0;
    while done < count {
        let addr = pointer + done;
        let offset = page_offset(addr);
        let len = (PAGE_FRAME_SIZE - offset).min(count - done);

        let frame = pin_user_page(vm, space, addr, write)?;
        vm.pool()
            .with_frame(frame, |bytes| f(&mut bytes[offset..offset + len], done));
        vm.frames().depin(frame)?;

        done += len;
    }
    Ok(())
}

/// Copies `count` bytes starting at user address `pointer` into kernel memory.
pub fn copy_from_user(
    vm: &VirtualMemory,
    space: &Arc<AddressSpace>,
    pointer: usize,
    count: usize,
) -> Result<Vec<u8>, VmError> {
    let mut out = Vec::with_capacity(count);
    for_each_user_chunk(vm, space, pointer, count, false, |chunk, _| {
        out.extend_from_slice(chunk)
    })?;
    Ok(out)
}

/// Copies `data` to user memory starting at `pointer`.
pub fn copy_to_user(
    vm: &VirtualMemory,
    space: &Arc<AddressSpace>,
    pointer: usize,
    data: &[u8],
) -> Result<(), VmError> {
    for_each_user_chunk(vm, space, pointer, data.len(), true, |chunk, done| {
        chunk.copy_from_slice(&data[done..done + chunk.len()])
    })
}
