use super::{page::FillSource, swap::SwapSlot, AddressSpace, VirtualMemory, VmError};
use alloc::sync::Arc;
use log::trace;
use vmkernel_shared::mem::{is_user_vaddr, page_round_down};

enum Lookup {
    /// Another thread is loading the page.
    Busy,
    /// The page became resident while the faulting access was in flight.
    Resident,
    Load { source: FillSource, writable: bool },
}

/// Brings in the page containing `fault_addr` after a not-present fault.
///
/// Fails with [`VmError::InvalidAccess`] if no page is registered there.
pub fn handle_page_fault(
    vm: &VirtualMemory,
    space: &Arc<AddressSpace>,
    fault_addr: usize,
) -> Result<(), VmError> {
    if !is_user_vaddr(fault_addr) {
        return Err(VmError::InvalidAccess(fault_addr));
    }
    let upage = page_round_down(fault_addr);

    let (source, writable) = loop {
        let lookup = {
            let mut guard = space.lock();
            let inner = &mut *guard;
            match inner.page_table.find_mut(upage) {
                None => return Err(VmError::InvalidAccess(fault_addr)),
                Some(page) if page.is_loading() => Lookup::Busy,
                Some(page) => match page.frame() {
                    Some(frame) if inner.page_manager.translate(upage) == Some(frame) => {
                        Lookup::Resident
                    }
                    Some(_) => {
                        return Err(VmError::InvariantViolation(
                            "resident page has no mapping",
                        ))
                    }
                    None => Lookup::Load {
                        source: page.begin_load(),
                        writable: page.writable(),
                    },
                },
            }
        };

        match lookup {
            Lookup::Busy => core::hint::spin_loop(),
            Lookup::Resident => return Ok(()),
            Lookup::Load { source, writable } => break (source, writable),
        }
    };

    trace!(
        "Process {}: loading page {:#x}{}",
        space.pid(),
        upage,
        if source.is_swap() { " from swap" } else { "" }
    );

    let frame = match vm.frames().alloc(true, space, upage) {
        Ok(frame) => frame,
        Err(err) => {
            abort_load(space, upage, source.swap_slot());
            return Err(err);
        }
    };

    if let Err(err) = vm
        .pool()
        .with_frame(frame, |bytes| source.fill(vm.swap(), bytes))
    {
        let slot = source
            .swap_slot()
            .filter(|&slot| vm.swap().is_reserved(slot));
        abort_load(space, upage, slot);
        vm.frames().free(frame)?;
        return Err(err);
    }

    {
        let mut guard = space.lock();
        let inner = &mut *guard;
        if !inner.page_manager.map(frame, upage, writable) {
            return Err(VmError::InvariantViolation("loaded page already mapped"));
        }
        // Swap no longer holds a copy, so the page must be written back if evicted.
        if source.is_swap() {
            inner.page_manager.set_dirty(upage, true);
        }
        let page = inner
            .page_table
            .find_mut(upage)
            .ok_or(VmError::InvariantViolation("page vanished while loading"))?;
        page.finish_load(frame);
    }

    vm.frames().depin(frame)
}

fn abort_load(space: &AddressSpace, upage: usize, slot: Option<SwapSlot>) {
    if let Some(page) = space.lock().page_table.find_mut(upage) {
        page.abort_load(slot);
    }
}
