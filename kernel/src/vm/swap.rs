//! Swap space on a block device.
//!
//! The device is split into page-sized groups of [`SECTORS_PER_PAGE`]
//! consecutive sectors. A bitmap with one bit per sector records which
//! sectors hold live page data; a group is reserved and released as a whole.

use super::error::VmError;
use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::mutex::Mutex;
use bitvec::prelude::*;
use core::ops::Range;
use log::{debug, info};
use vmkernel_shared::mem::PAGE_FRAME_SIZE;

/// Number of sectors holding one page.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// First sector of a reserved group on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(BlockSector);

impl SwapSlot {
    pub fn sector(self) -> BlockSector {
        self.0
    }

    fn sectors(self) -> Range<usize> {
        let start = self.0 as usize;
        start..start + SECTORS_PER_PAGE
    }
}

struct SwapInner {
    device: Block,
    used: BitVec<usize, Lsb0>,
}

impl SwapInner {
    /// Finds the first run of free sectors large enough for a page and marks
    /// it used.
    fn scan_and_flip(&mut self) -> Option<SwapSlot> {
        let start = self
            .used
            .windows(SECTORS_PER_PAGE)
            .position(|window| window.not_any())?;
        self.used[start..start + SECTORS_PER_PAGE].fill(true);
        Some(SwapSlot(start as BlockSector))
    }

    fn is_reserved(&self, slot: SwapSlot) -> bool {
        self.used
            .get(slot.sectors())
            .is_some_and(|bits| bits.all())
    }

    fn release(&mut self, slot: SwapSlot) -> Result<(), VmError> {
        if !self.is_reserved(slot) {
            return Err(VmError::InvariantViolation(
                "release of a swap slot that is not reserved",
            ));
        }
        self.used[slot.sectors()].fill(false);
        Ok(())
    }
}

pub struct SwapSpace {
    inner: Mutex<SwapInner>,
}

impl SwapSpace {
    pub fn new(device: Block) -> Self {
        let sectors = device.get_size() as usize;
        info!(
            "Swap space on \"{}\": {} sectors, {} page slots",
            device.get_name(),
            sectors,
            sectors / SECTORS_PER_PAGE
        );

        SwapSpace {
            inner: Mutex::new(SwapInner {
                device,
                used: bitvec![usize, Lsb0; 0; sectors],
            }),
        }
    }

    /// Writes `page` to a freshly reserved group and returns its slot.
    ///
    /// Fails with [`VmError::SwapExhausted`] when no group of free sectors is
    /// left. A device error releases the group again before returning.
    pub fn swap_out(&self, page: &[u8; PAGE_FRAME_SIZE]) -> Result<SwapSlot, VmError> {
        let mut inner = self.inner.lock();
        let slot = inner.scan_and_flip().ok_or(VmError::SwapExhausted)?;

        for (i, chunk) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            if let Err(err) = inner.device.write(slot.sector() + i as BlockSector, chunk) {
                inner.release(slot)?;
                return Err(err.into());
            }
        }

        debug!("swap: page written to sector {}", slot.sector());
        Ok(slot)
    }

    /// Reads the page stored at `slot` into `page` and releases the slot. A
    /// slot can be read only once.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8; PAGE_FRAME_SIZE]) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        if !inner.is_reserved(slot) {
            return Err(VmError::InvariantViolation(
                "swap in from a slot that is not reserved",
            ));
        }

        for (i, chunk) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            inner.device.read(slot.sector() + i as BlockSector, chunk)?;
        }
        inner.release(slot)?;

        debug!("swap: page read from sector {}", slot.sector());
        Ok(())
    }

    /// Releases `slot` without reading it.
    pub fn swap_set(&self, slot: SwapSlot) -> Result<(), VmError> {
        self.inner.lock().release(slot)?;
        debug!("swap: sector {} discarded", slot.sector());
        Ok(())
    }

    pub fn is_reserved(&self, slot: SwapSlot) -> bool {
        self.inner.lock().is_reserved(slot)
    }

    pub fn used_sectors(&self) -> usize {
        self.inner.lock().used.count_ones()
    }

    pub fn used_slots(&self) -> usize {
        self.used_sectors() / SECTORS_PER_PAGE
    }

    pub fn capacity_slots(&self) -> usize {
        self.inner.lock().used.len() / SECTORS_PER_PAGE
    }

    /// Sector reads and writes issued to the device so far.
    pub fn device_counts(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.device.get_read_count(), inner.device.get_write_count())
    }

    #[cfg(test)]
    fn with_device<R>(&self, f: impl FnOnce(&mut Block) -> R) -> R {
        f(&mut self.inner.lock().device)
    }
}
