//! Demand paging for user processes.
//!
//! User pages start out registered in their process's supplemental page table
//! and get a frame only when first touched. [`fault::handle_page_fault`] fills
//! the frame from the backing file, from swap or with zeros. When the user
//! pool runs dry the [`frame::FrameTable`] picks a victim with the clock
//! algorithm and, if the victim was written to, saves it to the swap device.
//!
//! Locks are always taken in this order:
//! frame table, address space, frame contents, swap, user pool. The frame
//! table only ever try-locks an address space, so holding an address space
//! while calling into the frame table is allowed.

pub mod address_space;
pub mod error;
pub mod fault;
pub mod frame;
pub mod page;
pub mod swap;

pub use address_space::AddressSpace;
pub use error::{Severity, VmError};

use crate::block::block_core::{Block, BlockManager, BlockType};
use crate::mem::UserPool;
use alloc::{boxed::Box, sync::Arc};
use frame::FrameTable;
use log::info;
use once_cell::race::OnceBox;
use swap::SwapSpace;
use vmkernel_shared::sizes::USER_POOL_FRAMES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Frames in the user pool.
    pub user_frames: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            user_frames: USER_POOL_FRAMES,
        }
    }
}

pub struct VirtualMemory {
    frames: FrameTable,
    swap: Arc<SwapSpace>,
}

impl VirtualMemory {
    pub fn new(config: VmConfig, swap_device: Block) -> Self {
        let swap = Arc::new(SwapSpace::new(swap_device));
        let frames = FrameTable::new(UserPool::new(config.user_frames), swap.clone());
        VirtualMemory { frames, swap }
    }

    /// Builds the subsystem on the first swap device registered with `blocks`,
    /// taking that device out of the manager.
    pub fn from_block_manager(
        config: VmConfig,
        blocks: &mut BlockManager,
    ) -> Result<Self, VmError> {
        let device = blocks
            .take_by_type(BlockType::Swap)
            .ok_or(VmError::NoSwapDevice)?;
        Ok(Self::new(config, device))
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn pool(&self) -> &UserPool {
        self.frames.pool()
    }
}

static VM: OnceBox<VirtualMemory> = OnceBox::new();

/// Sets up the global virtual memory subsystem. Fails if no swap device is
/// registered or if it was already set up.
pub fn init(
    config: VmConfig,
    blocks: &mut BlockManager,
) -> Result<&'static VirtualMemory, VmError> {
    if VM.get().is_some() {
        return Err(VmError::InvariantViolation("virtual memory initialized twice"));
    }
    let vm = VirtualMemory::from_block_manager(config, blocks)?;
    VM.set(Box::new(vm))
        .map_err(|_| VmError::InvariantViolation("virtual memory initialized twice"))?;
    info!("Virtual memory initialized with {} user frames", config.user_frames);
    VM.get()
        .ok_or(VmError::InvariantViolation("virtual memory not initialized"))
}

/// The global virtual memory subsystem.
///
/// Panics if [`init`] has not run.
pub fn get() -> &'static VirtualMemory {
    VM.get().expect("Virtual memory not initialized.")
}
