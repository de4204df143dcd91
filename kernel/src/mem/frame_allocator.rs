//! The user frame pool: a fixed set of physical page frames handed out one at
//! a time to back user pages.

mod placement_algorithms;

use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, vec::Vec};
use bitbybit::bitfield;
use core::fmt;
use log::info;
use placement_algorithms::{NextFit, PlacementAlgorithm};
use vmkernel_shared::mem::{PAGE_FRAME_SIZE, USER_POOL_BASE};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    pub allocated: bool,
    #[bit(1, rw)]
    pub user: bool,
}

/// A physical page frame from the user pool, identified by its frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(usize);

impl Frame {
    pub const fn number(self) -> usize {
        self.0
    }

    /// Physical address of the first byte of the frame.
    pub const fn phys_addr(self) -> usize {
        USER_POOL_BASE + self.0 * PAGE_FRAME_SIZE
    }

    /// The frame whose first byte is at `phys_addr`, if it belongs to the user pool.
    pub fn from_phys_addr(phys_addr: usize) -> Option<Self> {
        let offset = phys_addr.checked_sub(USER_POOL_BASE)?;
        (offset % PAGE_FRAME_SIZE == 0).then_some(Frame(offset / PAGE_FRAME_SIZE))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Frame({}@{:#x})", self.0, self.phys_addr())
    }
}

struct PoolState {
    core_map: Box<[CoreMapEntry]>,
    placement: NextFit,
    frames_allocated: usize,
}

pub type FrameMemory = [u8; PAGE_FRAME_SIZE];

pub struct UserPool {
    state: Mutex<PoolState>,
    memory: Box<[Mutex<Box<FrameMemory>>]>,
}

impl UserPool {
    pub fn new(frames: usize) -> Self {
        let memory: Vec<_> = (0..frames)
            .map(|_| Mutex::new(Box::new([0; PAGE_FRAME_SIZE])))
            .collect();

        info!(
            "User pool: {} frames at {:#x}",
            frames, USER_POOL_BASE
        );

        UserPool {
            state: Mutex::new(PoolState {
                core_map: alloc::vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
                placement: NextFit::default(),
                frames_allocated: 0,
            }),
            memory: memory.into_boxed_slice(),
        }
    }

    /// Takes one free frame out of the pool. Returns [`None`] if every frame is in use.
    pub fn alloc_frame(&self) -> Option<Frame> {
        let mut state = self.state.lock();
        let state = &mut *state;
        if state.frames_allocated == state.core_map.len() {
            return None;
        }

        let range = state.placement.place(&state.core_map, 1)?;
        for i in range.clone() {
            assert!(!state.core_map[i].allocated());
            state.core_map[i] = state.core_map[i].with_allocated(true).with_user(true);
        }
        state.frames_allocated += range.len();

        Some(Frame(range.start))
    }

    /// Returns `frame` to the pool.
    ///
    /// Panics if the frame is not currently allocated.
    pub fn free_frame(&self, frame: Frame) {
        let mut state = self.state.lock();
        let entry = state.core_map[frame.0];
        assert!(entry.allocated(), "double free of {:?}", frame);
        state.core_map[frame.0] = CoreMapEntry::DEFAULT;
        state.frames_allocated -= 1;
    }

    /// Runs `f` with exclusive access to the contents of `frame`.
    pub fn with_frame<R>(&self, frame: Frame, f: impl FnOnce(&mut FrameMemory) -> R) -> R {
        let mut memory = self.memory[frame.0].lock();
        f(&mut memory)
    }

    pub fn is_allocated(&self, frame: Frame) -> bool {
        self.state
            .lock()
            .core_map
            .get(frame.0)
            .is_some_and(|entry| entry.allocated())
    }

    pub fn frames_allocated(&self) -> usize {
        self.state.lock().frames_allocated
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }
}

impl fmt::Debug for UserPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UserPool")
            .field("capacity", &self.capacity())
            .field("frames_allocated", &self.frames_allocated())
            .finish()
    }
}
