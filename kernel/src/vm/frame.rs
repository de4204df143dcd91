//! The frame table: which user page each user-pool frame currently backs, and
//! which frame to take back when the pool runs dry.
//!
//! Victims are chosen with the clock algorithm. The hand sweeps the table in
//! frame order; a frame whose page was referenced since the last sweep has its
//! accessed bit cleared and is passed over, and the first unreferenced frame
//! found is evicted. Pinned frames are never chosen.

use super::{
    address_space::{AddressSpace, AddressSpaceInner},
    error::VmError,
    swap::SwapSpace,
};
use crate::mem::{Frame, UserPool};
use crate::sync::mutex::Mutex;
use crate::user_program::process::Pid;
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use log::{debug, trace, warn};

/// Number of times the clock hand may wrap around the table in one eviction
/// pass before giving up.
pub const CLOCK_MAX_WRAPS: usize = 3;

pub struct FrameTableEntry {
    frame: Frame,
    owner: Pid,
    space: Weak<AddressSpace>,
    /// User page the frame backs.
    upage: usize,
    pin_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    /// Frames currently tracked.
    pub entries: usize,
    pub pinned: usize,
    /// Evictions performed since boot.
    pub evictions: u64,
    /// Frames in the user pool.
    pub capacity: usize,
    /// Entries the clock hand examined in the most recent eviction pass.
    pub last_scan_len: usize,
}

struct FrameTableInner {
    /// Indexed by frame number.
    entries: Box<[Option<FrameTableEntry>]>,
    len: usize,
    hand: usize,
    evictions: u64,
    last_scan: usize,
}

impl FrameTableInner {
    fn entry_mut(&mut self, frame: Frame) -> Result<&mut FrameTableEntry, VmError> {
        self.entries
            .get_mut(frame.number())
            .and_then(Option::as_mut)
            .ok_or(VmError::InvariantViolation("frame is not tracked"))
    }

    fn insert(&mut self, entry: FrameTableEntry) -> Result<(), VmError> {
        let slot = self
            .entries
            .get_mut(entry.frame.number())
            .ok_or(VmError::InvariantViolation("frame outside the user pool"))?;
        if slot.is_some() {
            return Err(VmError::InvariantViolation("frame tracked twice"));
        }
        *slot = Some(entry);
        self.len += 1;
        Ok(())
    }

    fn remove(&mut self, index: usize) -> Option<FrameTableEntry> {
        let entry = self.entries.get_mut(index)?.take()?;
        self.len -= 1;
        if self.hand == index {
            self.hand = (index + 1) % self.entries.len();
        }
        Some(entry)
    }
}

/// Result of one clock pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Evicted,
    /// No victim now, but some unpinned frame was skipped because its address
    /// space was in use.
    Busy,
    NoVictim,
}

pub struct FrameTable {
    inner: Mutex<FrameTableInner>,
    pool: UserPool,
    swap: Arc<SwapSpace>,
}

impl FrameTable {
    pub fn new(pool: UserPool, swap: Arc<SwapSpace>) -> Self {
        let entries = (0..pool.capacity()).map(|_| None).collect::<Vec<_>>();
        FrameTable {
            inner: Mutex::new(FrameTableInner {
                entries: entries.into_boxed_slice(),
                len: 0,
                hand: 0,
                evictions: 0,
                last_scan: 0,
            }),
            pool,
            swap,
        }
    }

    pub fn pool(&self) -> &UserPool {
        &self.pool
    }

    /// Hands out a frame to back `upage` in `owner`. When the pool is empty a
    /// frame is evicted first.
    ///
    /// A pinned frame is never chosen for eviction until it is depinned. The
    /// caller must not hold any address space lock: eviction waits for address
    /// spaces that are busy.
    pub fn alloc(
        &self,
        pinned: bool,
        owner: &Arc<AddressSpace>,
        upage: usize,
    ) -> Result<Frame, VmError> {
        let (mut inner, frame) = loop {
            let mut inner = self.inner.lock();
            if let Some(frame) = self.pool.alloc_frame() {
                break (inner, frame);
            }
            let scan = self.evict(&mut inner)?;
            if let Some(frame) = self.pool.alloc_frame() {
                break (inner, frame);
            }
            match scan {
                // Let the owner of the busy address space finish.
                Scan::Busy => {
                    drop(inner);
                    core::hint::spin_loop();
                }
                Scan::Evicted | Scan::NoVictim => return Err(VmError::AllocationError),
            }
        };

        let entry = FrameTableEntry {
            frame,
            owner: owner.pid(),
            space: Arc::downgrade(owner),
            upage,
            pin_count: u32::from(pinned),
        };
        if let Err(err) = inner.insert(entry) {
            self.pool.free_frame(frame);
            return Err(err);
        }
        Ok(frame)
    }

    /// Stops tracking `frame` and returns it to the pool.
    pub fn free(&self, frame: Frame) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        inner
            .remove(frame.number())
            .ok_or(VmError::InvariantViolation("free of an untracked frame"))?;
        self.pool.free_frame(frame);
        Ok(())
    }

    pub fn pin(&self, frame: Frame) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(frame)?;
        entry.pin_count += 1;
        Ok(())
    }

    pub fn depin(&self, frame: Frame) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(frame)?;
        entry.pin_count = entry.pin_count.saturating_sub(1);
        Ok(())
    }

    pub fn is_tracked(&self, frame: Frame) -> bool {
        self.inner.lock().entry_mut(frame).is_ok()
    }

    pub fn is_pinned(&self, frame: Frame) -> bool {
        self.inner
            .lock()
            .entry_mut(frame)
            .is_ok_and(|entry| entry.pin_count > 0)
    }

    pub fn frames_owned_by(&self, pid: Pid) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .flatten()
            .filter(|entry| entry.owner == pid)
            .count()
    }

    pub fn stats(&self) -> FrameStats {
        let inner = self.inner.lock();
        FrameStats {
            entries: inner.len,
            pinned: inner
                .entries
                .iter()
                .flatten()
                .filter(|entry| entry.pin_count > 0)
                .count(),
            evictions: inner.evictions,
            capacity: self.pool.capacity(),
            last_scan_len: inner.last_scan,
        }
    }

    /// Runs one clock pass and evicts the first victim found.
    fn evict(&self, inner: &mut FrameTableInner) -> Result<Scan, VmError> {
        let capacity = inner.entries.len();
        let mut wraps = 0;
        let mut examined = 0;
        let mut busy = false;

        while inner.len > 0 {
            if inner.hand >= capacity {
                inner.hand = 0;
                wraps += 1;
                if wraps >= CLOCK_MAX_WRAPS {
                    break;
                }
            }
            let index = inner.hand;
            inner.hand += 1;

            let Some(entry) = &inner.entries[index] else {
                continue;
            };
            examined += 1;
            if entry.pin_count > 0 {
                continue;
            }
            let (frame, upage, owner) = (entry.frame, entry.upage, entry.owner);

            let Some(space) = entry.space.upgrade() else {
                warn!(
                    "Reclaiming {:?} from process {} whose address space is gone",
                    frame, owner
                );
                inner.remove(index);
                self.pool.free_frame(frame);
                inner.last_scan = examined;
                return Ok(Scan::Evicted);
            };
            // The owner may be waiting on this table with its own lock held.
            let Some(mut space_inner) = space.try_lock() else {
                busy = true;
                continue;
            };
            if space_inner.page_table.find(upage).and_then(|p| p.frame()) != Some(frame) {
                // Detached by a teardown that has not freed the frame yet.
                busy = true;
                continue;
            }
            if space_inner.page_manager.is_accessed(upage) {
                space_inner.page_manager.set_accessed(upage, false);
                continue;
            }

            inner.last_scan = examined;
            self.evict_victim(inner, index, &mut space_inner)?;
            return Ok(Scan::Evicted);
        }

        inner.last_scan = examined;
        if busy {
            trace!("Clock skipped frames of busy address spaces, retrying");
            return Ok(Scan::Busy);
        }
        debug!(
            "Clock found no victim after examining {} entries",
            examined
        );
        Ok(Scan::NoVictim)
    }

    fn evict_victim(
        &self,
        inner: &mut FrameTableInner,
        index: usize,
        space: &mut AddressSpaceInner,
    ) -> Result<(), VmError> {
        let Some(entry) = &inner.entries[index] else {
            return Err(VmError::InvariantViolation("victim vanished"));
        };
        let (frame, upage, owner) = (entry.frame, entry.upage, entry.owner);

        let slot = if space.page_manager.is_dirty(upage) {
            Some(
                self.pool
                    .with_frame(frame, |bytes| self.swap.swap_out(bytes))?,
            )
        } else {
            None
        };

        space.page_manager.unmap(upage);
        if let Some(page) = space.page_table.find_mut(upage) {
            page.evicted(slot);
        }
        self.pool.free_frame(frame);
        inner.remove(index);
        inner.evictions += 1;

        match slot {
            Some(slot) => debug!(
                "Evicted page {:#x} of process {} from {:?} to swap sector {}",
                upage,
                owner,
                frame,
                slot.sector()
            ),
            None => debug!(
                "Dropped clean page {:#x} of process {} from {:?}",
                upage, owner, frame
            ),
        }
        Ok(())
    }
}
