//! The supplemental page table: everything the kernel knows about a user page
//! beyond what the hardware page table records.

use super::{error::VmError, frame::FrameTable, swap::SwapSlot, swap::SwapSpace};
use crate::fs::File;
use crate::mem::Frame;
use alloc::{collections::BTreeMap, sync::Arc};
use core::fmt;
use log::debug;
use vmkernel_shared::mem::{is_user_vaddr, page_offset, page_round_down, PAGE_FRAME_SIZE};

/// Where the contents of a page currently live. A page is never both resident
/// and in swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Not in memory. Contents come from the backing file or zero fill.
    Unloaded,
    /// Backed by a frame and mapped in the owner's page table.
    Resident(Frame),
    /// Written out to swap.
    Swapped(SwapSlot),
}

pub struct SupPageTableEntry {
    vaddr: usize,
    file: Option<Arc<dyn File>>,
    file_offset: u64,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
    state: PageState,
    /// Set while a fault is filling a frame for this page.
    loading: bool,
}

/// What a fault has to copy into a fresh frame to bring a page in.
pub enum FillSource {
    Swap(SwapSlot),
    File {
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: usize,
    },
    Zero,
}

impl FillSource {
    pub fn is_swap(&self) -> bool {
        self.swap_slot().is_some()
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self {
            FillSource::Swap(slot) => Some(*slot),
            _ => None,
        }
    }

    /// Fills `bytes` with the page contents. Bytes past the file data are zeroed.
    pub fn fill(&self, swap: &SwapSpace, bytes: &mut [u8; PAGE_FRAME_SIZE]) -> Result<(), VmError> {
        match self {
            FillSource::Swap(slot) => swap.swap_in(*slot, bytes),
            FillSource::File {
                file,
                offset,
                read_bytes,
            } => {
                let (data, rest) = bytes.split_at_mut(*read_bytes);
                if file.read(*offset, data) != *read_bytes {
                    return Err(VmError::FileRead(*offset));
                }
                rest.fill(0);
                Ok(())
            }
            FillSource::Zero => {
                bytes.fill(0);
                Ok(())
            }
        }
    }
}

impl SupPageTableEntry {
    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    pub fn zero_bytes(&self) -> usize {
        self.zero_bytes
    }

    pub fn is_file_backed(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, PageState::Resident(_))
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn frame(&self) -> Option<Frame> {
        match self.state {
            PageState::Resident(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.state {
            PageState::Swapped(slot) => Some(slot),
            _ => None,
        }
    }

    /// Marks the page as being loaded and returns where its contents come from.
    /// A swap slot moves into the returned source, since reading it frees it.
    pub(super) fn begin_load(&mut self) -> FillSource {
        self.loading = true;
        match (self.state, &self.file) {
            (PageState::Swapped(slot), _) => {
                self.state = PageState::Unloaded;
                FillSource::Swap(slot)
            }
            (_, Some(file)) if self.read_bytes > 0 => FillSource::File {
                file: file.clone(),
                offset: self.file_offset,
                read_bytes: self.read_bytes,
            },
            _ => FillSource::Zero,
        }
    }

    pub(super) fn finish_load(&mut self, frame: Frame) {
        self.state = PageState::Resident(frame);
        self.loading = false;
    }

    /// Gives up on a load. `slot` is handed back if the contents are still in
    /// swap.
    pub(super) fn abort_load(&mut self, slot: Option<SwapSlot>) {
        if let Some(slot) = slot {
            self.state = PageState::Swapped(slot);
        }
        self.loading = false;
    }

    /// Records that the page's frame was taken away, with the slot holding its
    /// contents if they had to be saved.
    pub(super) fn evicted(&mut self, slot: Option<SwapSlot>) {
        self.state = match slot {
            Some(slot) => PageState::Swapped(slot),
            None => PageState::Unloaded,
        };
    }
}

impl fmt::Debug for SupPageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SupPageTableEntry")
            .field("vaddr", &format_args!("{:#x}", self.vaddr))
            .field("file_backed", &self.file.is_some())
            .field("file_offset", &self.file_offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .field("writable", &self.writable)
            .field("state", &self.state)
            .field("loading", &self.loading)
            .finish()
    }
}

/// Per-process table of user pages, keyed by page address.
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<usize, SupPageTableEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a page that is brought in on first access: `read_bytes` from
    /// `file` at `file_offset` followed by `zero_bytes` of zeros. A page with
    /// no file is zero-filled.
    pub fn register_lazy(
        &mut self,
        vaddr: usize,
        file: Option<Arc<dyn File>>,
        file_offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        if page_offset(vaddr) != 0
            || !is_user_vaddr(vaddr)
            || read_bytes.checked_add(zero_bytes) != Some(PAGE_FRAME_SIZE)
            || (file.is_none() && read_bytes != 0)
        {
            return Err(VmError::BadPageLayout(vaddr));
        }
        if self.entries.contains_key(&vaddr) {
            return Err(VmError::PageAlreadyRegistered(vaddr));
        }

        self.entries.insert(
            vaddr,
            SupPageTableEntry {
                vaddr,
                file,
                file_offset,
                read_bytes,
                zero_bytes,
                writable,
                state: PageState::Unloaded,
                loading: false,
            },
        );
        Ok(())
    }

    /// The entry for the page containing `vaddr`.
    pub fn find(&self, vaddr: usize) -> Option<&SupPageTableEntry> {
        self.entries.get(&page_round_down(vaddr))
    }

    pub fn find_mut(&mut self, vaddr: usize) -> Option<&mut SupPageTableEntry> {
        self.entries.get_mut(&page_round_down(vaddr))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SupPageTableEntry> {
        self.entries.values()
    }

    /// Discards every entry, giving back the frame or swap slot each one holds.
    ///
    /// Keeps going after a failure so that everything else is still released,
    /// and reports the first failure.
    pub fn teardown(&mut self, frames: &FrameTable, swap: &SwapSpace) -> Result<(), VmError> {
        let mut first_err = None;
        let (mut resident, mut swapped) = (0, 0);

        while let Some((_, entry)) = self.entries.pop_first() {
            let result = match entry.state {
                PageState::Resident(frame) => {
                    resident += 1;
                    frames.free(frame)
                }
                PageState::Swapped(slot) => {
                    swapped += 1;
                    swap.swap_set(slot)
                }
                PageState::Unloaded => Ok(()),
            };
            if let Err(err) = result {
                first_err.get_or_insert(err);
            }
        }

        debug!(
            "Page table teardown: {} resident, {} swapped pages released",
            resident, swapped
        );
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::{Block, BlockDriver, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::fs::MemFile;
    use crate::mem::UserPool;
    use crate::vm::swap::SECTORS_PER_PAGE;

    fn file(len: usize) -> Arc<dyn File> {
        Arc::new(MemFile::new((0..len).map(|i| i as u8).collect()))
    }

    #[test]
    fn test_register_and_find() {
        let mut spt = SupplementalPageTable::new();
        spt.register_lazy(0x0804_8000, Some(file(100)), 0, 100, PAGE_FRAME_SIZE - 100, false)
            .unwrap();
        spt.register_lazy(0x0804_9000, None, 0, 0, PAGE_FRAME_SIZE, true)
            .unwrap();

        let entry = spt.find(0x0804_8fff).unwrap();
        assert_eq!(entry.vaddr(), 0x0804_8000);
        assert_eq!(entry.state(), PageState::Unloaded);
        assert!(!entry.writable());
        assert!(spt.find(0x0804_a000).is_none());
        assert_eq!(spt.len(), 2);
    }

    #[test]
    fn test_register_rejects_bad_layouts() {
        let mut spt = SupplementalPageTable::new();
        assert_eq!(
            spt.register_lazy(0x1001, None, 0, 0, PAGE_FRAME_SIZE, true),
            Err(VmError::BadPageLayout(0x1001))
        );
        assert_eq!(
            spt.register_lazy(0x1000, None, 0, 0, 10, true),
            Err(VmError::BadPageLayout(0x1000))
        );
        assert_eq!(
            spt.register_lazy(0x1000, None, 0, 10, PAGE_FRAME_SIZE - 10, true),
            Err(VmError::BadPageLayout(0x1000))
        );
        assert!(spt
            .register_lazy(0x8000_0000, None, 0, 0, PAGE_FRAME_SIZE, true)
            .is_err());

        spt.register_lazy(0x1000, None, 0, 0, PAGE_FRAME_SIZE, true)
            .unwrap();
        assert_eq!(
            spt.register_lazy(0x1000, None, 0, 0, PAGE_FRAME_SIZE, true),
            Err(VmError::PageAlreadyRegistered(0x1000))
        );
    }

    #[test]
    fn test_state_transitions() {
        let mut spt = SupplementalPageTable::new();
        spt.register_lazy(0x2000, Some(file(PAGE_FRAME_SIZE)), 0, PAGE_FRAME_SIZE, 0, true)
            .unwrap();
        let entry = spt.find_mut(0x2000).unwrap();

        assert!(matches!(entry.begin_load(), FillSource::File { .. }));
        assert!(entry.is_loading());

        let frame = UserPool::new(1).alloc_frame().unwrap();
        entry.finish_load(frame);
        assert!(!entry.is_loading());
        assert_eq!(entry.frame(), Some(frame));
        assert!(entry.swap_slot().is_none());

        entry.evicted(None);
        assert_eq!(entry.state(), PageState::Unloaded);
        assert!(entry.frame().is_none());
    }

    #[test]
    fn test_swap_load_takes_the_slot() {
        let swap = SwapSpace::new(Block::new(
            BlockType::Swap,
            "swap",
            SECTORS_PER_PAGE as u32,
            BlockDriver::RamDisk(RamDisk::new(SECTORS_PER_PAGE as u32)),
        ));
        let slot = swap.swap_out(&[7; PAGE_FRAME_SIZE]).unwrap();

        let mut spt = SupplementalPageTable::new();
        spt.register_lazy(0x3000, None, 0, 0, PAGE_FRAME_SIZE, true)
            .unwrap();
        let entry = spt.find_mut(0x3000).unwrap();
        entry.evicted(Some(slot));

        let source = entry.begin_load();
        assert_eq!(source.swap_slot(), Some(slot));
        assert_eq!(entry.state(), PageState::Unloaded);

        // Failed before the slot was read: the page is still in swap.
        entry.abort_load(source.swap_slot());
        assert_eq!(entry.state(), PageState::Swapped(slot));
        assert!(!entry.is_loading());

        let source = entry.begin_load();
        let mut bytes = [0; PAGE_FRAME_SIZE];
        source.fill(&swap, &mut bytes).unwrap();
        assert!(!swap.is_reserved(slot));
        assert_eq!(entry.swap_slot(), None);
        entry.abort_load(None);
        assert_eq!(entry.state(), PageState::Unloaded);
    }

    #[test]
    fn test_file_fill_zeroes_tail() {
        let source = FillSource::File {
            file: file(8),
            offset: 2,
            read_bytes: 4,
        };
        let swap = SwapSpace::new(Block::new(
            BlockType::Swap,
            "swap",
            8,
            BlockDriver::RamDisk(RamDisk::new(8)),
        ));
        let mut bytes = [0xFF; PAGE_FRAME_SIZE];
        source.fill(&swap, &mut bytes).unwrap();
        assert_eq!(&bytes[..4], &[2, 3, 4, 5]);
        assert!(bytes[4..].iter().all(|&b| b == 0));

        let short = FillSource::File {
            file: file(8),
            offset: 6,
            read_bytes: 4,
        };
        assert_eq!(short.fill(&swap, &mut bytes), Err(VmError::FileRead(6)));
    }
}
