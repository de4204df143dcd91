// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support. It would be nice if
// you could tell clippy that you were only dealing with 32-bit usizes...
#![allow(clippy::cast_possible_truncation)]

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

pub const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

/// One second-level table: 1024 entries covering 4MB of virtual memory.
#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::DEFAULT; PAGE_TABLE_LEN])
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// x86 page table entry. The MMU sets `accessed` on every reference through
/// the mapping and `dirty` on every write; the kernel clears them.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    pub present: bool,
    #[bit(1, rw)]
    pub read_write: bool,
    #[bit(2, rw)]
    pub user_supervisor: bool,
    #[bit(3, rw)]
    pub write_through: bool,
    #[bit(4, rw)]
    pub cache_disable: bool,
    #[bit(5, rw)]
    pub accessed: bool,
    #[bit(6, rw)]
    pub dirty: bool,
    #[bit(8, rw)]
    pub global: bool,
    #[bits(12..=31, rw)]
    pub page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user mapping of the frame at physical address `phys_addr`.
    pub fn user_mapping(phys_addr: usize, writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(u20::new((phys_addr / PAGE_FRAME_SIZE) as u32))
    }

    /// Physical address of the frame this entry points at.
    pub fn phys_addr(&self) -> usize {
        self.page_frame_address().value() as usize * PAGE_FRAME_SIZE
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    pub page_directory_index: u10,
    #[bits(12..=21, r)]
    pub page_table_index: u10,
    #[bits(0..=11, r)]
    pub offset: u12,
}

impl VirtualAddress {
    pub fn from_usize(vaddr: usize) -> Self {
        Self::new_with_raw_value(vaddr as u32)
    }

    /// (directory index, table index) of the page containing this address.
    pub fn indices(&self) -> (usize, usize) {
        (
            usize::from(self.page_directory_index().value()),
            usize::from(self.page_table_index().value()),
        )
    }
}
