//! Per-process page tables.
//!
//! A two-level x86 layout kept in kernel memory: a sparse page directory of
//! second-level [`PageTable`]s, each covering 4MB. Callers stand in for the
//! MMU by setting the accessed and dirty bits on every reference they make
//! through a mapping.

use crate::mem::Frame;
use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use vmkernel_shared::{
    mem::PAGE_FRAME_SIZE,
    paging::{PageTable, PageTableEntry, VirtualAddress, PAGE_TABLE_LEN},
};

#[derive(Default)]
pub struct PageManager {
    tables: BTreeMap<usize, Box<PageTable>>,
}

impl PageManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, vaddr: usize) -> Option<&PageTableEntry> {
        let (dir, idx) = VirtualAddress::from_usize(vaddr).indices();
        self.tables
            .get(&dir)
            .map(|table| &table[idx])
            .filter(|entry| entry.present())
    }

    fn entry_mut(&mut self, vaddr: usize) -> Option<&mut PageTableEntry> {
        let (dir, idx) = VirtualAddress::from_usize(vaddr).indices();
        self.tables
            .get_mut(&dir)
            .map(|table| &mut table[idx])
            .filter(|entry| entry.present())
    }

    /// Maps the page containing `upage` to `frame`. Returns `false` without
    /// changing anything if the page is already mapped.
    pub fn map(&mut self, frame: Frame, upage: usize, writable: bool) -> bool {
        if self.is_mapped(upage) {
            return false;
        }
        let (dir, idx) = VirtualAddress::from_usize(upage).indices();
        let table = self.tables.entry(dir).or_default();
        table[idx] = PageTableEntry::user_mapping(frame.phys_addr(), writable);
        true
    }

    /// Removes the mapping for the page containing `upage`, returning the
    /// entry as it was so the caller can inspect its accessed and dirty bits.
    pub fn unmap(&mut self, upage: usize) -> Option<PageTableEntry> {
        let (dir, idx) = VirtualAddress::from_usize(upage).indices();
        let table = self.tables.get_mut(&dir)?;
        let old = table[idx];
        if !old.present() {
            return None;
        }
        table[idx] = PageTableEntry::DEFAULT;

        if table.iter().all(|entry| !entry.present()) {
            self.tables.remove(&dir);
        }
        Some(old)
    }

    pub fn translate(&self, vaddr: usize) -> Option<Frame> {
        self.entry(vaddr)
            .and_then(|entry| Frame::from_phys_addr(entry.phys_addr()))
    }

    pub fn is_mapped(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some()
    }

    pub fn is_writable(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|entry| entry.read_write())
    }

    pub fn is_accessed(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|entry| entry.accessed())
    }

    pub fn set_accessed(&mut self, vaddr: usize, accessed: bool) {
        if let Some(entry) = self.entry_mut(vaddr) {
            *entry = entry.with_accessed(accessed);
        }
    }

    pub fn is_dirty(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|entry| entry.dirty())
    }

    pub fn set_dirty(&mut self, vaddr: usize, dirty: bool) {
        if let Some(entry) = self.entry_mut(vaddr) {
            *entry = entry.with_dirty(dirty);
        }
    }

    /// User pages that currently have a mapping, in ascending order.
    pub fn mapped_pages(&self) -> Vec<usize> {
        self.tables
            .iter()
            .flat_map(|(&dir, table)| {
                table
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.present())
                    .map(move |(idx, _)| (dir * PAGE_TABLE_LEN + idx) * PAGE_FRAME_SIZE)
            })
            .collect()
    }

    /// Drops every mapping.
    pub fn clear(&mut self) {
        self.tables.clear();
    }
}
