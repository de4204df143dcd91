//! Lazy program loading. Segments are only recorded in the supplemental page
//! table here; no page is read until the program touches it.

use crate::fs::File;
use crate::vm::{AddressSpace, VmError};
use alloc::sync::Arc;
use log::debug;
use thiserror::Error;
use vmkernel_shared::mem::{is_user_vaddr, page_round_up, PAGE_FRAME_SIZE, PHYS_BASE};

const PGMASK: usize = PAGE_FRAME_SIZE - 1;

/// A loadable segment of a program image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSegment {
    /// Offset of the segment's data in the file.
    pub offset: u64,
    pub vaddr: usize,
    pub file_size: usize,
    pub mem_size: usize,
    pub writable: bool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    #[error("file offset and virtual address have different page offsets")]
    DifferentPageOffset,
    #[error("file offset points past the end of the file")]
    OffsetOutOfRange,
    #[error("memory size is smaller than file size")]
    MemSizeLesserThanFileSize,
    #[error("segment is empty")]
    EmptyMemSize,
    #[error("segment lies outside user memory")]
    VMRegionOutOfRange,
    #[error("segment wraps around the address space")]
    VMRegionWrapAround,
    #[error("segment maps page 0")]
    PageZeroMapping,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    #[error("invalid segment: {0}")]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Vm(#[from] VmError),
}

pub fn validate_segment(segment: &ProgramSegment, file: &dyn File) -> Result<(), SegmentError> {
    // The file offset and the virtual address must have the same page offset.
    if (segment.offset as usize & PGMASK) != (segment.vaddr & PGMASK) {
        return Err(SegmentError::DifferentPageOffset);
    }

    if segment.offset > file.len() {
        return Err(SegmentError::OffsetOutOfRange);
    }

    if segment.mem_size < segment.file_size {
        return Err(SegmentError::MemSizeLesserThanFileSize);
    }

    if segment.mem_size == 0 {
        return Err(SegmentError::EmptyMemSize);
    }

    if !is_user_vaddr(segment.vaddr) {
        return Err(SegmentError::VMRegionOutOfRange);
    }

    let end = segment
        .vaddr
        .checked_add(segment.mem_size)
        .ok_or(SegmentError::VMRegionWrapAround)?;
    if !is_user_vaddr(end - 1) {
        return Err(SegmentError::VMRegionOutOfRange);
    }

    // Page 0 stays unmapped so null pointers always fault.
    if segment.vaddr < PAGE_FRAME_SIZE {
        return Err(SegmentError::PageZeroMapping);
    }

    Ok(())
}

/// Registers every page of `segment` with `space`. Each page reads up to a
/// page of file data and zero-fills the rest.
pub fn load_segment(
    space: &AddressSpace,
    file: &Arc<dyn File>,
    segment: &ProgramSegment,
) -> Result<(), LoadError> {
    validate_segment(segment, &**file)?;

    let page_offset = segment.vaddr & PGMASK;
    let mut file_page = segment.offset & !(PGMASK as u64);
    let mut upage = segment.vaddr & !PGMASK;

    let (mut read_bytes, mut zero_bytes) = if segment.file_size > 0 {
        let read_bytes = page_offset + segment.file_size;
        (
            read_bytes,
            page_round_up(page_offset + segment.mem_size) - read_bytes,
        )
    } else {
        (0, page_round_up(page_offset + segment.mem_size))
    };

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PAGE_FRAME_SIZE);
        let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

        let backing = (page_read_bytes > 0).then(|| file.clone());
        space.register_lazy(
            upage,
            backing,
            file_page,
            page_read_bytes,
            page_zero_bytes,
            segment.writable,
        )?;

        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        upage += PAGE_FRAME_SIZE;
        file_page += PAGE_FRAME_SIZE as u64;
    }

    Ok(())
}

/// Registers the zero-filled page just below [`PHYS_BASE`] as the initial
/// stack and returns the initial stack pointer.
pub fn setup_stack(space: &AddressSpace) -> Result<usize, VmError> {
    space.register_lazy(
        PHYS_BASE - PAGE_FRAME_SIZE,
        None,
        0,
        0,
        PAGE_FRAME_SIZE,
        true,
    )?;
    Ok(PHYS_BASE)
}

/// Registers all `segments` of the program in `file` and its stack. Returns
/// the initial stack pointer.
pub fn load(
    space: &AddressSpace,
    file: &Arc<dyn File>,
    segments: &[ProgramSegment],
) -> Result<usize, LoadError> {
    for segment in segments {
        load_segment(space, file, segment)?;
    }
    let esp = setup_stack(space)?;
    debug!(
        "Process {}: {} pages registered, nothing loaded",
        space.pid(),
        space.lock().page_table.len()
    );
    Ok(esp)
}
