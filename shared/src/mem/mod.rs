use crate::sizes::MB;

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * crate::sizes::KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// Top of user virtual memory. The initial user stack page sits right below it.
pub const PHYS_BASE: usize = OFFSET;

/// Physical address of the first frame handed out by the user pool.
pub const USER_POOL_BASE: usize = 4 * MB;

const PAGE_MASK: usize = PAGE_FRAME_SIZE - 1;

/// Rounds `addr` down to the start of the page containing it.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !PAGE_MASK
}

/// Rounds `addr` up to the next page boundary.
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_MASK) & !PAGE_MASK
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & PAGE_MASK
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < PHYS_BASE
}
