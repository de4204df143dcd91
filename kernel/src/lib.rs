//! Demand-paged virtual memory for user processes: lazy page loading, a
//! shared frame table with clock eviction, and a block-device backed swap
//! area.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod user_program;
pub mod vm;
