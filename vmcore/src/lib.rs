//! Virtual memory core for a teaching operating system.
//!
//! This crate owns the Sv39-style three-level page table, per-process
//! address-space lifecycle (create/grow/shrink/clone/destroy), the
//! resident-set tracker and FIFO-from-the-top demand-paging daemon, and the
//! cross-address-space copy routines a kernel needs to move bytes between
//! its own memory and a process's user pages.
//!
//! It owns none of the machinery around those things: physical frame
//! allocation, TLB invalidation, and swap-file I/O are all expressed as
//! traits in [`collab`] and injected by the caller.
#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod collab;
pub mod copy;
pub mod error;
mod log;
pub mod page_table;
pub mod param;
mod resident;
pub mod space;

#[cfg(test)]
pub(crate) mod testing;

pub use addr::{PageRound, PhysAddr, PhysPageNum, VirtAddr};
pub use collab::{FrameSource, Platform, SwapDevice};
pub use copy::{copy_in, copy_in_str, copy_out};
pub use error::VmError;
pub use page_table::{PageTable, PtEntry, PtEntryFlags};
pub use space::AddressSpace;
