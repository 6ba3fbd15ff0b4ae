//! Error type shared by every fallible operation in this crate.

use crate::addr::VirtAddr;

/// Failure modes that a caller can recover from.
///
/// Everything else — a corrupt page table, a resident-set slot that
/// disagrees with its PTE, a process growing past its hard page cap — is a
/// programming error in the kernel and panics instead of returning here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// The frame allocator had no physical page to hand out.
    #[error("out of physical memory")]
    Oom,

    /// The process's swap file has no free slot left to evict into.
    #[error("swap file exhausted")]
    SwapFull,

    /// `va` is unmapped, not user-accessible, or does not carry the
    /// permission the caller required (e.g. a write through a read-only or
    /// paged-out page).
    #[error("invalid or inaccessible user address: {0:?}")]
    BadAddress(VirtAddr),
}
