//! System-wide constants for the virtual memory core.

/// Bytes per page.
pub const PAGE_SIZE: usize = 4096;

/// Bits of byte-offset within a page.
pub const PAGE_SHIFT: usize = 12;

/// One past the highest virtual address a user page table can map.
///
/// Sv39 gives three 9-bit levels on top of `PAGE_SHIFT`, so this is
/// `1 << (9 * 3 + PAGE_SHIFT - 1)`: one bit short of the full 39-bit range,
/// so that valid addresses never need sign-extension of the top bit.
pub const MAXVA: usize = 1 << (9 * 3 + PAGE_SHIFT - 1);

/// Maximum number of resident (physically backed) user pages per process.
pub const MAX_PHYS_PAGES: usize = 16;

/// Maximum number of page-sized slots in a process's swap file.
pub const MAX_DISC_PAGES: usize = 16;

/// Maximum number of user pages (resident + swapped) tracked per process.
pub const MAX_TOTAL_PAGES: usize = MAX_PHYS_PAGES + MAX_DISC_PAGES;

const _: () = assert!(MAX_TOTAL_PAGES == 32);
