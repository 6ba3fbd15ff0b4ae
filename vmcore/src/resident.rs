//! The resident-set table and swap-slot map: the per-process bookkeeping the
//! demand-paging daemon needs on top of the page table itself.

use core::ptr::NonNull;

use crate::addr::VirtAddr;
use crate::error::VmError;
use crate::page_table::PtEntry;
use crate::param::{MAX_DISC_PAGES, MAX_TOTAL_PAGES};

#[derive(Clone, Copy)]
struct ResidentSlot {
    taken: bool,
    va: VirtAddr,
    pte: Option<NonNull<PtEntry>>,
    on_phys: bool,
    swap_slot: usize,
}

impl ResidentSlot {
    const fn empty() -> Self {
        Self {
            taken: false,
            va: VirtAddr::new(0),
            pte: None,
            on_phys: false,
            swap_slot: 0,
        }
    }
}

/// Tracks every user page a process currently owns, resident or swapped,
/// up to [`MAX_TOTAL_PAGES`] at a time.
pub(crate) struct ResidentSetTable {
    slots: [ResidentSlot; MAX_TOTAL_PAGES],
}

impl ResidentSetTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [ResidentSlot::empty(); MAX_TOTAL_PAGES],
        }
    }

    /// New pages take the highest free slot first, so the oldest resident
    /// page always ends up at the highest occupied index and
    /// [`ResidentSetTable::select_victim`]'s top-down scan evicts it first:
    /// true FIFO order, not merely array order.
    pub(crate) fn find_free(&self) -> Option<usize> {
        self.slots.iter().enumerate().rev().find(|(_, s)| !s.taken).map(|(i, _)| i)
    }

    pub(crate) fn find_by_va(&self, va: VirtAddr) -> Option<usize> {
        self.slots.iter().position(|s| s.taken && s.va == va)
    }

    /// FIFO-from-the-top: scans from the highest slot index down and
    /// evicts the first resident page found.
    pub(crate) fn select_victim(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| s.taken && s.on_phys)
            .map(|(i, _)| i)
    }

    pub(crate) fn insert_resident(&mut self, idx: usize, va: VirtAddr, pte: NonNull<PtEntry>) {
        self.slots[idx] = ResidentSlot {
            taken: true,
            va,
            pte: Some(pte),
            on_phys: true,
            swap_slot: 0,
        };
    }

    pub(crate) fn clear(&mut self, idx: usize) {
        self.slots[idx] = ResidentSlot::empty();
    }

    pub(crate) fn mark_swapped(&mut self, idx: usize, swap_slot: usize) {
        let slot = &mut self.slots[idx];
        assert!(slot.taken && slot.on_phys, "mark_swapped: slot {idx} is not a resident page");
        slot.on_phys = false;
        slot.swap_slot = swap_slot;
    }

    pub(crate) fn mark_resident(&mut self, idx: usize, pte: NonNull<PtEntry>) {
        let slot = &mut self.slots[idx];
        assert!(slot.taken && !slot.on_phys, "mark_resident: slot {idx} is not swapped");
        slot.on_phys = true;
        slot.pte = Some(pte);
        slot.swap_slot = 0;
    }

    pub(crate) fn is_swapped(&self, idx: usize) -> bool {
        let slot = &self.slots[idx];
        slot.taken && !slot.on_phys
    }

    pub(crate) fn swap_slot(&self, idx: usize) -> usize {
        self.slots[idx].swap_slot
    }

    pub(crate) fn pte(&self, idx: usize) -> NonNull<PtEntry> {
        self.slots[idx].pte.expect("resident-set slot has no PTE")
    }

    #[cfg(debug_assertions)]
    pub(crate) fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| s.taken).count()
    }

    #[cfg(debug_assertions)]
    pub(crate) fn resident_count(&self) -> usize {
        self.slots.iter().filter(|s| s.taken && s.on_phys).count()
    }
}

/// Maps each `MAX_DISC_PAGES`-sized process swap file to a free-slot
/// bitmap; `swap_slot` indices from [`ResidentSetTable`] index directly into
/// this map.
pub(crate) struct SwapSlotMap {
    free: [bool; MAX_DISC_PAGES],
}

impl SwapSlotMap {
    pub(crate) const fn new() -> Self {
        Self {
            free: [true; MAX_DISC_PAGES],
        }
    }

    pub(crate) fn acquire(&mut self) -> Result<usize, VmError> {
        let idx = self.free.iter().position(|&f| f).ok_or(VmError::SwapFull)?;
        self.free[idx] = false;
        Ok(idx)
    }

    pub(crate) fn release(&mut self, idx: usize) {
        assert!(!self.free[idx], "double release of swap slot {idx}");
        self.free[idx] = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn victim_is_highest_resident_slot() {
        let mut table = ResidentSetTable::new();
        let dummy = NonNull::dangling();
        table.insert_resident(0, VirtAddr::new(0), dummy);
        table.insert_resident(1, VirtAddr::new(0x1000), dummy);
        table.insert_resident(2, VirtAddr::new(0x2000), dummy);
        assert_eq!(table.select_victim(), Some(2));
        table.mark_swapped(2, 0);
        assert_eq!(table.select_victim(), Some(1));
    }

    #[test]
    fn swap_slot_map_exhausts() {
        let mut map = SwapSlotMap::new();
        for _ in 0..MAX_DISC_PAGES {
            map.acquire().unwrap();
        }
        assert_eq!(map.acquire(), Err(VmError::SwapFull));
    }
}
