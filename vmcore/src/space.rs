//! Per-process address spaces: creation, growth, shrinking, cloning,
//! destruction, and the demand-paging daemon that keeps a process within its
//! resident-page budget.

use core::ptr::NonNull;

use crate::addr::{PageRound, PhysAddr, PhysPageNum, VirtAddr};
use crate::collab::{FrameSource, Platform, SwapDevice};
use crate::error::VmError;
use crate::page_table::{PageTable, PtEntry, PtEntryFlags};
use crate::param::{MAX_PHYS_PAGES, MAX_TOTAL_PAGES, PAGE_SIZE};
use crate::resident::{ResidentSetTable, SwapSlotMap};

/// A process's virtual address space: its page table, its resident-set and
/// swap-slot bookkeeping, and its own swap file.
///
/// `S` is the swap-file backend; the frame allocator and TLB control
/// ([`Platform`]) are shared system-wide and so are passed into each method
/// rather than owned here.
pub struct AddressSpace<S: SwapDevice> {
    root: NonNull<PageTable>,
    resident: ResidentSetTable,
    swap_slots: SwapSlotMap,
    swap: S,
    resident_count: usize,
    total_count: usize,
}

impl<S: SwapDevice> AddressSpace<S> {
    /// Allocates a bare root page table with no user mappings.
    pub fn create(swap: S, frames: &impl FrameSource) -> Result<Self, VmError> {
        let root = PageTable::allocate_zeroed(frames)?;
        Ok(Self {
            root,
            resident: ResidentSetTable::new(),
            swap_slots: SwapSlotMap::new(),
            swap,
            resident_count: 0,
            total_count: 0,
        })
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.resident_count
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    #[must_use]
    pub fn page_table(&self) -> &PageTable {
        unsafe { self.root.as_ref() }
    }

    fn page_table_mut(&mut self) -> &mut PageTable {
        unsafe { self.root.as_mut() }
    }

    fn root_phys_addr(&self) -> PhysAddr {
        self.page_table().phys_addr()
    }

    fn swap_byte_offset(slot: usize) -> usize {
        slot * PAGE_SIZE
    }

    /// Cross-checks the resident-set table against the process-level
    /// counters. Only compiled into debug builds: a violation here means a
    /// bug in this crate, not in a caller.
    #[cfg(debug_assertions)]
    fn debug_check_invariants(&self) {
        assert_eq!(
            self.resident.occupied_count(),
            self.total_count,
            "total_count disagrees with resident-set table"
        );
        assert_eq!(
            self.resident.resident_count(),
            self.resident_count,
            "resident_count disagrees with resident-set table"
        );
        assert!(self.resident_count <= MAX_PHYS_PAGES);
        assert!(self.total_count <= MAX_TOTAL_PAGES);
    }

    #[cfg(not(debug_assertions))]
    fn debug_check_invariants(&self) {}

    /// Grows the address space from `old_sz` to `new_sz`, allocating and
    /// mapping one fresh, zeroed page at a time. Evicts a resident page
    /// before each allocation that would exceed [`MAX_PHYS_PAGES`].
    ///
    /// On OOM partway through, the pages already installed for this call are
    /// unmapped and freed, and `Err(VmError::Oom)` is returned; `old_sz`
    /// remains valid.
    pub fn grow<P: Platform>(
        &mut self,
        old_sz: usize,
        new_sz: usize,
        platform: &P,
    ) -> Result<usize, VmError> {
        if new_sz <= old_sz {
            return Ok(old_sz);
        }
        let mut sz = old_sz.page_roundup();
        while sz < new_sz {
            assert_ne!(
                self.total_count, MAX_TOTAL_PAGES,
                "address space exceeds MAX_TOTAL_PAGES"
            );
            if self.resident_count == MAX_PHYS_PAGES {
                self.evict_one(platform);
            }
            let Some(frame) = platform.alloc_frame() else {
                self.shrink(old_sz, sz, platform);
                return Err(VmError::Oom);
            };
            unsafe {
                frame.as_mut_ptr::<[u8; PAGE_SIZE]>().write([0; PAGE_SIZE]);
            }
            let va = VirtAddr::new(sz);
            if let Err(e) = self.page_table_mut().map_page(va, frame, PtEntryFlags::URWX, platform)
            {
                platform.free_frame(frame);
                self.shrink(old_sz, sz, platform);
                return Err(e);
            }
            let pte = self
                .page_table_mut()
                .walk_ref(va)
                .expect("just-mapped page must resolve");
            let idx = self
                .resident
                .find_free()
                .expect("resident-set table full despite total_count check");
            self.resident.insert_resident(idx, va, pte);
            self.resident_count += 1;
            self.total_count += 1;
            sz += PAGE_SIZE;
        }
        self.debug_check_invariants();
        Ok(new_sz)
    }

    /// Shrinks the address space from `old_sz` down to `new_sz`, unmapping
    /// and freeing every page no longer covered.
    pub fn shrink<P: Platform>(&mut self, old_sz: usize, new_sz: usize, platform: &P) -> usize {
        if new_sz >= old_sz {
            return old_sz;
        }
        let new_top = new_sz.page_roundup();
        let old_top = old_sz.page_roundup();
        if new_top < old_top {
            let npages = (old_top - new_top) / PAGE_SIZE;
            self.unmap_range(VirtAddr::new(new_top), npages, true, platform);
        }
        self.debug_check_invariants();
        new_sz
    }

    /// Tears down the whole address space: every user page is unmapped and
    /// freed, then every internal page-table page, then the root itself.
    pub fn destroy<P: Platform>(mut self, sz: usize, platform: &P) {
        if sz > 0 {
            let npages = sz.page_roundup() / PAGE_SIZE;
            self.unmap_range(VirtAddr::new(0), npages, true, platform);
        }
        self.page_table_mut().free_walk(platform);
        platform.free_frame(self.root_phys_addr());
    }

    /// Removes the `U` bit from the PTE at `va`, without unmapping it.
    /// Used to hide the trampoline/trapframe style pages from user access
    /// while keeping them mapped for kernel use.
    pub fn clear_user(&mut self, va: VirtAddr) {
        let mut pte = self
            .page_table()
            .walk_ref(va)
            .unwrap_or_else(|| panic!("clear_user: no entry at va={va:?}"));
        let pte = unsafe { pte.as_mut() };
        let mut flags = pte.flags();
        flags.remove(PtEntryFlags::U);
        pte.set_flags(flags);
    }

    /// Installs an identity-style mapping with no resident-set bookkeeping,
    /// for mapping kernel-owned memory (boot-time page tables, trampoline,
    /// device registers) rather than user pages.
    pub fn install_boot_map(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        size: usize,
        perm: PtEntryFlags,
        frames: &impl FrameSource,
    ) -> Result<(), VmError> {
        self.page_table_mut().map_range(va, size, pa, perm, frames)
    }

    /// Unmaps `npages` pages starting at `va`. Each page must currently be
    /// either resident (`V` set) or paged out (`PG` set); releasing its
    /// frame or swap slot and clearing its resident-set entry as
    /// appropriate. `do_free` controls whether a resident page's frame is
    /// returned to the allocator (it is not, for example, when the caller
    /// is about to reuse the frame itself).
    fn unmap_range<P: Platform>(
        &mut self,
        va: VirtAddr,
        npages: usize,
        do_free: bool,
        platform: &P,
    ) {
        assert!(va.is_page_aligned(), "unmap_range: va={va:?} not page-aligned");
        for i in 0..npages {
            let cur = va.byte_add(i * PAGE_SIZE);
            let mut pte_ptr = self
                .page_table()
                .walk_ref(cur)
                .unwrap_or_else(|| panic!("unmap_range: no page-table entry at va={cur:?}"));
            let pte = unsafe { pte_ptr.as_mut() };
            assert!(
                pte.is_valid() || pte.is_paged_out(),
                "unmap_range: entry absent at va={cur:?}"
            );
            if pte.is_paged_out() {
                let slot = self
                    .resident
                    .find_by_va(cur)
                    .expect("unmap_range: paged-out entry has no resident-set slot");
                self.swap_slots.release(self.resident.swap_slot(slot));
                self.resident.clear(slot);
                self.total_count -= 1;
            } else {
                assert!(
                    pte.flags().intersects(PtEntryFlags::RWX),
                    "unmap_range: entry at va={cur:?} is not a leaf"
                );
                if do_free {
                    platform.free_frame(pte.phys_addr());
                }
                let slot = self
                    .resident
                    .find_by_va(cur)
                    .expect("unmap_range: resident entry has no resident-set slot");
                self.resident.clear(slot);
                self.resident_count -= 1;
                self.total_count -= 1;
            }
            *pte = PtEntry::new(PhysPageNum::new(0), PtEntryFlags::empty());
        }
        platform.tlb_flush();
    }

    /// Evicts the current victim slot chosen by
    /// [`ResidentSetTable::select_victim`]: writes its contents to a fresh
    /// swap-file slot, rewrites its PTE to carry `PG`, and returns its frame
    /// to the allocator.
    ///
    /// Swap exhaustion is not recoverable here: like running out of
    /// resident-set slots, it means a process-level invariant was already
    /// broken by the caller, so this panics rather than propagating an
    /// error.
    fn evict_one<P: Platform>(&mut self, platform: &P) {
        let idx = self
            .resident
            .select_victim()
            .expect("evict_one: no resident page available to evict");
        let mut pte_ptr = self.resident.pte(idx);
        let pte = unsafe { pte_ptr.as_mut() };
        let frame = pte.phys_addr();

        let swap_slot = self
            .swap_slots
            .acquire()
            .unwrap_or_else(|_| panic!("evict_one: swap file exhausted"));
        crate::log::trace!("evict_one: slot={idx} frame={frame:?} -> swap_slot={swap_slot}");

        let mut buf = [0u8; PAGE_SIZE];
        unsafe {
            buf.copy_from_slice(core::slice::from_raw_parts(frame.as_ptr::<u8>(), PAGE_SIZE));
        }
        self.swap
            .write(Self::swap_byte_offset(swap_slot), &buf)
            .unwrap_or_else(|e| panic!("evict_one: swap write failed: {e}"));

        *pte = PtEntry::new(PhysPageNum::new(0), PtEntryFlags::PG);
        self.resident.mark_swapped(idx, swap_slot);
        platform.tlb_flush();
        platform.free_frame(frame);
        self.resident_count -= 1;
    }

    /// Brings a paged-out page at `va` back into residence: evicting
    /// another page first if already at the resident cap, reading its
    /// bytes back from swap into a fresh frame, and rewriting its PTE.
    ///
    /// Returns `Err(VmError::BadAddress)` if `va` names no known page of
    /// this address space, or one that is already resident — a true
    /// segmentation fault, for the caller to deliver to the process.
    pub fn fault_in<P: Platform>(&mut self, va: VirtAddr, platform: &P) -> Result<(), VmError> {
        let va = va.page_rounddown();
        let idx = self.resident.find_by_va(va).ok_or(VmError::BadAddress(va))?;
        if !self.resident.is_swapped(idx) {
            return Err(VmError::BadAddress(va));
        }
        crate::log::trace!("fault_in: va={va:?} slot={idx}");
        if self.resident_count == MAX_PHYS_PAGES {
            self.evict_one(platform);
        }
        let frame = platform.alloc_frame().ok_or(VmError::Oom)?;
        let swap_slot = self.resident.swap_slot(idx);
        let mut buf = [0u8; PAGE_SIZE];
        self.swap
            .read(Self::swap_byte_offset(swap_slot), &mut buf)
            .unwrap_or_else(|e| panic!("fault_in: swap read failed: {e}"));
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), frame.as_mut_ptr::<u8>().as_ptr(), PAGE_SIZE);
        }
        let mut pte_ptr = self
            .page_table()
            .walk_ref(va)
            .expect("fault_in: resident-set slot outlived its page-table entry");
        unsafe {
            *pte_ptr.as_mut() = PtEntry::new(frame.phys_page_num(), PtEntryFlags::URWX | PtEntryFlags::V);
        }
        self.swap_slots.release(swap_slot);
        self.resident.mark_resident(idx, pte_ptr);
        self.resident_count += 1;
        platform.tlb_flush();
        self.debug_check_invariants();
        Ok(())
    }

    /// Entry point for the trap dispatcher: services a page fault at `va` by
    /// faulting the page back in if it is currently paged out. Returns
    /// `Err(VmError::BadAddress)` for anything else — unmapped, already
    /// resident, or unknown to this address space — a true segmentation
    /// fault for the caller to deliver to the process.
    pub fn handle_page_fault<P: Platform>(&mut self, va: VirtAddr, platform: &P) -> Result<(), VmError> {
        self.fault_in(va, platform)
    }

    /// Copies every mapped page in `[0, sz)` from `self` into `child`,
    /// which must be freshly created and empty. Pages resident in `self`
    /// are copied directly; pages paged out in `self` are read straight
    /// from its swap file into a fresh frame in `child`, without disturbing
    /// `self`'s own resident set. `child`'s resident cap is enforced the
    /// same way [`AddressSpace::grow`] enforces the parent's: once it fills
    /// up, further pages evict from `child` itself.
    ///
    /// On any failure, every page already installed in `child` by this call
    /// is unmapped and freed before the error is returned.
    pub fn clone_into<P: Platform>(
        &self,
        child: &mut AddressSpace<S>,
        sz: usize,
        platform: &P,
    ) -> Result<(), VmError> {
        crate::log::trace!("clone_into: sz={sz}");
        let mut installed = 0usize;
        let result = self.clone_into_inner(child, sz, platform, &mut installed);
        if result.is_err() {
            child.unmap_range(VirtAddr::new(0), installed, true, platform);
        }
        child.debug_check_invariants();
        result
    }

    fn clone_into_inner<P: Platform>(
        &self,
        child: &mut AddressSpace<S>,
        sz: usize,
        platform: &P,
        installed: &mut usize,
    ) -> Result<(), VmError> {
        let mut off = 0usize;
        while off < sz {
            let va = VirtAddr::new(off);
            let src_pte = self
                .page_table()
                .walk_ref(va)
                .unwrap_or_else(|| panic!("clone: parent has no page-table entry at va={va:?}"));
            let src = unsafe { src_pte.as_ref() };
            assert!(
                src.is_valid() || src.is_paged_out(),
                "clone: parent page not present at va={va:?}"
            );

            let mut buf = [0u8; PAGE_SIZE];
            if src.is_paged_out() {
                let slot = self
                    .resident
                    .find_by_va(va)
                    .expect("clone: paged-out entry has no resident-set slot");
                self.swap
                    .read(Self::swap_byte_offset(self.resident.swap_slot(slot)), &mut buf)
                    .unwrap_or_else(|e| panic!("clone: swap read failed: {e}"));
            } else {
                let pa = src.phys_addr();
                unsafe {
                    buf.copy_from_slice(core::slice::from_raw_parts(pa.as_ptr::<u8>(), PAGE_SIZE));
                }
            }

            if child.resident_count == MAX_PHYS_PAGES {
                child.evict_one(platform);
            }
            let frame = platform.alloc_frame().ok_or(VmError::Oom)?;
            unsafe {
                core::ptr::copy_nonoverlapping(buf.as_ptr(), frame.as_mut_ptr::<u8>().as_ptr(), PAGE_SIZE);
            }
            if let Err(e) = child
                .page_table_mut()
                .map_page(va, frame, PtEntryFlags::URWX, platform)
            {
                platform.free_frame(frame);
                return Err(e);
            }
            let pte = child
                .page_table_mut()
                .walk_ref(va)
                .expect("just-mapped child page must resolve");
            let idx = child
                .resident
                .find_free()
                .expect("clone: child resident-set table full");
            child.resident.insert_resident(idx, va, pte);
            child.resident_count += 1;
            child.total_count += 1;
            *installed += 1;
            off += PAGE_SIZE;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingSwap, MockFrames, MockSwap};

    fn new_space(frames: &MockFrames) -> AddressSpace<MockSwap> {
        AddressSpace::create(MockSwap::new(MAX_TOTAL_PAGES), frames).unwrap()
    }

    #[test]
    fn grow_then_shrink_round_trips() {
        let frames = MockFrames::new(64);
        let mut space = new_space(&frames);
        let sz = space.grow(0, 3 * PAGE_SIZE, &frames).unwrap();
        assert_eq!(sz, 3 * PAGE_SIZE);
        assert_eq!(space.resident_count(), 3);
        assert_eq!(space.total_count(), 3);
        space.shrink(sz, 0, &frames);
        assert_eq!(space.resident_count(), 0);
        assert_eq!(space.total_count(), 0);
        space.destroy(0, &frames);
    }

    #[test]
    fn grow_past_resident_cap_evicts() {
        let frames = MockFrames::new(64);
        let mut space = new_space(&frames);
        let sz = space
            .grow(0, (MAX_PHYS_PAGES + 1) * PAGE_SIZE, &frames)
            .unwrap();
        assert_eq!(space.resident_count(), MAX_PHYS_PAGES);
        assert_eq!(space.total_count(), MAX_PHYS_PAGES + 1);
        space.destroy(sz, &frames);
    }

    #[test]
    fn fault_in_restores_a_swapped_page() {
        let frames = MockFrames::new(64);
        let mut space = new_space(&frames);
        let sz = space
            .grow(0, (MAX_PHYS_PAGES + 1) * PAGE_SIZE, &frames)
            .unwrap();
        // va=0 was installed first, so it sits at the highest resident-set
        // slot and is the first one FIFO-from-the-top evicts.
        let swapped_va = (0..space.total_count())
            .map(|i| VirtAddr::new(i * PAGE_SIZE))
            .find(|va| space.resident.find_by_va(*va).is_some_and(|idx| space.resident.is_swapped(idx)))
            .expect("grow must have evicted exactly one page");
        space.fault_in(swapped_va, &frames).unwrap();
        assert_eq!(space.resident_count(), MAX_PHYS_PAGES);
        assert!(
            space.page_table().walk_user(swapped_va).is_some(),
            "restored leaf must be valid and user-accessible again"
        );
        space.destroy(sz, &frames);
    }

    #[test]
    fn handle_page_fault_restores_a_swapped_page() {
        let frames = MockFrames::new(64);
        let mut space = new_space(&frames);
        let sz = space
            .grow(0, (MAX_PHYS_PAGES + 1) * PAGE_SIZE, &frames)
            .unwrap();
        let swapped_va = (0..space.total_count())
            .map(|i| VirtAddr::new(i * PAGE_SIZE))
            .find(|va| space.resident.find_by_va(*va).is_some_and(|idx| space.resident.is_swapped(idx)))
            .expect("grow must have evicted exactly one page");
        space.handle_page_fault(swapped_va, &frames).unwrap();
        assert!(space.page_table().walk_user(swapped_va).is_some());
        space.destroy(sz, &frames);
    }

    #[test]
    fn fault_in_on_resident_page_is_bad_address() {
        let frames = MockFrames::new(64);
        let mut space = new_space(&frames);
        let sz = space.grow(0, PAGE_SIZE, &frames).unwrap();
        assert_eq!(space.fault_in(VirtAddr::new(0), &frames), Err(VmError::BadAddress(VirtAddr::new(0))));
        space.destroy(sz, &frames);
    }

    #[test]
    fn clone_preserves_resident_and_swapped_pages() {
        let frames = MockFrames::new(128);
        let mut parent = new_space(&frames);
        let sz = parent
            .grow(0, (MAX_PHYS_PAGES + 1) * PAGE_SIZE, &frames)
            .unwrap();
        let mut child = new_space(&frames);
        parent.clone_into(&mut child, sz, &frames).unwrap();
        assert_eq!(child.resident_count(), MAX_PHYS_PAGES);
        assert_eq!(child.total_count(), MAX_PHYS_PAGES + 1);
        parent.destroy(sz, &frames);
        child.destroy(sz, &frames);
    }

    #[test]
    fn evict_one_panics_when_swap_write_fails() {
        let frames = MockFrames::new(64);
        let mut space = AddressSpace::create(FailingSwap, &frames).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            space.grow(0, PAGE_SIZE, &frames).unwrap();
            space.evict_one(&frames);
        }));
        assert!(result.is_err());
    }
}
