//! The three-level radix page table and its flag bits.

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::addr::{PageRound, PhysAddr, PhysPageNum, VirtAddr};
use crate::collab::FrameSource;
use crate::error::VmError;
use crate::param::PAGE_SIZE;

bitflags! {
    /// Permission and state bits carried by a page-table entry.
    ///
    /// `V` and `PG` are mutually exclusive on a leaf: `V` marks a page
    /// resident behind a live translation, `PG` marks one whose bytes
    /// currently live in the owning process's swap file. An entry with
    /// neither bit set is simply absent.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct PtEntryFlags: usize {
        /// Entry is valid and resolves to a physical frame.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// Accessible from user mode.
        const U = 1 << 4;
        /// Leaf is paged out: its frame has been returned to the allocator
        /// and its contents copied to the swap file.
        const PG = 1 << 5;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
        const UR = Self::U.bits() | Self::R.bits();
        const UW = Self::U.bits() | Self::W.bits();
        const URW = Self::U.bits() | Self::RW.bits();
        const URX = Self::U.bits() | Self::RX.bits();
        const URWX = Self::U.bits() | Self::RWX.bits();
    }
}

const FLAGS_MASK: usize = 0x3f;
const PPN_SHIFT: usize = 10;

/// A single page-table entry: either absent, an internal node pointing at
/// the next level, or a leaf mapping a virtual page to a physical one.
#[repr(transparent)]
pub struct PtEntry(usize);

impl PtEntry {
    const fn empty() -> Self {
        Self(0)
    }

    pub(crate) fn new(ppn: PhysPageNum, flags: PtEntryFlags) -> Self {
        Self((ppn.raw() << PPN_SHIFT) | flags.bits())
    }

    #[must_use]
    pub fn flags(&self) -> PtEntryFlags {
        PtEntryFlags::from_bits_retain(self.0 & FLAGS_MASK)
    }

    pub(crate) fn set_flags(&mut self, flags: PtEntryFlags) {
        self.0 = (self.0 & !FLAGS_MASK) | flags.bits();
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PtEntryFlags::V)
    }

    #[must_use]
    pub fn is_paged_out(&self) -> bool {
        self.flags().contains(PtEntryFlags::PG)
    }

    /// A valid entry that carries at least one of R/W/X is a leaf; a valid
    /// entry with none of them is an internal node pointing at a child
    /// table.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(PtEntryFlags::RWX)
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.is_valid() && !self.flags().intersects(PtEntryFlags::RWX)
    }

    #[must_use]
    pub fn phys_page_num(&self) -> PhysPageNum {
        PhysPageNum::new(self.0 >> PPN_SHIFT)
    }

    #[must_use]
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys_page_num().phys_addr()
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A 512-entry page-table page, one level of the three-level radix tree.
#[repr(transparent)]
pub struct PageTable([PtEntry; 512]);

impl PageTable {
    fn entry_index(level: usize, va: VirtAddr) -> usize {
        (va.addr() >> (crate::param::PAGE_SHIFT + 9 * level)) & 0x1ff
    }

    /// Allocates and zero-fills a fresh page-table page.
    pub(crate) fn allocate_zeroed(
        frames: &impl FrameSource,
    ) -> Result<NonNull<PageTable>, VmError> {
        let pa = frames.alloc_frame().ok_or(VmError::Oom)?;
        let mut ptr = pa.as_mut_ptr::<PageTable>();
        unsafe {
            ptr.write_bytes(0, 1);
        }
        Ok(ptr)
    }

    #[must_use]
    pub fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(core::ptr::from_ref(self).addr())
    }

    fn phys_page_num(&self) -> PhysPageNum {
        self.phys_addr().phys_page_num()
    }

    /// Descends to the level-0 entry for `va`, allocating intermediate
    /// tables as needed, and returns it regardless of its own content (it
    /// may come back empty, a leaf, or paged out).
    ///
    /// Panics if `va >= VirtAddr::MAX`: this entry point is only ever
    /// reached with kernel-chosen addresses (`grow`, `map_page`, boot
    /// mapping), never directly with user-supplied ones.
    pub(crate) fn walk_alloc(
        &mut self,
        va: VirtAddr,
        frames: &impl FrameSource,
    ) -> Result<NonNull<PtEntry>, VmError> {
        assert!(va < VirtAddr::MAX, "walk_alloc: va={va:?} exceeds MAXVA");
        let mut table: NonNull<PageTable> = NonNull::from(&mut *self);
        for level in (1..=2).rev() {
            let idx = Self::entry_index(level, va);
            unsafe {
                let pte = &mut table.as_mut().0[idx];
                if pte.is_valid() {
                    assert!(
                        pte.is_internal(),
                        "walk_alloc: va={va:?} level={level} entry is a leaf"
                    );
                    table = pte.phys_addr().as_mut_ptr();
                    continue;
                }
                let child = Self::allocate_zeroed(frames)?;
                *pte = PtEntry::new(child.as_ref().phys_page_num(), PtEntryFlags::V);
                table = child;
            }
        }
        let idx = Self::entry_index(0, va);
        Ok(unsafe { NonNull::from(&mut table.as_mut().0[idx]) })
    }

    /// Descends to the level-0 entry for `va` without allocating. Returns
    /// `None` only if an intermediate table is absent; a present but empty
    /// level-0 entry is still returned so callers can inspect or overwrite
    /// it.
    ///
    /// Panics if `va >= VirtAddr::MAX`.
    #[must_use]
    pub(crate) fn walk_ref(&self, va: VirtAddr) -> Option<NonNull<PtEntry>> {
        assert!(va < VirtAddr::MAX, "walk_ref: va={va:?} exceeds MAXVA");
        let mut table: NonNull<PageTable> = NonNull::from(self);
        for level in (1..=2).rev() {
            let idx = Self::entry_index(level, va);
            unsafe {
                let pte = &table.as_ref().0[idx];
                if !pte.is_valid() {
                    return None;
                }
                assert!(
                    pte.is_internal(),
                    "walk_ref: va={va:?} level={level} entry is a leaf"
                );
                table = pte.phys_addr().as_mut_ptr();
            }
        }
        let idx = Self::entry_index(0, va);
        Some(unsafe { NonNull::from(&mut (*table.as_ptr()).0[idx]) })
    }

    /// Read-only lookup used by user-reachable callers (`copy_*`,
    /// `walk_user`): never allocates, never panics on an out-of-range
    /// address, and only succeeds for a resident leaf that carries every
    /// bit in `required`.
    #[must_use]
    pub fn resolve_virtual_address(
        &self,
        va: VirtAddr,
        required: PtEntryFlags,
    ) -> Option<PhysAddr> {
        if va >= VirtAddr::MAX {
            return None;
        }
        let pte = self.walk_ref(va)?;
        let pte = unsafe { pte.as_ref() };
        if !pte.is_leaf() || !pte.flags().contains(required) {
            return None;
        }
        Some(pte.phys_addr())
    }

    /// Physical address of a user-accessible, resident page, or `None` if
    /// absent, not valid, or not user-accessible. Never allocates.
    #[must_use]
    pub fn walk_user(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.resolve_virtual_address(va, PtEntryFlags::U)
    }

    /// Installs a single leaf mapping. `va` must be page-aligned; `perm`
    /// must carry at least one of R/W/X. Panics on an attempt to remap an
    /// already-present entry.
    pub(crate) fn map_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        perm: PtEntryFlags,
        frames: &impl FrameSource,
    ) -> Result<(), VmError> {
        debug_assert!(va.is_page_aligned(), "map_page: va={va:?} not page-aligned");
        debug_assert!(
            perm.intersects(PtEntryFlags::RWX),
            "map_page: perm={perm:?} has no R/W/X bit"
        );
        let mut pte = self.walk_alloc(va, frames)?;
        let pte = unsafe { pte.as_mut() };
        assert!(
            !pte.is_valid() && !pte.is_paged_out(),
            "map_page: remap at already-mapped va={va:?}"
        );
        *pte = PtEntry::new(pa.phys_page_num(), perm | PtEntryFlags::V);
        Ok(())
    }

    /// Installs leaf mappings for every page covering `[va, va + size)`.
    /// `va` and `size` need not be page-aligned: the first and last pages
    /// are determined by rounding down. `pa` advances one page per
    /// iteration starting from its own page-aligned value.
    ///
    /// On OOM partway through, the mappings already installed are left in
    /// place; the caller owns cleanup (there is no partial address space to
    /// roll back here, only a boot-time identity map).
    pub fn map_range(
        &mut self,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        perm: PtEntryFlags,
        frames: &impl FrameSource,
    ) -> Result<(), VmError> {
        assert_ne!(size, 0, "map_range: zero-length range");
        let first = va.page_rounddown();
        let last = va.byte_add(size - 1).page_rounddown();
        let mut v = first;
        let mut p = pa.page_rounddown();
        loop {
            self.map_page(v, p, perm, frames)?;
            if v == last {
                return Ok(());
            }
            v = v.byte_add(PAGE_SIZE);
            p = p.byte_add(PAGE_SIZE);
        }
    }

    /// Recursively frees every internal (non-leaf) page-table page
    /// reachable from `self`, clearing each entry as it goes. Panics if a
    /// leaf entry remains: callers must unmap every user page first.
    pub(crate) fn free_walk(&mut self, frames: &impl FrameSource) {
        for pte in &mut self.0 {
            if !pte.is_valid() {
                continue;
            }
            assert!(pte.is_internal(), "free_walk: leaf entry remains");
            let mut child: NonNull<PageTable> = pte.phys_addr().as_mut_ptr();
            unsafe { child.as_mut() }.free_walk(frames);
            frames.free_frame(pte.phys_addr());
            pte.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFrames;

    #[test]
    fn map_and_resolve_single_page() {
        let frames = MockFrames::new(8);
        let mut root = PageTable::allocate_zeroed(&frames).unwrap();
        let root = unsafe { root.as_mut() };
        let frame = frames.alloc_frame().unwrap();
        let va = VirtAddr::new(0x1000);
        root.map_page(va, frame, PtEntryFlags::URW, &frames).unwrap();
        assert_eq!(root.resolve_virtual_address(va, PtEntryFlags::UR), Some(frame));
        assert_eq!(root.resolve_virtual_address(va, PtEntryFlags::UW), Some(frame));
        assert_eq!(root.resolve_virtual_address(va.byte_add(0x10), PtEntryFlags::UR), None);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remap_panics() {
        let frames = MockFrames::new(8);
        let mut root = PageTable::allocate_zeroed(&frames).unwrap();
        let root = unsafe { root.as_mut() };
        let va = VirtAddr::new(0);
        root.map_page(va, frames.alloc_frame().unwrap(), PtEntryFlags::URW, &frames)
            .unwrap();
        root.map_page(va, frames.alloc_frame().unwrap(), PtEntryFlags::URW, &frames)
            .unwrap();
    }

    #[test]
    fn map_range_spans_rounded_boundaries() {
        let frames = MockFrames::new(16);
        let mut root = PageTable::allocate_zeroed(&frames).unwrap();
        let root = unsafe { root.as_mut() };
        let base = frames.alloc_frame().unwrap();
        // 10 bytes into a page, spanning just past the next page boundary.
        root.map_range(VirtAddr::new(10), PAGE_SIZE + 1, base, PtEntryFlags::URWX, &frames)
            .unwrap();
        assert!(root
            .resolve_virtual_address(VirtAddr::new(0), PtEntryFlags::UR)
            .is_some());
        assert!(root
            .resolve_virtual_address(VirtAddr::new(PAGE_SIZE), PtEntryFlags::UR)
            .is_some());
    }

    #[test]
    fn walk_ref_missing_table_returns_none() {
        let frames = MockFrames::new(4);
        let mut root = PageTable::allocate_zeroed(&frames).unwrap();
        let root = unsafe { root.as_mut() };
        assert!(root.walk_ref(VirtAddr::new(0x40_0000)).is_none());
    }

    #[test]
    fn free_walk_reclaims_internal_tables() {
        let frames = MockFrames::new(8);
        let before = frames.free_count();
        let mut root = PageTable::allocate_zeroed(&frames).unwrap();
        {
            let root = unsafe { root.as_mut() };
            let frame = frames.alloc_frame().unwrap();
            root.map_page(VirtAddr::new(0), frame, PtEntryFlags::URW, &frames)
                .unwrap();
            frames.free_frame(frame);
            // Clear the leaf so free_walk only finds internal nodes.
            let mut pte = root.walk_ref(VirtAddr::new(0)).unwrap();
            unsafe { pte.as_mut() }.clear();
        }
        unsafe { root.as_mut() }.free_walk(&frames);
        frames.free_frame(unsafe { root.as_ref() }.phys_addr());
        assert_eq!(frames.free_count(), before);
    }
}
