//! In-memory stand-ins for [`crate::collab::FrameSource`],
//! [`crate::collab::Platform`], and [`crate::collab::SwapDevice`], used only
//! by this crate's own unit tests.
//!
//! Physical addresses handed out here are real heap addresses of a `Box`
//! allocation held by [`MockFrames`], so raw-pointer page-table code runs
//! exactly as it would against identity-mapped RAM, with no `unsafe`
//! shortcuts taken on the test side.

extern crate std;

use std::boxed::Box;
use std::cell::RefCell;
use std::vec;
use std::vec::Vec;

use crate::addr::{PageRound, PhysAddr};
use crate::collab::{FrameSource, Platform, SwapDevice};
use crate::error::VmError;
use crate::param::PAGE_SIZE;

pub struct MockFrames {
    // Kept alive for the lifetime of the allocator; never read directly.
    _pool: Box<[u8]>,
    free: RefCell<Vec<usize>>,
    tlb_flushes: RefCell<usize>,
}

impl MockFrames {
    #[must_use]
    pub fn new(num_pages: usize) -> Self {
        let pool = vec![0u8; num_pages * PAGE_SIZE + PAGE_SIZE].into_boxed_slice();
        let base = pool.as_ptr().addr().page_roundup();
        let free = (0..num_pages).map(|i| base + i * PAGE_SIZE).collect();
        Self {
            _pool: pool,
            free: RefCell::new(free),
            tlb_flushes: RefCell::new(0),
        }
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.borrow().len()
    }

    #[must_use]
    pub fn tlb_flush_count(&self) -> usize {
        *self.tlb_flushes.borrow()
    }
}

impl FrameSource for MockFrames {
    fn alloc_frame(&self) -> Option<PhysAddr> {
        self.free.borrow_mut().pop().map(PhysAddr::new)
    }

    fn free_frame(&self, pa: PhysAddr) {
        let mut free = self.free.borrow_mut();
        assert!(
            !free.contains(&pa.addr()),
            "double free of frame {pa:?}"
        );
        free.push(pa.addr());
    }
}

impl Platform for MockFrames {
    fn tlb_flush(&self) {
        *self.tlb_flushes.borrow_mut() += 1;
    }
}

/// A process's swap file, backed by a plain byte vector sized for
/// [`crate::param::MAX_DISC_PAGES`] slots.
pub struct MockSwap {
    data: RefCell<Vec<u8>>,
}

impl MockSwap {
    #[must_use]
    pub fn new(num_slots: usize) -> Self {
        Self {
            data: RefCell::new(vec![0u8; num_slots * PAGE_SIZE]),
        }
    }
}

impl SwapDevice for MockSwap {
    fn write(&self, offset: usize, buf: &[u8]) -> Result<(), VmError> {
        self.data.borrow_mut()[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), VmError> {
        buf.copy_from_slice(&self.data.borrow()[offset..offset + buf.len()]);
        Ok(())
    }
}

/// A [`MockSwap`] that fails every I/O, for exercising swap-backend error
/// propagation.
pub struct FailingSwap;

impl SwapDevice for FailingSwap {
    fn write(&self, _offset: usize, _buf: &[u8]) -> Result<(), VmError> {
        Err(VmError::SwapFull)
    }

    fn read(&self, _offset: usize, _buf: &mut [u8]) -> Result<(), VmError> {
        Err(VmError::SwapFull)
    }
}
