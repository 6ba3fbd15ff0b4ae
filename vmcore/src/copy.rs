//! Cross-address-space copy routines: moving bytes between kernel memory and
//! user virtual addresses without switching page tables.
//!
//! None of these trigger demand-paging fault-in: a destination or source
//! page that is only reachable via its swap-file copy is treated exactly
//! like an unmapped one.

use crate::addr::{PageRound, VirtAddr};
use crate::error::VmError;
use crate::page_table::{PageTable, PtEntryFlags};
use crate::param::PAGE_SIZE;

/// Copies `src` into the user address space at `dst_va`, one page at a time.
pub fn copy_out(pt: &PageTable, dst_va: VirtAddr, src: &[u8]) -> Result<(), VmError> {
    let mut dst_va = dst_va;
    let mut src = src;
    while !src.is_empty() {
        let page_va = dst_va.page_rounddown();
        let pa = pt
            .resolve_virtual_address(page_va, PtEntryFlags::UW)
            .ok_or(VmError::BadAddress(page_va))?;
        let offset = dst_va.addr() - page_va.addr();
        let n = (PAGE_SIZE - offset).min(src.len());
        unsafe {
            let dst = pa.as_mut_ptr::<u8>().as_ptr().add(offset);
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst, n);
        }
        src = &src[n..];
        dst_va = page_va.byte_add(PAGE_SIZE);
    }
    Ok(())
}

/// Copies from the user address space at `src_va` into `dst`, one page at a
/// time.
pub fn copy_in(pt: &PageTable, dst: &mut [u8], src_va: VirtAddr) -> Result<(), VmError> {
    let mut src_va = src_va;
    let mut dst = dst;
    while !dst.is_empty() {
        let page_va = src_va.page_rounddown();
        let pa = pt
            .resolve_virtual_address(page_va, PtEntryFlags::UR)
            .ok_or(VmError::BadAddress(page_va))?;
        let offset = src_va.addr() - page_va.addr();
        let n = (PAGE_SIZE - offset).min(dst.len());
        unsafe {
            let src = pa.as_ptr::<u8>().add(offset);
            core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), n);
        }
        dst = &mut dst[n..];
        src_va = page_va.byte_add(PAGE_SIZE);
    }
    Ok(())
}

/// Copies a NUL-terminated string from the user address space at `src_va`
/// into `dst`, stopping at the first NUL byte or when `dst` is full,
/// whichever comes first. Returns `Ok(())` once a NUL has been copied;
/// `Err(VmError::BadAddress)` if the string runs off the end of `dst`
/// without a NUL, or through unmapped memory.
pub fn copy_in_str(pt: &PageTable, dst: &mut [u8], src_va: VirtAddr) -> Result<(), VmError> {
    let mut src_va = src_va;
    let mut written = 0usize;
    while written < dst.len() {
        let page_va = src_va.page_rounddown();
        let pa = pt
            .resolve_virtual_address(page_va, PtEntryFlags::UR)
            .ok_or(VmError::BadAddress(page_va))?;
        let offset = src_va.addr() - page_va.addr();
        let avail_in_page = PAGE_SIZE - offset;
        let remaining = dst.len() - written;
        let n = avail_in_page.min(remaining);
        let page_bytes = unsafe { core::slice::from_raw_parts(pa.as_ptr::<u8>().add(offset), n) };
        for &byte in page_bytes {
            dst[written] = byte;
            written += 1;
            if byte == 0 {
                return Ok(());
            }
        }
        src_va = page_va.byte_add(PAGE_SIZE);
    }
    Err(VmError::BadAddress(src_va))
}
