//! TLB maintenance
//!
//! The page-table engine never flushes on its own. The required ordering for
//! removing a mapping is: invalidate the entry, flush the local hart, then
//! broadcast to the other harts. The vmalloc deallocation path is the
//! canonical user of that sequence.
//!
//! On targets other than riscv64 there is no TLB to maintain and all
//! functions compile to nothing, which keeps the callers testable on a host.

use crate::mem::VAddr;

/// Flush the whole TLB of the executing hart
#[cfg(target_arch = "riscv64")]
pub fn flush_all() {
    unsafe { core::arch::asm!("sfence.vma") };
}

/// Flush all translations for the page containing `vaddr` from the executing
/// hart's TLB
#[cfg(target_arch = "riscv64")]
pub fn flush_address(vaddr: VAddr) {
    unsafe { core::arch::asm!("sfence.vma {}", in(reg) vaddr.raw()) };
}

/// Ask every other hart to flush its whole TLB
#[cfg(target_arch = "riscv64")]
pub fn remote_flush_all() {
    crate::sbi::remote_sfence_vma(0, u64::MAX);
}

/// Ask every other hart to flush translations for `length` bytes starting at
/// `start`
#[cfg(target_arch = "riscv64")]
pub fn remote_flush_range(start: VAddr, length: u64) {
    crate::sbi::remote_sfence_vma(start.raw(), length);
}

#[cfg(not(target_arch = "riscv64"))]
pub fn flush_all() {}

#[cfg(not(target_arch = "riscv64"))]
pub fn flush_address(_vaddr: VAddr) {}

#[cfg(not(target_arch = "riscv64"))]
pub fn remote_flush_all() {}

#[cfg(not(target_arch = "riscv64"))]
pub fn remote_flush_range(_start: VAddr, _length: u64) {}
