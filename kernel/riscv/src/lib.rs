#![no_std]

// data structures that are riscv specific but implemented in pure rust
pub mod mem;
pub mod tlb;

// actual riscv specific parts
#[cfg(target_arch = "riscv64")]
pub mod cpu;
#[cfg(target_arch = "riscv64")]
pub mod sbi;
