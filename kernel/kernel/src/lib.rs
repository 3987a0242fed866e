//! The kernel's virtual-memory core
//!
//! This crate completes the allocator stack on top of the arch crate's
//! page-table engine: the vmalloc allocator for virtually contiguous kernel
//! memory, the size-dispatching general allocator, and the global init
//! sequence that wires boot allocator, page allocator, slab, page table and
//! vmalloc together in the right order.
#![no_std]

pub mod kmem;
pub mod logging;
pub mod universal;
pub mod vmalloc;

pub use universal::KernelAllocator;
pub use vmalloc::VmallocAllocator;
