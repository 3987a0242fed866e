use crate::PAGE_SIZE;
use core::ptr::NonNull;
use thiserror_no_std::Error;

/// The error returned when an allocation fails
#[derive(Debug, Error, Eq, PartialEq)]
pub enum AllocError {
    #[error("the allocator has insufficient free memory to allocate the requested amount")]
    InsufficientMemory,
    #[error("zero-sized allocations are not supported")]
    ZeroSize,
}

/// An allocator that hands out whole pages of memory.
///
/// Implementations synchronise internally, so allocation only needs a shared
/// reference and the allocator can be handed to several users at once.
pub trait PageAllocator {
    /// Size in bytes of the pages this allocator hands out
    const PAGE_SIZE: usize = PAGE_SIZE;

    /// Allocate `count` contiguous pages and return the address of the first
    /// one.
    ///
    /// The returned memory is page-aligned and not initialized.
    fn alloc_page(&self, count: usize) -> Result<NonNull<u8>, AllocError>;

    /// Return `count` pages starting at `ptr` to the allocator.
    ///
    /// # Safety
    /// The pages must have been allocated from this allocator and must no
    /// longer be accessed after this call.
    unsafe fn dealloc_page(&self, ptr: NonNull<u8>, count: usize);
}

/// An allocator serving small byte-granular objects.
pub trait ByteAllocator {
    /// The largest request in bytes this allocator serves
    const MAX_SLAB_SIZE: usize;

    /// Allocate `size` bytes.
    fn alloc_byte(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Return an object of `size` bytes to the allocator.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`alloc_byte`](ByteAllocator::alloc_byte)
    /// with the same `size` and must no longer be accessed after this call.
    unsafe fn dealloc_byte(&self, ptr: NonNull<u8>, size: usize);
}

/// An allocator that hands out virtually contiguous pages which need not be
/// physically contiguous.
pub trait VPageAllocator {
    /// Size in bytes of the pages this allocator hands out
    const VPAGE_SIZE: usize = PAGE_SIZE;

    /// Allocate `count` virtually contiguous pages.
    fn alloc_vpage(&self, count: usize) -> Result<NonNull<u8>, AllocError>;

    /// Release the virtually contiguous range starting at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be the start address of a live allocation made through
    /// [`alloc_vpage`](VPageAllocator::alloc_vpage).
    unsafe fn dealloc_vpage(&self, ptr: NonNull<u8>);
}

/// A general-purpose front end that picks a backing allocator based on the
/// requested size.
///
/// This is the raw-pointer surface handed to code that expects malloc-like
/// behavior: failures are reported as null pointers instead of errors.
pub trait UniversalAllocator {
    /// Allocate `size` bytes, returning a null pointer when no memory is
    /// available. Alignment beyond the natural alignment of the chosen
    /// backend is not honored.
    fn allocate(&self, size: usize, align: usize) -> *mut u8;

    /// Release an allocation made through
    /// [`allocate`](UniversalAllocator::allocate).
    ///
    /// # Safety
    /// `ptr`, `size` and `align` must match the original allocation.
    unsafe fn deallocate(&self, ptr: *mut u8, size: usize, align: usize);
}
