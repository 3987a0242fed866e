//! The size-dispatching front end over the allocator tiers
//!
//! Small requests go to the slab, requests up to two pages to the page
//! allocator, and everything larger to vmalloc, where physical fragmentation
//! cannot hurt anymore. Deallocation dispatches on the same size, so callers
//! must remember how large their allocation was.

use allocators::{ByteAllocator, PageAllocator, UniversalAllocator, VPageAllocator};
use core::ptr;
use core::ptr::NonNull;
use riscv::mem::PAGESIZE;

/// Requests above this many bytes skip the page allocator and go to vmalloc
const PAGE_ALLOC_LIMIT: usize = 2 * PAGESIZE;

/// A general-purpose allocator dispatching between slab, page allocator and
/// vmalloc based on the request size
pub struct KernelAllocator<'a, P, S, V> {
    page_alloc: &'a P,
    slab_alloc: &'a S,
    vpage_alloc: &'a V,
}

impl<'a, P, S, V> KernelAllocator<'a, P, S, V> {
    pub const fn new(page_alloc: &'a P, slab_alloc: &'a S, vpage_alloc: &'a V) -> Self {
        Self {
            page_alloc,
            slab_alloc,
            vpage_alloc,
        }
    }
}

impl<P, S, V> UniversalAllocator for KernelAllocator<'_, P, S, V>
where
    P: PageAllocator,
    S: ByteAllocator,
    V: VPageAllocator,
{
    fn allocate(&self, size: usize, _align: usize) -> *mut u8 {
        // every backend hands out memory at its natural alignment; anything
        // stricter is not supported
        let result = if size == 0 {
            return ptr::null_mut();
        } else if size <= S::MAX_SLAB_SIZE {
            self.slab_alloc.alloc_byte(size)
        } else if size <= PAGE_ALLOC_LIMIT {
            self.page_alloc.alloc_page(size.div_ceil(PAGESIZE))
        } else {
            self.vpage_alloc.alloc_vpage(size.div_ceil(PAGESIZE))
        };

        match result {
            Ok(allocation) => allocation.as_ptr(),
            Err(error) => {
                log::warn!("allocation of {size} bytes failed: {error}");
                ptr::null_mut()
            }
        }
    }

    unsafe fn deallocate(&self, ptr: *mut u8, size: usize, _align: usize) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if size <= S::MAX_SLAB_SIZE {
            self.slab_alloc.dealloc_byte(ptr, size);
        } else if size <= PAGE_ALLOC_LIMIT {
            self.page_alloc.dealloc_page(ptr, size.div_ceil(PAGESIZE));
        } else {
            self.vpage_alloc.dealloc_vpage(ptr);
        }
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use crate::vmalloc::VmallocAllocator;
    use allocators::{FreeListPageAllocator, SlabAllocator, MAX_SLAB_SIZE};
    use riscv::mem::{MemoryPage, PageTable, PhysMapping, VMALLOC_END, VMALLOC_START};
    use std::boxed::Box;
    use std::vec;

    type TestAllocator = KernelAllocator<
        'static,
        FreeListPageAllocator<'static>,
        SlabAllocator<'static, FreeListPageAllocator<'static>>,
        VmallocAllocator<
            'static,
            FreeListPageAllocator<'static>,
            SlabAllocator<'static, FreeListPageAllocator<'static>>,
        >,
    >;

    fn fresh_allocator(pages: usize) -> TestAllocator {
        let buffer = Box::leak(vec![MemoryPage::default(); pages].into_boxed_slice());
        let buffer = unsafe {
            core::slice::from_raw_parts_mut(buffer.as_mut_ptr().cast::<u8>(), pages * PAGESIZE)
        };
        let page_alloc = Box::leak(Box::new(FreeListPageAllocator::new(buffer)));
        let slab = Box::leak(Box::new(SlabAllocator::new(&*page_alloc)));
        let pagetable = Box::leak(Box::new(PageTable::new(
            &*page_alloc,
            PhysMapping::identity(),
        )));
        let vmalloc = Box::leak(Box::new(unsafe {
            VmallocAllocator::new(pagetable, page_alloc, slab)
        }));
        KernelAllocator::new(page_alloc, slab, vmalloc)
    }

    fn in_vmalloc_window(ptr: *mut u8) -> bool {
        (ptr as u64) >= VMALLOC_START && (ptr as u64) < VMALLOC_END
    }

    #[test]
    fn test_zero_sized_allocations_return_null() {
        let alloc = fresh_allocator(16);
        assert!(alloc.allocate(0, 8).is_null());
    }

    #[test]
    fn test_small_requests_come_from_the_slab() {
        let alloc = fresh_allocator(16);
        let allocation = alloc.allocate(24, 8);
        assert!(!allocation.is_null());
        assert!(!in_vmalloc_window(allocation));
        unsafe { alloc.deallocate(allocation, 24, 8) };
    }

    #[test]
    fn test_mid_sized_requests_come_from_the_page_allocator() {
        let alloc = fresh_allocator(16);
        // above the slab limit but at most two pages
        for size in [MAX_SLAB_SIZE + 1, PAGESIZE, 2 * PAGESIZE] {
            let allocation = alloc.allocate(size, 8);
            assert!(!allocation.is_null());
            assert!(!in_vmalloc_window(allocation));
            assert_eq!(allocation as usize % PAGESIZE, 0);
            unsafe { alloc.deallocate(allocation, size, 8) };
        }
    }

    #[test]
    fn test_large_requests_come_from_vmalloc() {
        let alloc = fresh_allocator(16);
        let size = 2 * PAGESIZE + 1;
        let allocation = alloc.allocate(size, 8);
        assert!(!allocation.is_null());
        assert!(in_vmalloc_window(allocation));
        unsafe { alloc.deallocate(allocation, size, 8) };

        // the range is free again afterwards
        let again = alloc.allocate(size, 8);
        assert_eq!(again, allocation);
    }

    #[test]
    fn test_exhaustion_reports_null() {
        let alloc = fresh_allocator(4);
        let first = alloc.allocate(2 * PAGESIZE, 8);
        let second = alloc.allocate(2 * PAGESIZE, 8);
        assert!(!first.is_null());
        assert!(!second.is_null());
        assert!(alloc.allocate(PAGESIZE, 8).is_null());
    }
}
