//! Virtually contiguous allocation of physically fragmented kernel pages
//!
//! The allocator hands out page ranges from the fixed vmalloc window. Each
//! page of a range is backed by an individually allocated physical page and
//! mapped into the kernel page table, so large allocations keep working long
//! after the physical page pool has fragmented.
//!
//! Occupied ranges are tracked in a singly linked list of regions sorted by
//! start address; the gaps between neighbouring regions are the free space.
//! List nodes come from the slab. The list head *and* the page-table pointer
//! live behind one interrupt-safe lock, which is the lock every mutation of
//! the kernel table runs under. Calls into the page allocator happen with
//! that lock held, so nothing may take the vmalloc lock while holding the
//! page allocator's.

use allocators::{AllocError, ByteAllocator, PageAllocator, VPageAllocator};
use core::mem;
use core::ptr;
use core::ptr::NonNull;
use ksync::InterruptSpinLock;
use riscv::mem::{PageLevel, PageTable, Perm, VAddr, PAGESIZE, VMALLOC_END, VMALLOC_START};
use riscv::tlb;

/// An occupied stretch of the vmalloc window
struct Region {
    va: u64,
    pages: usize,
    next: *mut Region,
}

struct VmallocState<'a, P: PageAllocator> {
    /// the region list, sorted by `va` ascending
    head: *mut Region,
    /// the live kernel table; only ever touched while the surrounding lock is held
    pagetable: *mut PageTable<'a, P>,
}

unsafe impl<P: PageAllocator> Send for VmallocState<'_, P> {}

/// Allocator for virtually contiguous, physically fragmented kernel pages
pub struct VmallocAllocator<'a, P: PageAllocator, S: ByteAllocator> {
    state: InterruptSpinLock<VmallocState<'a, P>>,
    page_alloc: &'a P,
    node_alloc: &'a S,
}

impl<'a, P: PageAllocator, S: ByteAllocator> VmallocAllocator<'a, P, S> {
    /// Create a new allocator serving the vmalloc window through the given
    /// kernel table.
    ///
    /// # Safety
    /// `pagetable` must outlive the allocator and must not be mutated by
    /// anyone else for as long as the allocator exists.
    pub unsafe fn new(pagetable: *mut PageTable<'a, P>, page_alloc: &'a P, node_alloc: &'a S) -> Self {
        Self {
            state: InterruptSpinLock::new(VmallocState {
                head: ptr::null_mut(),
                pagetable,
            }),
            page_alloc,
            node_alloc,
        }
    }

    /// Return the physical page backing `vaddr` to the page allocator and
    /// drop the mapping. The caller is responsible for TLB maintenance.
    fn release_page(&self, pagetable: &mut PageTable<'a, P>, vaddr: VAddr) {
        let paddr = pagetable.transform(vaddr);
        let page = pagetable.phys_map().map(paddr);
        unsafe {
            self.page_alloc
                .dealloc_page(NonNull::new_unchecked(page.as_mut_ptr()), 1)
        };
        pagetable.del_mapping(vaddr);
    }
}

impl<'a, P: PageAllocator, S: ByteAllocator> VPageAllocator for VmallocAllocator<'a, P, S> {
    fn alloc_vpage(&self, count: usize) -> Result<NonNull<u8>, AllocError> {
        if count == 0 {
            return Err(AllocError::ZeroSize);
        }
        let mut state = self.state.spin_lock();

        // first fit over the gaps between neighbouring regions, with the
        // window edges acting as virtual neighbours
        let (va, link) = unsafe {
            let mut link: *mut *mut Region = &mut state.head;
            let mut gap_start = VMALLOC_START;
            loop {
                let region = *link;
                let gap_end = if region.is_null() {
                    VMALLOC_END
                } else {
                    (*region).va
                };
                if ((gap_end - gap_start) / PAGESIZE as u64) as usize >= count {
                    break (gap_start, link);
                }
                if region.is_null() {
                    return Err(AllocError::InsufficientMemory);
                }
                gap_start = (*region).va + ((*region).pages * PAGESIZE) as u64;
                link = &mut (*region).next;
            }
        };

        // take the list node first so a failure leaves nothing to undo
        let node = self.node_alloc.alloc_byte(mem::size_of::<Region>())?;

        // back the range page by page; the physical pages need not be
        // contiguous
        let pagetable = unsafe { &mut *state.pagetable };
        for i in 0..count {
            let page = match self.page_alloc.alloc_page(1) {
                Ok(page) => page,
                Err(error) => {
                    // roll the partially committed range back; none of these
                    // pages were ever accessed so no flush is needed
                    for j in 0..i {
                        self.release_page(pagetable, VAddr::new(va + (j * PAGESIZE) as u64));
                    }
                    unsafe { self.node_alloc.dealloc_byte(node, mem::size_of::<Region>()) };
                    return Err(error);
                }
            };
            let paddr = pagetable.phys_map().rev_map(VAddr::from_ptr(page.as_ptr()));
            pagetable.add_mapping(
                VAddr::new(va + (i * PAGESIZE) as u64),
                paddr,
                Perm::READ | Perm::WRITE | Perm::EXEC,
                PageLevel::Base,
            );
        }

        // record the new region in its address-ordered place
        unsafe {
            let node = node.as_ptr() as *mut Region;
            node.write(Region {
                va,
                pages: count,
                next: *link,
            });
            *link = node;
        }

        log::trace!("vmalloc handed out {count} pages at {va:#x}");
        Ok(unsafe { NonNull::new_unchecked(va as *mut u8) })
    }

    unsafe fn dealloc_vpage(&self, ptr: NonNull<u8>) {
        let va = ptr.as_ptr() as u64;
        let mut state = self.state.spin_lock();

        // find the region that starts exactly at `va`
        let mut link: *mut *mut Region = &mut state.head;
        let region = loop {
            let region = *link;
            assert!(!region.is_null(), "no vmalloc region starts at {va:#x}");
            if (*region).va == va {
                break region;
            }
            link = &mut (*region).next;
        };

        let pagetable = &mut *state.pagetable;
        let pages = (*region).pages;
        for i in 0..pages {
            let vaddr = VAddr::new(va + (i * PAGESIZE) as u64);
            self.release_page(pagetable, vaddr);
            tlb::flush_address(vaddr);
        }
        // one broadcast shootdown covers the whole range
        tlb::remote_flush_range(VAddr::new(va), (pages * PAGESIZE) as u64);

        *link = (*region).next;
        self.node_alloc
            .dealloc_byte(NonNull::new_unchecked(region as *mut u8), mem::size_of::<Region>());

        log::trace!("vmalloc released {pages} pages at {va:#x}");
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use allocators::{FreeListPageAllocator, SlabAllocator};
    use riscv::mem::{MemoryPage, PhysMapping};
    use std::boxed::Box;
    use std::vec;

    type TestVmalloc = VmallocAllocator<
        'static,
        FreeListPageAllocator<'static>,
        SlabAllocator<'static, FreeListPageAllocator<'static>>,
    >;

    fn fresh_vmalloc(pages: usize) -> TestVmalloc {
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
        unsafe { VmallocAllocator::new(pagetable, page_alloc, slab) }
    }

    #[test]
    fn test_ranges_are_window_relative_and_first_fit() {
        let vmalloc = fresh_vmalloc(64);
        let first = vmalloc.alloc_vpage(2).unwrap();
        assert_eq!(first.as_ptr() as u64, VMALLOC_START);

        let second = vmalloc.alloc_vpage(3).unwrap();
        assert_eq!(second.as_ptr() as u64, VMALLOC_START + 2 * PAGESIZE as u64);

        unsafe { vmalloc.dealloc_vpage(first) };
        // the freshly opened gap at the window start is used again first
        let third = vmalloc.alloc_vpage(1).unwrap();
        assert_eq!(third.as_ptr() as u64, VMALLOC_START);
    }

    #[test]
    fn test_ranges_are_backed_by_real_memory() {
        let vmalloc = fresh_vmalloc(64);
        let range = vmalloc.alloc_vpage(3).unwrap();
        let state = vmalloc.state.spin_lock();
        let pagetable = unsafe { &*state.pagetable };

        for i in 0..3u64 {
            let vaddr = VAddr::new(range.as_ptr() as u64 + i * PAGESIZE as u64);
            let paddr = pagetable.transform(vaddr);
            // under the identity mapping of this test the physical address is
            // dereferencable directly
            let backing = paddr.raw() as *mut u64;
            unsafe {
                backing.write(0xdead_beef + i);
                assert_eq!(backing.read(), 0xdead_beef + i);
            }
        }
    }

    #[test]
    fn test_skipped_gap_is_too_small() {
        let vmalloc = fresh_vmalloc(64);
        let first = vmalloc.alloc_vpage(1).unwrap();
        let _second = vmalloc.alloc_vpage(1).unwrap();
        unsafe { vmalloc.dealloc_vpage(first) };

        // the single-page gap at the window start does not fit two pages
        let third = vmalloc.alloc_vpage(2).unwrap();
        assert_eq!(third.as_ptr() as u64, VMALLOC_START + 2 * PAGESIZE as u64);
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        // 6 pages total: root + level-1 + level-0 tables plus two usable
        // physical pages plus one slab page
        let vmalloc = fresh_vmalloc(6);

        assert_eq!(
            vmalloc.alloc_vpage(3),
            Err(AllocError::InsufficientMemory)
        );
        // the rollback returned everything, so a smaller request still works
        let range = vmalloc.alloc_vpage(1).unwrap();
        assert_eq!(range.as_ptr() as u64, VMALLOC_START);
    }

    #[test]
    #[should_panic]
    fn test_releasing_an_unknown_range_panics() {
        let vmalloc = fresh_vmalloc(64);
        let _ = vmalloc.alloc_vpage(1).unwrap();
        unsafe {
            vmalloc.dealloc_vpage(NonNull::new_unchecked(
                (VMALLOC_START + PAGESIZE as u64) as *mut u8,
            ))
        };
    }

    #[test]
    fn test_release_unmaps_the_range() {
        let vmalloc = fresh_vmalloc(64);
        let range = vmalloc.alloc_vpage(2).unwrap();
        unsafe { vmalloc.dealloc_vpage(range) };

        let state = vmalloc.state.spin_lock();
        let pagetable = unsafe { &*state.pagetable };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pagetable.transform(VAddr::new(VMALLOC_START))
        }));
        assert!(result.is_err());
    }
}
