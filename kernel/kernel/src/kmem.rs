//! Global construction of the kernel's memory management
//!
//! [`init`] wires the allocator tiers up in dependency order:
//!
//! 1. a bump allocator over the head of the physical window serves the pages
//!    for the very first kernel table,
//! 2. that table maps the direct physical window with hugepages and the
//!    kernel image with mid-size pages,
//! 3. the free-list page allocator takes over the remainder of the window,
//! 4. the permanent kernel table is rebuilt on the free-list allocator by a
//!    cross-allocator copy of the boot table (the bump pages are abandoned
//!    wholesale),
//! 5. the slab goes on top of the page allocator,
//! 6. address translation is switched to the permanent table,
//! 7. vmalloc is brought up over page allocator, slab and the live table.
//!
//! The singletons live in [`InitCell`]s: accessing them before [`init`] or
//! initializing twice panics, and they are never destroyed.

use crate::universal::KernelAllocator;
use crate::vmalloc::VmallocAllocator;
use allocators::{BootPageAllocator, FreeListPageAllocator, SlabAllocator};
use ksync::InitCell;
use riscv::mem::{
    PAddr, PageLevel, PageTable, Perm, PhysMapping, VAddr, HUGE_PAGESIZE, KERNEL_SPACE_START,
    MID_PAGESIZE, PAGESIZE, PHYS_MAP_SIZE, PHYS_MAP_START,
};

/// Pages reserved at the head of the physical window for bootstrapping the
/// first kernel table
const BOOT_PAGES: usize = 32;

pub type KernelPageAllocator = FreeListPageAllocator<'static>;
pub type KernelSlabAllocator = SlabAllocator<'static, KernelPageAllocator>;
pub type KernelPageTable = PageTable<'static, KernelPageAllocator>;
pub type KernelVmalloc = VmallocAllocator<'static, KernelPageAllocator, KernelSlabAllocator>;
pub type KernelUniversalAllocator =
    KernelAllocator<'static, KernelPageAllocator, KernelSlabAllocator, KernelVmalloc>;

static PAGE_ALLOC: InitCell<KernelPageAllocator> = InitCell::new();
static SLAB_ALLOC: InitCell<KernelSlabAllocator> = InitCell::new();
static KERNEL_PAGETABLE: InitCell<KernelPageTable> = InitCell::new();
static VMALLOC: InitCell<KernelVmalloc> = InitCell::new();

/// The global page allocator. Panics before [`init`].
pub fn page_alloc() -> &'static KernelPageAllocator {
    PAGE_ALLOC.get()
}

/// The global slab allocator. Panics before [`init`].
pub fn slab_alloc() -> &'static KernelSlabAllocator {
    SLAB_ALLOC.get()
}

/// The global vmalloc allocator. Panics before [`init`].
pub fn vmalloc() -> &'static KernelVmalloc {
    VMALLOC.get()
}

/// The kernel's page table. Panics before [`init`].
///
/// Mutations of this table go through the vmalloc lock; this accessor is for
/// reading walks and for installing the table on secondary harts.
pub fn kernel_pagetable() -> &'static KernelPageTable {
    KERNEL_PAGETABLE.get()
}

/// The size-dispatching allocator over the global tiers. Panics before
/// [`init`].
pub fn universal() -> KernelUniversalAllocator {
    KernelAllocator::new(page_alloc(), slab_alloc(), vmalloc())
}

/// Bring up the kernel's memory management.
///
/// `phys_map` describes how physical memory is reachable right now (identity
/// while paging is still off). `[mem_start, mem_start + mem_size)` is the
/// physical window handed over by the boot code; it must be unused RAM. The
/// kernel image at `[image_base, image_base + image_size)` is mapped to its
/// fixed virtual home so execution survives the translation switch.
///
/// # Safety
/// Must be called exactly once, on one hart, before any of the accessors in
/// this module are used. The given physical window must not be referenced by
/// anything else.
pub unsafe fn init(
    phys_map: PhysMapping,
    mem_start: PAddr,
    mem_size: u64,
    image_base: PAddr,
    image_size: u64,
) {
    assert!(
        mem_start.is_aligned_to(PAGESIZE as u64),
        "physical window start {mem_start:?} is not page-aligned"
    );
    assert!(
        mem_size as usize > BOOT_PAGES * PAGESIZE,
        "physical window is too small to bootstrap from"
    );
    log::info!("bringing up kernel memory management over {mem_size} bytes at {mem_start:?}");

    // 1. a handful of pages for the first kernel table
    let boot_window = core::slice::from_raw_parts_mut(
        phys_map.map(mem_start).as_mut_ptr::<u8>(),
        BOOT_PAGES * PAGESIZE,
    );
    let boot_alloc = BootPageAllocator::new(boot_window);

    // 2. the initial kernel mapping
    let mut boot_table = PageTable::new(&boot_alloc, phys_map);
    let mut offset = 0;
    while offset < PHYS_MAP_SIZE {
        boot_table.add_mapping(
            VAddr::new(PHYS_MAP_START + offset),
            PAddr::new(offset),
            Perm::READ | Perm::WRITE,
            PageLevel::Huge,
        );
        offset += HUGE_PAGESIZE as u64;
    }
    if image_size > 0 {
        assert!(
            image_base.is_aligned_to(MID_PAGESIZE as u64),
            "kernel image base {image_base:?} is not aligned to a mid-size page"
        );
        let mut offset = 0;
        while offset < image_size {
            boot_table.add_mapping(
                VAddr::new(KERNEL_SPACE_START + offset),
                image_base + offset,
                Perm::READ | Perm::WRITE | Perm::EXEC,
                PageLevel::Mid,
            );
            offset += MID_PAGESIZE as u64;
        }
    }

    // 3. the permanent page allocator over the remaining window
    let list_start = phys_map.map(mem_start + (BOOT_PAGES * PAGESIZE) as u64);
    let list_len = (mem_size as usize - BOOT_PAGES * PAGESIZE) & !(PAGESIZE - 1);
    PAGE_ALLOC.set(FreeListPageAllocator::new(core::slice::from_raw_parts_mut(
        list_start.as_mut_ptr::<u8>(),
        list_len,
    )));

    // 4. move the kernel table onto the permanent allocator; the boot table
    //    and its bump pages are abandoned afterwards
    let mut kernel_table = PageTable::new(PAGE_ALLOC.get(), phys_map);
    kernel_table.assign(&boot_table);
    KERNEL_PAGETABLE.set(kernel_table);

    // 5. small objects
    SLAB_ALLOC.set(SlabAllocator::new(PAGE_ALLOC.get()));

    // 6. run on the permanent table from here on
    #[cfg(target_arch = "riscv64")]
    riscv::cpu::use_pagetable(KERNEL_PAGETABLE.get().entry());

    // 7. virtually contiguous allocations on top of everything
    VMALLOC.set(VmallocAllocator::new(
        KERNEL_PAGETABLE.get_raw(),
        PAGE_ALLOC.get(),
        SLAB_ALLOC.get(),
    ));

    log::info!(
        "kernel memory management is live, {} pages in the page allocator",
        list_len / PAGESIZE
    );
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use allocators::{PageAllocator, UniversalAllocator, VPageAllocator};
    use riscv::mem::{MemoryPage, VMALLOC_START};
    use std::boxed::Box;
    use std::vec;

    // the singletons exist once per test binary, so the whole bring-up is
    // exercised in a single test
    #[test]
    fn test_init_brings_up_the_whole_stack() {
        let pages = 512;
        let buffer = Box::leak(vec![MemoryPage::default(); pages].into_boxed_slice());
        let mem_start = PAddr::new(buffer.as_ptr() as u64);

        unsafe {
            init(
                PhysMapping::identity(),
                mem_start,
                (pages * PAGESIZE) as u64,
                PAddr::new(MID_PAGESIZE as u64),
                MID_PAGESIZE as u64,
            )
        };

        // the boot mappings ended up in the permanent table
        let table = kernel_pagetable();
        assert_eq!(
            table.transform(VAddr::new(PHYS_MAP_START + 0x1234)),
            PAddr::new(0x1234)
        );
        assert_eq!(
            table.transform(VAddr::new(KERNEL_SPACE_START + 0x4_5678)),
            PAddr::new(MID_PAGESIZE as u64 + 0x4_5678)
        );
        assert_eq!(
            table.get_page_perm(VAddr::new(KERNEL_SPACE_START)),
            Perm::READ | Perm::WRITE | Perm::EXEC
        );

        // every tier is reachable and serves memory
        assert!(page_alloc().alloc_page(2).is_ok());
        let range = vmalloc().alloc_vpage(4).unwrap();
        assert_eq!(range.as_ptr() as u64, VMALLOC_START);
        unsafe { vmalloc().dealloc_vpage(range) };

        let universal = universal();
        let small = universal.allocate(100, 8);
        let large = universal.allocate(5 * PAGESIZE, 8);
        assert!(!small.is_null());
        assert!(!large.is_null());
        assert_eq!(large as u64, VMALLOC_START);
        unsafe {
            universal.deallocate(small, 100, 8);
            universal.deallocate(large, 5 * PAGESIZE, 8);
        }
    }
}
