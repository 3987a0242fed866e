//! The three-level Sv39 translation tree and its ownership rules
//!
//! A [`PageTable`] owns the physical pages its translation tree is built from
//! and returns them to its page allocator when it is destroyed or overwritten.
//! The one exception to that ownership is the subtree-sharing protocol: an
//! interior entry carrying [`EntryFlags::Shared`] references a level-1 subtree
//! that belongs to *another* table and is therefore never freed through this
//! one. The table that owns a shared subtree pins it by setting `Shared` on
//! entry 0 of the level-1 page, and has to outlive every table that attached
//! to it.

use crate::mem::{
    EntryFlags, MemoryPage, PAddr, PageTableEntry, Perm, PhysMapping, VAddr, HUGE_PAGESIZE,
    MID_PAGESIZE, PAGESIZE,
};
use allocators::PageAllocator;
use core::fmt::{Debug, Formatter};
use core::ptr;
use core::ptr::NonNull;
use static_assertions::{assert_eq_align, assert_eq_size};

/// How many entries one translation table page holds
const ENTRY_COUNT: usize = PAGESIZE / core::mem::size_of::<PageTableEntry>();

/// One hardware translation table: 512 entries filling exactly one page
#[repr(C, align(4096))]
struct TablePage {
    entries: [PageTableEntry; ENTRY_COUNT],
}

assert_eq_size!(TablePage, MemoryPage);
assert_eq_align!(TablePage, MemoryPage);

/// The granularity of a single mapping
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageLevel {
    /// A 4 KiB mapping terminating in a level-0 table
    Base,
    /// A 2 MiB mapping terminating in a level-1 table
    Mid,
    /// A 1 GiB mapping terminating directly in the root table
    Huge,
}

impl PageLevel {
    /// How many bytes a mapping of this granularity covers
    pub const fn page_size(self) -> u64 {
        match self {
            PageLevel::Base => PAGESIZE as u64,
            PageLevel::Mid => MID_PAGESIZE as u64,
            PageLevel::Huge => HUGE_PAGESIZE as u64,
        }
    }

    /// The table level at which a mapping of this granularity terminates
    /// (0 for the last table, 2 for the root)
    pub const fn table_level(self) -> usize {
        match self {
            PageLevel::Base => 0,
            PageLevel::Mid => 1,
            PageLevel::Huge => 2,
        }
    }
}

/// How many bytes a mapping at `level` covers
pub const fn page_size(level: PageLevel) -> u64 {
    level.page_size()
}

/// An owning handle to a three-level Sv39 translation tree
///
/// The table starts out empty (no root page) and allocates table pages from
/// its [`PageAllocator`] as mappings are added. All accesses to table pages go
/// through the contained [`PhysMapping`], so the engine works identically
/// before paging is enabled, behind the kernel's direct-map window, and in
/// hosted tests.
///
/// Copying is deep: [`Clone`] and [`assign`](PageTable::assign) duplicate all
/// owned interior tables (using the destination's allocator) while borrowed
/// subtrees stay borrowed. Dropping a table recursively frees everything it
/// owns.
pub struct PageTable<'a, A: PageAllocator> {
    root: PAddr,
    phys_map: PhysMapping,
    alloc: &'a A,
}

impl<'a, A: PageAllocator> PageTable<'a, A> {
    /// Create a new, empty table that will allocate its pages from `alloc`
    /// and reach them through `phys_map`
    pub fn new(alloc: &'a A, phys_map: PhysMapping) -> Self {
        Self {
            root: PAddr::null(),
            phys_map,
            alloc,
        }
    }

    /// The physical address of the root table page, suitable for handing to
    /// the address-translation hardware. Null while the table is empty.
    pub fn entry(&self) -> PAddr {
        self.root
    }

    /// The physical-memory window this table is accessed through
    pub fn phys_map(&self) -> PhysMapping {
        self.phys_map
    }

    fn table_ptr(&self, table: PAddr) -> *mut TablePage {
        self.phys_map.map(table).as_mut_ptr::<TablePage>()
    }

    /// Allocate one zeroed page to hold a translation table
    fn alloc_table_page(&self) -> PAddr {
        let page = self
            .alloc
            .alloc_page(1)
            .expect("could not allocate a page for a translation table");
        unsafe { ptr::write_bytes(page.as_ptr(), 0, PAGESIZE) };
        self.phys_map.rev_map(VAddr::from_ptr(page.as_ptr()))
    }

    fn dealloc_table_page(&self, table: PAddr) {
        let page = self.phys_map.map(table);
        unsafe {
            self.alloc
                .dealloc_page(NonNull::new_unchecked(page.as_mut_ptr()), 1)
        };
    }

    fn ensure_root(&mut self) {
        if self.root.is_null() {
            self.root = self.alloc_table_page();
        }
    }

    /// Install a translation from `vaddr` to `paddr` at the given granularity.
    ///
    /// Both addresses must be aligned to `level`'s page size and the
    /// destination slot must not shadow any live mapping: walking into an
    /// existing leaf, or replacing an interior entry that still has leaves
    /// below it, panics. An interior entry whose subtree is empty is recycled
    /// before the slot is overwritten.
    pub fn add_mapping(&mut self, vaddr: VAddr, paddr: PAddr, perm: Perm, level: PageLevel) {
        log::debug!("mapping {vaddr:?} -> {paddr:?} ({perm:?}, {level:?})");
        let size = level.page_size();
        assert!(
            vaddr.is_aligned_to(size),
            "cannot map unaligned address {vaddr:?} with a {size:#x} byte page"
        );
        assert!(
            paddr.is_aligned_to(size),
            "cannot map to unaligned address {paddr:?} with a {size:#x} byte page"
        );
        self.ensure_root();

        let mut table = self.root;
        for walk_level in [PageLevel::Huge, PageLevel::Mid, PageLevel::Base] {
            let entry =
                unsafe { &mut (*self.table_ptr(table)).entries[vaddr.pte_index(walk_level)] };

            if walk_level == level {
                if entry.is_valid() {
                    assert!(
                        !entry.is_leaf(),
                        "mapping {vaddr:?} collides with an existing mapping"
                    );
                    assert!(
                        !self.subtree_has_leaf(entry.get_addr().unwrap()),
                        "mapping {vaddr:?} would shadow live mappings below it"
                    );
                    // the subtree holds nothing, recycle its pages (unless it
                    // is merely borrowed)
                    self.release_subtree(*entry, 1);
                }
                unsafe {
                    entry.set(
                        paddr,
                        EntryFlags::from(perm) | EntryFlags::Accessed | EntryFlags::Dirty,
                    )
                };
                return;
            }

            if entry.is_valid() {
                assert!(
                    !entry.is_leaf(),
                    "cannot map {vaddr:?} inside an active hugepage"
                );
                table = entry.get_addr().unwrap();
            } else {
                // an invalid slot may still carry a pin marker which has to
                // survive the entry becoming an interior reference
                let pinned = entry.get_flags() & EntryFlags::Shared;
                let child = self.alloc_table_page();
                unsafe { entry.set(child, pinned) };
                table = child;
            }
        }
        unreachable!("page-table walk ran past the last level");
    }

    /// Remove the leaf mapping covering `vaddr` by invalidating its entry.
    ///
    /// Intermediate tables are kept around for later mappings. No TLB
    /// maintenance happens here; the caller decides when and how far to
    /// flush.
    pub fn del_mapping(&mut self, vaddr: VAddr) {
        log::debug!("unmapping {vaddr:?}");
        let (entry, _) = self.walk_to_leaf(vaddr);
        unsafe { (*entry).clear_flags(EntryFlags::Valid) };
    }

    /// Overwrite the access permissions of the mapping covering `vaddr`
    pub fn set_page_perm(&mut self, vaddr: VAddr, perm: Perm) {
        let (entry, _) = self.walk_to_leaf(vaddr);
        unsafe { (*entry).set_perm(perm) };
    }

    /// Read the access permissions of the mapping covering `vaddr`.
    ///
    /// An unmapped `vaddr` panics, like every other walk-based operation on
    /// this table.
    pub fn get_page_perm(&self, vaddr: VAddr) -> Perm {
        let (entry, _) = self.walk_to_leaf(vaddr);
        unsafe { (*entry).perm() }
    }

    /// Translate `vaddr` by walking the table in software.
    ///
    /// Panics if the walk crosses an invalid entry, i.e. if `vaddr` is not
    /// mapped.
    pub fn transform(&self, vaddr: VAddr) -> PAddr {
        let (entry, level) = self.walk_to_leaf(vaddr);
        let entry = unsafe { &*entry };
        let offset = vaddr.raw() & (level.page_size() - 1);
        PAddr::new(entry.get_addr().unwrap().raw() | offset)
    }

    /// Walk from the root towards the leaf entry translating `vaddr`
    fn walk_to_leaf(&self, vaddr: VAddr) -> (*mut PageTableEntry, PageLevel) {
        assert!(
            !self.root.is_null(),
            "walked an empty page table for {vaddr:?}"
        );
        let mut table = self.root;
        for level in [PageLevel::Huge, PageLevel::Mid, PageLevel::Base] {
            let entry = unsafe { &mut (*self.table_ptr(table)).entries[vaddr.pte_index(level)] };
            assert!(
                entry.is_valid(),
                "walk for {vaddr:?} hit an invalid entry at {level:?}"
            );
            if entry.is_leaf() {
                return (entry as *mut PageTableEntry, level);
            }
            table = entry.get_addr().unwrap();
        }
        panic!("walk for {vaddr:?} ended on an interior entry at the last level");
    }

    /// Whether any leaf mapping is reachable below the given table page
    fn subtree_has_leaf(&self, table: PAddr) -> bool {
        let entries = unsafe { &(*self.table_ptr(table)).entries };
        entries.iter().any(|entry| {
            entry.is_valid()
                && (entry.is_leaf() || self.subtree_has_leaf(entry.get_addr().unwrap()))
        })
    }

    /// Free every table page reachable through `entry`.
    ///
    /// `depth` counts how many references the walk has crossed: the synthetic
    /// reference to the root is depth 0 and is always followed, while a real
    /// entry (depth >= 1) marked `Shared` references a subtree owned by
    /// another table and is left alone.
    fn release_subtree(&self, entry: PageTableEntry, depth: usize) {
        if !entry.is_valid() || entry.is_leaf() {
            return;
        }
        if depth >= 1 && entry.is_shared() {
            return;
        }
        let table = entry.get_addr().unwrap();
        let entries = unsafe { &(*self.table_ptr(table)).entries };
        for child in entries.iter() {
            self.release_subtree(*child, depth + 1);
        }
        self.dealloc_table_page(table);
    }

    /// Free everything this table owns, leaving it empty
    fn release_all(&mut self) {
        if !self.root.is_null() {
            let mut root_ref = PageTableEntry::empty();
            unsafe { root_ref.set(self.root, EntryFlags::empty()) };
            self.release_subtree(root_ref, 0);
            self.root = PAddr::null();
        }
    }

    /// Rebuild this table as a deep copy of `other`.
    ///
    /// Existing contents are released first. Every owned interior table of
    /// `other` is duplicated using *this* table's allocator (the two tables
    /// may use different allocators); leaf entries are copied verbatim. An
    /// interior entry marked `Shared` is copied verbatim as well, so the copy
    /// borrows the same pinned subtree as the original.
    pub fn assign<B: PageAllocator>(&mut self, other: &PageTable<'_, B>) -> &mut Self {
        self.release_all();
        if !other.root.is_null() {
            self.root = self.copy_table(other, other.root);
        }
        self
    }

    /// Duplicate one table page of `other` and everything below it
    fn copy_table<B: PageAllocator>(&self, other: &PageTable<'_, B>, table: PAddr) -> PAddr {
        let copy = self.alloc_table_page();
        let src = unsafe { &(*other.table_ptr(table)).entries };
        let dst = unsafe { &mut (*self.table_ptr(copy)).entries };
        for (dst_entry, src_entry) in dst.iter_mut().zip(src.iter()) {
            if !src_entry.is_valid() || src_entry.is_leaf() || src_entry.is_shared() {
                // invalid slots keep their pin markers, leaves their target
                // and borrowed references stay borrowed
                *dst_entry = *src_entry;
            } else {
                let child = self.copy_table(other, src_entry.get_addr().unwrap());
                unsafe { dst_entry.set(child, EntryFlags::empty()) };
            }
        }
        copy
    }

    /// Create a table that shares every lower-level subtree with this one.
    ///
    /// The new table's root is a verbatim copy of this root. Every interior
    /// root entry of the copy is marked `Shared` and entry 0 of the referenced
    /// level-1 page is marked `Shared` too, pinning the page. Neither table
    /// will free the shared subtrees when destroyed; this table keeps owning
    /// them and must outlive the copy.
    pub fn shared_copy(&self) -> Self {
        let mut copy = PageTable::new(self.alloc, self.phys_map);
        if self.root.is_null() {
            return copy;
        }
        copy.root = copy.alloc_table_page();
        let src = unsafe { &(*self.table_ptr(self.root)).entries };
        let dst = unsafe { &mut (*copy.table_ptr(copy.root)).entries };
        dst.copy_from_slice(src);
        for entry in dst.iter_mut() {
            if entry.is_valid() && !entry.is_leaf() {
                unsafe { entry.set_flags(EntryFlags::Shared) };
                self.pin_table(entry.get_addr().unwrap());
            }
        }
        copy
    }

    /// Pin every gigabyte-granular subtree in `[start, end)` so that other
    /// tables can attach to them, allocating level-1 tables that don't exist
    /// yet. Root slots occupied by hugepage leaves are skipped.
    pub fn shared_mark(&mut self, start: VAddr, end: VAddr) {
        assert!(
            start.is_aligned_to(HUGE_PAGESIZE as u64),
            "share range start {start:?} is not hugepage-aligned"
        );
        assert!(
            end.is_aligned_to(HUGE_PAGESIZE as u64),
            "share range end {end:?} is not hugepage-aligned"
        );
        assert!(end > start, "share range is empty");
        self.ensure_root();

        let entries = unsafe { &mut (*self.table_ptr(self.root)).entries };
        for index in start.pte_index(PageLevel::Huge)..end.pte_index(PageLevel::Huge) {
            let entry = &mut entries[index];
            if entry.is_valid() && entry.is_leaf() {
                continue;
            }
            if !entry.is_valid() {
                let child = self.alloc_table_page();
                unsafe { entry.set(child, EntryFlags::empty()) };
            }
            self.pin_table(entry.get_addr().unwrap());
        }
    }

    /// Attach the pinned subtrees of `other` in `[start, end)` to this table.
    ///
    /// For every root slot in the range where `other` holds an interior entry
    /// whose level-1 page is pinned, this table gets an entry referencing the
    /// same level-1 page, marked `Shared` and without any access permissions
    /// of its own. Slots that are already valid here are left untouched.
    ///
    /// `other` keeps owning the attached subtrees and must outlive this
    /// table (or be detached first).
    pub fn shared_attach<B: PageAllocator>(
        &mut self,
        other: &PageTable<'_, B>,
        start: VAddr,
        end: VAddr,
    ) {
        assert!(
            start.is_aligned_to(HUGE_PAGESIZE as u64),
            "share range start {start:?} is not hugepage-aligned"
        );
        assert!(
            end.is_aligned_to(HUGE_PAGESIZE as u64),
            "share range end {end:?} is not hugepage-aligned"
        );
        if other.root.is_null() {
            return;
        }
        self.ensure_root();

        let src = unsafe { &(*other.table_ptr(other.root)).entries };
        let dst = unsafe { &mut (*self.table_ptr(self.root)).entries };
        for index in start.pte_index(PageLevel::Huge)..end.pte_index(PageLevel::Huge) {
            let src_entry = &src[index];
            if !src_entry.is_valid() || src_entry.is_leaf() {
                continue;
            }
            let subtree = src_entry.get_addr().unwrap();
            if !other.is_pinned(subtree) {
                continue;
            }
            let dst_entry = &mut dst[index];
            if dst_entry.is_valid() {
                continue;
            }
            unsafe { dst_entry.set(subtree, EntryFlags::Shared) };
        }
    }

    /// Detach previously attached subtrees in `[start, end)` from this table.
    ///
    /// The matching root entries lose their `Shared` and `Valid` bits; the
    /// referenced subtrees are untouched and keep belonging to the pinning
    /// table.
    pub fn shared_detach(&mut self, start: VAddr, end: VAddr) {
        assert!(
            start.is_aligned_to(HUGE_PAGESIZE as u64),
            "share range start {start:?} is not hugepage-aligned"
        );
        assert!(
            end.is_aligned_to(HUGE_PAGESIZE as u64),
            "share range end {end:?} is not hugepage-aligned"
        );
        if self.root.is_null() {
            return;
        }

        let entries = unsafe { &mut (*self.table_ptr(self.root)).entries };
        for index in start.pte_index(PageLevel::Huge)..end.pte_index(PageLevel::Huge) {
            let entry = &mut entries[index];
            if entry.is_valid() && !entry.is_leaf() && entry.is_shared() {
                unsafe { entry.clear_flags(EntryFlags::Shared | EntryFlags::Valid) };
            }
        }
    }

    fn pin_table(&self, table: PAddr) {
        let entries = unsafe { &mut (*self.table_ptr(table)).entries };
        unsafe { entries[0].set_flags(EntryFlags::Shared) };
    }

    fn is_pinned(&self, table: PAddr) -> bool {
        let entries = unsafe { &(*self.table_ptr(table)).entries };
        entries[0].is_shared()
    }
}

impl<'a, A: PageAllocator> Clone for PageTable<'a, A> {
    fn clone(&self) -> Self {
        let mut copy = PageTable::new(self.alloc, self.phys_map);
        copy.assign(self);
        copy
    }
}

impl<A: PageAllocator> Drop for PageTable<'_, A> {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl<A: PageAllocator> Debug for PageTable<'_, A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTable")
            .field("root", &self.root)
            .field("phys_map", &self.phys_map)
            .finish()
    }
}
