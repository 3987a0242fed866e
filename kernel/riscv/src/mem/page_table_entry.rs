use crate::mem::paddr;
use crate::mem::PAddr;
use bitflags::bitflags;
use core::fmt::{Binary, Debug, Formatter, LowerHex, UpperHex, Write};

/// An entry of a translation table, responsible for mapping virtual to physical addresses.
///
/// # Format
/// The PTE format for Sv39 is shown in the below figure.
/// - Bits 0–7 have the meaning described by [`EntryFlags`].
/// - Bits 8–9 are ignored by the hardware and can be freely used by software;
///   bit 8 carries the [`Shared`](EntryFlags::Shared) marker of the
///   subtree-sharing protocol.
/// - Bits 54–63 are reserved and must be zeroed by software.
///
/// ```text
///   63 62  61 60      54 53    28 27    19 18    10 9   8  7   6   5   4   3   2   1   0
/// ┌───┬──────┬──────────┬────────┬────────┬────────┬─────┬───┬───┬───┬───┬───┬───┬───┬───┐
/// │ N │ PBMT │ reserved │ PPN[2] │ PPN[1] │ PPN[0] │ RSW │ D │ A │ G │ U │ X │ W │ R │ V │
/// └───┴──────┴──────────┴────────┴────────┴────────┴─────┴───┴───┴───┴───┴───┴───┴───┴───┘
///       2bit     7bit     26bit     9bit     9bit   2bit
///                      Sv39 Page Table Entry
/// ```
///
/// An entry is a **leaf** iff any of R, W or X is set; a valid entry without
/// them points to the next table level instead.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

const FLAG_BITS: u64 = 10;
const FLAG_MASK: u64 = (1 << FLAG_BITS) - 1;
const PPN_OFFSET: u64 = 10;
const PPN_BITS: u64 = 44;
const PPN_MASK: u64 = ((1 << PPN_BITS) - 1) << PPN_OFFSET;

impl PageTableEntry {
    /// Create a new empty entry.
    ///
    /// This entry does not point to anything and is considered disabled by the hardware.
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    /// Whether this entry is currently valid (in other words whether it is considered active)
    pub fn is_valid(&self) -> bool {
        self.get_flags().contains(EntryFlags::Valid)
    }

    /// Whether this is a leaf entry mapping a page instead of pointing to a further table
    pub fn is_leaf(&self) -> bool {
        self.get_flags().intersects(EntryFlags::RWX)
    }

    /// Whether this entry references a subtree that is owned by another table
    pub fn is_shared(&self) -> bool {
        self.get_flags().contains(EntryFlags::Shared)
    }

    /// Return the flags which are encoded in this entry
    pub fn get_flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.entry & FLAG_MASK)
    }

    /// Return the address which this entry points to
    pub fn get_addr(&self) -> Result<PAddr, EntryInvalidErr> {
        match self.is_valid() {
            false => Err(EntryInvalidErr),
            true => Ok(PAddr::new(
                (self.entry & PPN_MASK) >> PPN_OFFSET << paddr::PPN_OFFSET,
            )),
        }
    }

    /// The access permissions encoded in this entry
    pub fn perm(&self) -> Perm {
        Perm::from(self.get_flags())
    }

    /// Set the content of this entry.
    ///
    /// This function also automatically enables the entry by setting the [`Valid`](EntryFlags::Valid) flag.
    ///
    /// # Safety
    /// Changing the entry of a translation table inherently changes virtual address mappings.
    /// This can make other, completely unrelated, references and pointers invalid and must always
    /// be done with care.
    pub unsafe fn set(&mut self, addr: PAddr, flags: EntryFlags) {
        assert!(
            addr.is_aligned_to(1 << paddr::PAGE_OFFSET_BITS),
            "cannot set page table entry to unaligned address {addr:?}"
        );
        log::trace!("setting page table entry {self:p} to {addr:?} with flags {flags:?}");

        self.entry = (addr.ppn() << PPN_OFFSET) | (flags | EntryFlags::Valid).bits();
    }

    /// Overwrite only the permission bits (R, W, X and U) of this entry
    ///
    /// # Safety
    /// See [`set`](PageTableEntry::set).
    pub unsafe fn set_perm(&mut self, perm: Perm) {
        self.entry = (self.entry & !EntryFlags::RWXU.bits()) | EntryFlags::from(perm).bits();
    }

    /// Add the given flags to this entry without touching anything else
    ///
    /// # Safety
    /// See [`set`](PageTableEntry::set).
    pub unsafe fn set_flags(&mut self, flags: EntryFlags) {
        self.entry |= flags.bits();
    }

    /// Remove the given flags from this entry without touching anything else
    ///
    /// # Safety
    /// See [`set`](PageTableEntry::set).
    pub unsafe fn clear_flags(&mut self, flags: EntryFlags) {
        self.entry &= !flags.bits();
    }

    /// Clear the content of this entry, setting it to 0x0 and removing all flags.
    ///
    /// # Safety
    /// See [`set`](PageTableEntry::set).
    pub unsafe fn clear(&mut self) {
        self.entry = 0;
    }
}

impl Debug for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self.get_addr() {
            Err(_) => f.write_fmt(format_args!("PageTableEntry(invalid)")),
            Ok(addr) => f.write_fmt(format_args!(
                "PageTableEntry {{ addr: {:#12x}, flags: {:?} }}",
                addr,
                self.get_flags()
            )),
        }
    }
}

impl Binary for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Binary::fmt(&self.entry, f)
    }
}

impl LowerHex for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        LowerHex::fmt(&self.entry, f)
    }
}

impl UpperHex for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        UpperHex::fmt(&self.entry, f)
    }
}

bitflags! {
    /// The flags that can be set on a [`PageTableEntry`]
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct EntryFlags: u64 {
        /// If set, the MMU considers this a valid entry in the page table and uses it for address mapping
        const Valid = 1 << 0;
        /// Allows reading from the mapped page
        const Read = 1 << 1;
        /// Allows writing to the mapped page
        const Write = 1 << 2;
        /// Allows executing code from the mapped page
        const Execute = 1 << 3;
        /// Allows accessing the mapped page **from user mode**
        const UserAccessible = 1 << 4;
        /// If set, the MMU considers this entry to be present in **all** address space IDs and caches them accordingly.
        /// It is safe to never set this but when setting it, care should be taken to do it correctly.
        const Global = 1 << 5;
        /// Set by the MMU when something has read from the page since the mapping was set up
        const Accessed = 1 << 6;
        /// Set by the MMU when something has written to the page since the mapping was set up
        const Dirty = 1 << 7;

        /// Software marker of the subtree-sharing protocol.
        ///
        /// On an interior entry it flags a subtree that belongs to another
        /// table and must never be freed through this one. On entry 0 of a
        /// level-1 table it pins that table, keeping it alive until the
        /// owning table is destroyed.
        const Shared = 1 << 8;

        const RWX = Self::Read.bits() | Self::Write.bits() | Self::Execute.bits();
        const RWXU = Self::RWX.bits() | Self::UserAccessible.bits();
    }
}

impl Debug for EntryFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        fn write_bit(
            flags: EntryFlags,
            bit: EntryFlags,
            c: char,
            f: &mut Formatter<'_>,
        ) -> core::fmt::Result {
            if flags.contains(bit) {
                f.write_char(c)
            } else {
                f.write_char(' ')
            }
        }
        write_bit(*self, EntryFlags::Shared, 'S', f)?;
        write_bit(*self, EntryFlags::Dirty, 'D', f)?;
        write_bit(*self, EntryFlags::Accessed, 'A', f)?;
        write_bit(*self, EntryFlags::Global, 'G', f)?;
        write_bit(*self, EntryFlags::UserAccessible, 'U', f)?;
        write_bit(*self, EntryFlags::Execute, 'X', f)?;
        write_bit(*self, EntryFlags::Write, 'W', f)?;
        write_bit(*self, EntryFlags::Read, 'R', f)?;
        write_bit(*self, EntryFlags::Valid, 'V', f)?;
        Ok(())
    }
}

bitflags! {
    /// The access permissions of a mapping, independent of how they are
    /// encoded in a [`PageTableEntry`]
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct Perm: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
    }
}

impl From<Perm> for EntryFlags {
    fn from(perm: Perm) -> Self {
        let mut flags = EntryFlags::empty();
        if perm.contains(Perm::READ) {
            flags |= EntryFlags::Read;
        }
        if perm.contains(Perm::WRITE) {
            flags |= EntryFlags::Write;
        }
        if perm.contains(Perm::EXEC) {
            flags |= EntryFlags::Execute;
        }
        if perm.contains(Perm::USER) {
            flags |= EntryFlags::UserAccessible;
        }
        flags
    }
}

impl From<EntryFlags> for Perm {
    fn from(flags: EntryFlags) -> Self {
        let mut perm = Perm::empty();
        if flags.contains(EntryFlags::Read) {
            perm |= Perm::READ;
        }
        if flags.contains(EntryFlags::Write) {
            perm |= Perm::WRITE;
        }
        if flags.contains(EntryFlags::Execute) {
            perm |= Perm::EXEC;
        }
        if flags.contains(EntryFlags::UserAccessible) {
            perm |= Perm::USER;
        }
        perm
    }
}

impl Debug for Perm {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        fn write_bit(perm: Perm, bit: Perm, c: char, f: &mut Formatter<'_>) -> core::fmt::Result {
            if perm.contains(bit) {
                f.write_char(c)
            } else {
                f.write_char('-')
            }
        }
        write_bit(*self, Perm::USER, 'u', f)?;
        write_bit(*self, Perm::READ, 'r', f)?;
        write_bit(*self, Perm::WRITE, 'w', f)?;
        write_bit(*self, Perm::EXEC, 'x', f)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct EntryInvalidErr;

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;

    #[test]
    fn test_address_is_correctly_set() {
        let mut entry = PageTableEntry::empty();
        unsafe { entry.set(PAddr::new(0x8004_2000), EntryFlags::empty()) };
        assert_eq!(entry.entry, (0x8004_2000u64 >> 2) | 0x1);
        assert_eq!(entry.get_addr().unwrap(), PAddr::new(0x8004_2000));
    }

    #[test]
    fn test_leaf_and_interior_classification() {
        let mut interior = PageTableEntry::empty();
        unsafe { interior.set(PAddr::new(0x1000), EntryFlags::empty()) };
        assert!(interior.is_valid());
        assert!(!interior.is_leaf());

        let mut leaf = PageTableEntry::empty();
        unsafe { leaf.set(PAddr::new(0x1000), EntryFlags::Read | EntryFlags::Write) };
        assert!(leaf.is_valid());
        assert!(leaf.is_leaf());
    }

    #[test]
    fn test_shared_bit_survives_flag_accessors() {
        let mut entry = PageTableEntry::empty();
        unsafe { entry.set(PAddr::new(0x1000), EntryFlags::Shared) };
        assert!(entry.is_shared());
        unsafe { entry.clear_flags(EntryFlags::Valid) };
        assert!(!entry.is_valid());
        assert!(entry.is_shared());
        assert_eq!(entry.entry & PPN_MASK, (0x1000u64 >> 12) << PPN_OFFSET);
    }

    #[test]
    fn test_perm_round_trip() {
        let mut entry = PageTableEntry::empty();
        unsafe { entry.set(PAddr::new(0x2000), EntryFlags::from(Perm::READ | Perm::EXEC)) };
        assert_eq!(entry.perm(), Perm::READ | Perm::EXEC);

        unsafe { entry.set_perm(Perm::READ | Perm::WRITE | Perm::USER) };
        assert_eq!(entry.perm(), Perm::READ | Perm::WRITE | Perm::USER);
        assert_eq!(entry.get_addr().unwrap(), PAddr::new(0x2000));
    }

    #[test]
    #[should_panic]
    fn test_unaligned_address_is_rejected() {
        let mut entry = PageTableEntry::empty();
        unsafe { entry.set(PAddr::new(0x1234), EntryFlags::Read) };
    }
}
