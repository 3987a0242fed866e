//! Handling of CPU control and status registers
//!
//! This module implements dummy structs which each model the control registers
//! the memory core touches, as defined in Chapter 4 of the RISC-V Privileged
//! Specification.

use crate::mem::PAddr;
use bitflags::bitflags;
use core::arch::asm;

/// Generate code to read from a specific register.
macro_rules! read_reg {
    ($csr:literal,$width:ty) => {{
        let res: $width;
        asm!(concat!("csrr {}, ", $csr), out(reg) res);
        res
    }};
    ($csr:literal) => {read_reg!($csr, u64)};
}

/// Generate code to set specific register bits but leave others untouched
macro_rules! set_reg {
    ($csr:literal, $value:expr) => {
        asm!(concat!("csrs ", $csr, ", {}"), in(reg) $value)
    }
}

/// Supervisor Status Register.
///
/// It keeps track of the processor's current operating state.
#[allow(dead_code)]
pub struct SStatus {}

bitflags! {
    #[derive(Debug)]
    pub struct SStatusFlags: u64 {
        /// The SIE bit enables or disables all interrupts in supervisor mode.
        const SIE = 1 << 1;
        /// The SPIE bit indicates whether supervisor interrupts were enabled prior to trapping into supervisor mode.
        const SPIE = 1 << 5;
        /// The SPP bit indicates at which mode a hart was executing before entering supervisor mode.
        const SPP = 1 << 8;
        /// The MXR (Make eXecutable Readable) bit modifies the privilege with which loads access virtual memory.
        /// When `MXR=0`, only loads from pages marked readable will succeed; when `MXR=1`, loads from pages
        /// marked either readable or executable will succeed.
        const MXR = 1 << 19;
        /// The SUM (permit Supervisor User Memory access) bit modifies the privilege with which S-mode loads
        /// and stores access virtual memory. When `SUM=0`, S-mode accesses to pages accessible by U-mode fault;
        /// when `SUM=1` they are permitted.
        const SUM = 1 << 18;
    }
}

impl SStatus {
    /// Read the raw 64 bit value that is contained in the register
    pub fn read_raw() -> u64 {
        unsafe { read_reg!("sstatus") }
    }

    /// Read the value that is contained in the register
    pub fn read() -> SStatusFlags {
        SStatusFlags::from_bits_truncate(Self::read_raw())
    }

    /// Set only those bits of the register to `1` where `mask` is set while leaving all other
    /// register bits untouched
    ///
    /// # Safety
    /// Because writing to this register can change how the processor operates it is fundamentally
    /// unsafe. Ensure that you write an intended value!
    pub unsafe fn set(mask: SStatusFlags) {
        set_reg!("sstatus", mask.bits());
    }
}

/// The data that is held by the [`Satp`] register.
///
/// This register holds the physical page number (PPN) of the root page table, an address space
/// identifier (ASID) which facilitates address-translation fences on a per-address-space basis,
/// and the MODE field which selects the current address-translation scheme.
#[derive(Debug, Eq, PartialEq)]
pub struct SatpData {
    pub mode: SatpMode,
    pub asid: u64,
    pub ppn: u64,
}

impl From<u64> for SatpData {
    fn from(value: u64) -> Self {
        SatpData {
            mode: SatpMode::from(value >> 60),   // bits 60-63
            asid: value >> 44 & ((1 << 16) - 1), // bits 44-59
            ppn: value & ((1 << 44) - 1),        // bits 0-43
        }
    }
}

impl From<SatpData> for u64 {
    fn from(value: SatpData) -> Self {
        u64::from(value.mode) << 60
            | (value.asid & ((1 << 16) - 1)) << 44
            | value.ppn & ((1 << 44) - 1)
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum SatpMode {
    /// No translation or protection
    Bare,
    /// Page-based 39-bit virtual addressing
    Sv39,
    /// Page-based 48-bit virtual addressing
    Sv48,
    /// Page-based 57-bit virtual addressing
    Sv57,
}

impl From<u64> for SatpMode {
    fn from(value: u64) -> Self {
        match value {
            0 => SatpMode::Bare,
            8 => SatpMode::Sv39,
            9 => SatpMode::Sv48,
            10 => SatpMode::Sv57,
            other => unimplemented!("unknown satp mode {}", other),
        }
    }
}

impl From<SatpMode> for u64 {
    fn from(value: SatpMode) -> Self {
        match value {
            SatpMode::Bare => 0,
            SatpMode::Sv39 => 8,
            SatpMode::Sv48 => 9,
            SatpMode::Sv57 => 10,
        }
    }
}

/// Supervisor Address Translation and Protection Register
///
/// The satp register is a read/write register which controls supervisor-mode address translation
/// and protection.
#[allow(unused)]
pub struct Satp {}

impl Satp {
    pub fn read_raw() -> u64 {
        unsafe { read_reg!("satp") }
    }

    pub fn read() -> SatpData {
        SatpData::from(Self::read_raw())
    }

    /// # Safety
    /// Writing this register switches the active address space which invalidates raw pointers
    /// into the old one.
    pub unsafe fn write_raw(val: u64) {
        asm!("
            sfence.vma
            csrw satp, {}
        ", in(reg) val);
    }

    /// # Safety
    /// See [`write_raw`](Satp::write_raw).
    pub unsafe fn write(val: SatpData) {
        Self::write_raw(val.into())
    }
}

/// Physical address of the root translation table that is currently installed
pub fn current_pagetable() -> PAddr {
    PAddr::new(Satp::read().ppn << 12)
}

/// Install a new root translation table.
///
/// Besides pointing SATP at the new root this enables MXR (kernel loads from
/// execute-only pages) and SUM (kernel access to user-accessible pages).
///
/// # Safety
/// The given root must describe a table that maps the currently executing
/// kernel, otherwise the next instruction fetch faults.
pub unsafe fn use_pagetable(root: PAddr) {
    SStatus::set(SStatusFlags::MXR | SStatusFlags::SUM);

    log::debug!("enabling new pagetable at {root:?}");
    Satp::write(SatpData {
        mode: SatpMode::Sv39,
        asid: 0,
        ppn: root.ppn(),
    });
}
