//! Calls into the supervisor binary interface of the firmware
//!
//! Only the one call the memory core needs is wrapped here: the RFENCE
//! extension's `SFENCE_VMA`, which this kernel uses for TLB shootdowns.

use core::arch::asm;

/// Extension id of the RFENCE extension ("RFNC")
const EID_RFENCE: u64 = 0x52464E43;

/// Function id of `sbi_remote_sfence_vma` within the RFENCE extension
const FID_SFENCE_VMA: u64 = 1;

/// Perform an environment call into the firmware.
///
/// Returns the `(error, value)` pair the firmware leaves in `a0`/`a1`.
///
/// # Safety
/// The effect of the call depends entirely on the given extension and
/// function ids; the caller must uphold whatever contract those define.
unsafe fn sbi_call(
    ext: u64,
    fid: u64,
    mut arg0: u64,
    mut arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
) -> (i64, u64) {
    asm!(
        "ecall",
        inout("a0") arg0,
        inout("a1") arg1,
        in("a2") arg2,
        in("a3") arg3,
        in("a4") arg4,
        in("a5") arg5,
        in("a6") fid,
        in("a7") ext,
    );
    (arg0 as i64, arg1)
}

/// Instruct remote harts to execute `sfence.vma` for the given address range.
///
/// A hart-mask base of -1 selects every hart on the machine, which is all
/// this kernel ever needs.
pub fn remote_sfence_vma(start: u64, size: u64) {
    let (error, _) = unsafe {
        sbi_call(
            EID_RFENCE,
            FID_SFENCE_VMA,
            0,
            u64::MAX,
            start,
            size,
            0,
            0,
        )
    };
    if error != 0 {
        log::error!("remote TLB shootdown failed with SBI error {error}");
    }
}
