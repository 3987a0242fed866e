use core::fmt;
use core::fmt::Write;

/// A [`Write`] implementation that emits every character through the firmware
/// console call, one byte at a time.
pub struct SbiWriter {}

impl Write for SbiWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            sbi::legacy::console_putchar(byte);
        }
        Ok(())
    }
}
