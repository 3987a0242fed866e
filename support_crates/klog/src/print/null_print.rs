use core::fmt;
use core::fmt::Write;

/// Writer used on hosted targets where no firmware console is reachable.
/// Everything written to it is discarded.
pub struct NullWriter {}

impl Write for NullWriter {
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}
