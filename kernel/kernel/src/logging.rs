//! Kernel logging bring-up

use klog::KernelLogger;
use log::Level;

static LOGGER: KernelLogger = KernelLogger::new(Level::Info);

/// Install the kernel logger on the `log` facade.
///
/// Called once very early during boot so everything after it (including the
/// memory bring-up) can log.
pub fn init() {
    LOGGER
        .install()
        .expect("a logger was already installed");
}

/// Raise or lower the amount of log output at runtime
pub fn set_level(level: Level) {
    LOGGER.update_log_level(level);
}
