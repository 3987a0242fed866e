//! Kernel Synchronisation Primitives
#![no_std]

mod irq;
mod once;
mod spin_lock;

pub use irq::{interrupt_off, interrupt_on, is_interrupt_on, InterruptGuard, InterruptSpinLock};
pub use once::InitCell;
pub use spin_lock::{Guard, SpinLock};
