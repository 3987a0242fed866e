//! Interrupt-aware locking
//!
//! A plain [`SpinLock`](crate::SpinLock) deadlocks as soon as an interrupt
//! handler tries to take a lock that the interrupted code is already holding.
//! The [`InterruptSpinLock`] defined here closes that hole: acquiring it
//! disables interrupts on the local hart for the lifetime of the guard and
//! restores the previous interrupt-enable state afterwards.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Whether interrupts are currently enabled on the executing hart
#[cfg(target_arch = "riscv64")]
#[inline]
pub fn is_interrupt_on() -> bool {
    const SIE: u64 = 1 << 1;
    let sstatus: u64;
    unsafe { core::arch::asm!("csrr {}, sstatus", out(reg) sstatus) };
    sstatus & SIE != 0
}

/// Enable interrupts on the executing hart
///
/// # Safety
/// Enabling interrupts allows trap handlers to preempt the current code path at
/// any instruction which may break critical sections.
#[cfg(target_arch = "riscv64")]
#[inline]
pub unsafe fn interrupt_on() {
    const SIE: u64 = 1 << 1;
    core::arch::asm!("csrs sstatus, {}", in(reg) SIE);
}

/// Disable interrupts on the executing hart
///
/// # Safety
/// Code that relies on timer or external interrupts stops making progress until
/// they are re-enabled.
#[cfg(target_arch = "riscv64")]
#[inline]
pub unsafe fn interrupt_off() {
    const SIE: u64 = 1 << 1;
    core::arch::asm!("csrc sstatus, {}", in(reg) SIE);
}

// Hosted builds have no hart-local interrupt state to toggle.

#[cfg(not(target_arch = "riscv64"))]
#[inline]
pub fn is_interrupt_on() -> bool {
    false
}

#[cfg(not(target_arch = "riscv64"))]
#[inline]
pub unsafe fn interrupt_on() {}

#[cfg(not(target_arch = "riscv64"))]
#[inline]
pub unsafe fn interrupt_off() {}

/// A SpinLock whose critical sections cannot be preempted by interrupts
///
/// On `lock`, the current interrupt-enable state is sampled and interrupts are
/// disabled before the lock flag is acquired. The sampled state travels inside
/// the returned [`InterruptGuard`]: dropping the guard releases the flag first
/// and only then re-enables interrupts, and only if they were enabled before.
#[derive(Debug)]
pub struct InterruptSpinLock<T> {
    is_locked: AtomicBool,
    value: UnsafeCell<T>,
}

/// A Guard protecting data locked through an [`InterruptSpinLock`].
pub struct InterruptGuard<'a, T> {
    lock: &'a InterruptSpinLock<T>,
    was_on: bool,
}

impl<T> InterruptSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            is_locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Try to lock the lock once.
    ///
    /// Interrupts are disabled before the attempt and restored again when the
    /// lock turns out to be taken.
    pub fn try_lock(&self) -> Option<InterruptGuard<'_, T>> {
        let was_on = is_interrupt_on();
        unsafe { interrupt_off() };
        if self.is_locked.swap(true, Ordering::SeqCst) {
            if was_on {
                unsafe { interrupt_on() };
            }
            None
        } else {
            Some(InterruptGuard { lock: self, was_on })
        }
    }

    /// Disable interrupts and spin until the lock is acquired
    pub fn spin_lock(&self) -> InterruptGuard<'_, T> {
        let was_on = is_interrupt_on();
        unsafe { interrupt_off() };
        while self.is_locked.swap(true, Ordering::SeqCst) {
            spin_loop();
        }
        InterruptGuard { lock: self, was_on }
    }
}

unsafe impl<T> Sync for InterruptSpinLock<T> where T: Send {}

impl<T> Deref for InterruptGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: The very existence of this Guard guarantees we've exclusively locked the lock
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for InterruptGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: The very existence of this Guard guarantees we've exclusively locked the lock
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for InterruptGuard<'_, T> {
    fn drop(&mut self) {
        // release the lock before interrupts can fire again
        self.lock.is_locked.store(false, Ordering::SeqCst);
        if self.was_on {
            unsafe { interrupt_on() };
        }
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;

    #[test]
    fn test_lock_guards_value() {
        let lock = InterruptSpinLock::new([0usize; 4]);
        {
            let mut guard = lock.spin_lock();
            guard[3] = 7;
        }
        assert_eq!(lock.spin_lock()[3], 7);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = InterruptSpinLock::new(());
        let guard = lock.spin_lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
