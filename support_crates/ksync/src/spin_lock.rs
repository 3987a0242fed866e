use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A SpinLock Mutex implementation
///
/// This variant leaves the interrupt-enable state of the executing hart alone.
/// State that is also touched from interrupt context must be protected with an
/// [`InterruptSpinLock`](crate::InterruptSpinLock) instead.
#[derive(Debug)]
pub struct SpinLock<T> {
    is_locked: AtomicBool,
    value: UnsafeCell<T>,
}

/// A Guard protecting some data locked through a [`SpinLock`].
///
/// Use it via the implemented [`Deref`] and [`DerefMut`] traits.
pub struct Guard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            is_locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Try to lock the lock once, returning a [`Guard`] if it was free
    pub fn try_lock(&self) -> Option<Guard<'_, T>> {
        if self.is_locked.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Guard { lock: self })
        }
    }

    /// Repeatedly try to lock the lock until it succeeds, returning the protected data via a [`Guard`]
    pub fn spin_lock(&self) -> Guard<'_, T> {
        while self.is_locked.swap(true, Ordering::SeqCst) {
            spin_loop();
        }
        Guard { lock: self }
    }

    fn unlock(&self) {
        self.is_locked.store(false, Ordering::SeqCst)
    }
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> Deref for Guard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: The very existence of this Guard guarantees we've exclusively locked the lock
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for Guard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: The very existence of this Guard guarantees we've exclusively locked the lock
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for Guard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;

    #[test]
    fn test_lock_guards_value() {
        let lock = SpinLock::new(0usize);
        {
            let mut guard = lock.spin_lock();
            *guard += 41;
            *guard += 1;
        }
        assert_eq!(*lock.spin_lock(), 42);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
