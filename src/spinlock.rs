//! Test-and-set spinlock
//!
//! Single-word mutual exclusion for short, uncontended critical sections
//! (JIT registry mutation, MMIO device state). No fairness guarantee.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

pub struct Spinlock<T: ?Sized> {
    flag: AtomicU32,
    value: UnsafeCell<T>,
}

// Exclusion is provided by the flag; T itself only needs to be Send.
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Spinlock {
            flag: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> Spinlock<T> {
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        while self.flag.swap(1, Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
        SpinlockGuard { lock: self }
    }
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.flag.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_exclusion() {
        let lock = Arc::new(Spinlock::new(0u64));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..10000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40000);
    }

    #[test]
    fn test_relock_after_guard_drop() {
        let lock = Spinlock::new(5);
        {
            let mut guard = lock.lock();
            *guard = 7;
        }
        assert_eq!(*lock.lock(), 7);
    }
}
