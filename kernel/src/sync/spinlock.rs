//! IF-save spinlock.
//!
//! `IrqSpinlock<T>` is the lock type every global in this crate protects its
//! state with (§4.13): acquiring it disables interrupts on the current CPU
//! and spins a test-and-set loop; dropping the guard restores the saved
//! interrupt flag. The `owner_cpu_hint` is diagnostic only — it is not part
//! of the correctness argument, which rests entirely on the atomic CAS.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use crate::platform;

/// A mutual-exclusion lock that disables local interrupts for its duration.
///
/// Per §5, the interrupt path never blocks and a task is only preemptible
/// while it does not hold a spinlock; disabling interrupts for the
/// acquire/hold/release window is what makes that guarantee true on the
/// local CPU.
pub struct IrqSpinlock<T: ?Sized> {
    locked: AtomicBool,
    owner_cpu_hint: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through a `SpinlockGuard`
// obtained while `locked` is held, which serialises all access.
unsafe impl<T: ?Sized + Send> Sync for IrqSpinlock<T> {}
unsafe impl<T: ?Sized + Send> Send for IrqSpinlock<T> {}

pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a IrqSpinlock<T>,
    saved_if: bool,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner_cpu_hint: AtomicU32::new(u32::MAX),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> IrqSpinlock<T> {
    /// Disable interrupts, then spin until the lock is acquired.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let saved_if = platform::disable_interrupts();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.owner_cpu_hint
            .store(current_cpu_hint(), Ordering::Relaxed);
        SpinlockGuard {
            lock: self,
            saved_if,
        }
    }

    /// Non-blocking acquire; restores the interrupt flag immediately on
    /// failure so a failed `try_lock` never leaves interrupts disabled.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        let saved_if = platform::disable_interrupts();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner_cpu_hint
                .store(current_cpu_hint(), Ordering::Relaxed);
            Some(SpinlockGuard {
                lock: self,
                saved_if,
            })
        } else {
            platform::restore_interrupts(saved_if);
            None
        }
    }

    /// CPU hint of the last lock holder, for diagnostics only.
    pub fn owner_cpu_hint(&self) -> u32 {
        self.owner_cpu_hint.load(Ordering::Relaxed)
    }
}

fn current_cpu_hint() -> u32 {
    crate::cpu::current_apic_id().map(|id| id.raw() as u32).unwrap_or(0)
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard implies exclusive access to `data`.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard implies exclusive access to `data`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner_cpu_hint.store(u32::MAX, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        platform::restore_interrupts(self.saved_if);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_serialises_access() {
        let lock = IrqSpinlock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = IrqSpinlock::new(());
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
    }
}
