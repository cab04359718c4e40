//! Condition variables.
//!
//! Blocking a task is a PM/SCHED responsibility (§2.1), so `CondVar` itself
//! only tracks the waiter count and the wake epoch; the actual suspend/wake
//! primitive is supplied by [`crate::pm::block_current`] /
//! [`crate::pm::wake_all`]. This mirrors the teacher's pattern of keeping a
//! narrow dependency on neighbouring subsystems through an explicit function
//! pointer / trait boundary rather than calling into them directly.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::sync::{IrqSpinlock, SpinlockGuard};

/// Outcome of a condition wait, mirroring the three-way return of the
/// original `wait_intr`/`wait_intr_timed` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a matching `broadcast`.
    Woken,
    /// Woken by a pending signal; the lock was not re-acquired.
    Interrupted,
    /// Deadline passed before either of the above.
    TimedOut,
}

pub struct CondVar {
    waiters: AtomicUsize,
    epoch: AtomicUsize,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            waiters: AtomicUsize::new(0),
            epoch: AtomicUsize::new(0),
        }
    }

    /// Atomically release `lock` and block the current task. Re-acquires
    /// `lock` before returning once woken normally.
    pub fn wait<'a, T>(&self, lock: &'a IrqSpinlock<T>, guard: SpinlockGuard<'a, T>) -> SpinlockGuard<'a, T> {
        let _ = self.wait_inner(guard, None);
        lock.lock()
    }

    /// As [`wait`], but returns [`WaitOutcome::Interrupted`] without
    /// re-acquiring the lock if a signal aborts the wait.
    pub fn wait_intr<T>(&self, guard: SpinlockGuard<'_, T>) -> KernelResult<WaitOutcome> {
        match self.wait_inner(guard, None) {
            WaitOutcome::Interrupted => Err(KernelError::Interrupted { restartable: false }),
            other => Ok(other),
        }
    }

    /// As [`wait_intr`], but also returns [`WaitOutcome::TimedOut`] if
    /// `deadline_ticks` (an opaque PM timer tick count) passes first.
    pub fn wait_intr_timed<T>(
        &self,
        guard: SpinlockGuard<'_, T>,
        deadline_ticks: u64,
    ) -> KernelResult<WaitOutcome> {
        match self.wait_inner(guard, Some(deadline_ticks)) {
            WaitOutcome::Interrupted => Err(KernelError::Interrupted { restartable: false }),
            WaitOutcome::TimedOut => Err(KernelError::TimedOut { operation: "condvar wait" }),
            WaitOutcome::Woken => Ok(WaitOutcome::Woken),
        }
    }

    fn wait_inner<T>(&self, guard: SpinlockGuard<'_, T>, deadline_ticks: Option<u64>) -> WaitOutcome {
        let epoch_at_entry = self.epoch.load(Ordering::Acquire);
        self.waiters.fetch_add(1, Ordering::AcqRel);
        // Dropping the guard here is the "atomically release the lock"
        // half of the contract: PM re-checks the epoch after parking the
        // task but before it actually yields the CPU, so a broadcast
        // racing with this drop is never lost.
        drop(guard);
        let outcome = crate::pm::block_current(epoch_at_entry, &self.epoch, deadline_ticks);
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        outcome
    }

    /// Wake every waiter currently parked on this condition variable.
    pub fn broadcast(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        crate::pm::wake_all(&self.epoch);
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
