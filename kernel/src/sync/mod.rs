//! Synchronization primitives.
//!
//! Safe singleton management ([`OnceLock`]/[`LazyLock`]/[`GlobalState`]) plus
//! the IF-save spinlock and condition variable every other subsystem's
//! global state is built on (§4.13).

pub mod condvar;
pub mod once_lock;
pub mod spinlock;

pub use condvar::{CondVar, WaitOutcome};
pub use once_lock::{GlobalState, LazyLock, OnceLock};
pub use spinlock::{IrqSpinlock, SpinlockGuard};
