//! Kernel error taxonomy
//!
//! A single [`KernelError`] enum is the error currency of every fallible
//! operation in the kernel core: the frame allocator, page-table manager,
//! heap, config-table parser, APIC/PCI drivers, IRQ manager, driver manager,
//! and syscall dispatcher all return [`KernelResult<T>`]. The syscall
//! dispatcher is the only place that flattens this into a signed errno
//! (`to_errno`); everywhere else the enum travels intact so callers can
//! match on the disposition that actually occurred.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No physical frame / no heap slot / no PTD slot available.
    OutOfMemory { requested: usize, available: usize },
    /// Invalid major/minor number or driver unavailable.
    NoDevice { major: u32, minor: u32 },
    /// A major number (or other uniquely-owned slot) is already registered.
    AlreadyRegistered { resource: &'static str, id: u64 },
    /// Unaligned region, zero length where disallowed, bad pointer.
    InvalidArgument { name: &'static str, value: &'static str },
    /// A buffer touches unmapped memory or memory without the requested
    /// access rights under the current page tables.
    InvalidAddress { addr: u32 },
    /// A wait was aborted by a signal.
    Interrupted { restartable: bool },
    /// A condition wait, IPI delivery, or bounded spin exceeded its deadline.
    TimedOut { operation: &'static str },
    /// Mapped-but-wrong-permission access from user mode (SEGV is delivered;
    /// this variant exists for diagnostics and is never surfaced to the
    /// syscall return value directly).
    AccessDenied { addr: u32 },
    /// A resource was not found (IRQ handler, driver slot, PCI device, CPU).
    NotFound { resource: &'static str, id: u64 },
    /// Subsystem used before its `init()` ran.
    NotInitialized { subsystem: &'static str },
    /// Operation not supported by this configuration (e.g. MSI on a device
    /// without the capability, a boot parameter naming an unknown mode).
    NotSupported { operation: &'static str },
    /// Reserved-bit PTE state, PTD overflow at init, or another invariant
    /// breach that leaves kernel state inconsistent. Callers at this level
    /// are expected to panic; this variant exists so the detection site and
    /// the panic site can be different functions.
    Fatal { reason: &'static str },
    /// Legacy string error for gradual migration from `&'static str`
    /// patterns. New code should use a specific variant instead.
    LegacyError { message: &'static str },
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Negate this error into a POSIX-style errno, as returned in `eax` by
    /// the syscall dispatcher (§4.12: "negative values are errno negation").
    ///
    /// `Interrupted { restartable: true }` maps to the restart marker rather
    /// than `EINTR`; the dispatcher is responsible for recognising it and
    /// re-entering the original adapter instead of returning it to user
    /// space.
    pub fn to_errno(self) -> i32 {
        const ENOMEM: i32 = 12;
        const ENODEV: i32 = 19;
        const EALREADY: i32 = 114;
        const EINVAL: i32 = 22;
        const EFAULT: i32 = 14;
        const EINTR: i32 = 4;
        const EPAUSE: i32 = 512; // restart marker, not a POSIX errno
        const ETIMEDOUT: i32 = 110;
        const ENOENT: i32 = 2;
        const ENOSYS: i32 = 38;

        let positive = match self {
            Self::OutOfMemory { .. } => ENOMEM,
            Self::NoDevice { .. } => ENODEV,
            Self::AlreadyRegistered { .. } => EALREADY,
            Self::InvalidArgument { .. } => EINVAL,
            Self::InvalidAddress { .. } => EFAULT,
            Self::Interrupted { restartable: true } => EPAUSE,
            Self::Interrupted { restartable: false } => EINTR,
            Self::TimedOut { .. } => ETIMEDOUT,
            Self::AccessDenied { .. } => EFAULT,
            Self::NotFound { .. } => ENOENT,
            Self::NotInitialized { .. } => ENODEV,
            Self::NotSupported { .. } => ENOSYS,
            Self::Fatal { .. } => ENOSYS,
            Self::LegacyError { .. } => EINVAL,
        };
        -positive
    }

    /// True for the class of error that §7 dictates must abort the machine
    /// rather than propagate to a caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested, available } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            Self::NoDevice { major, minor } => {
                write!(f, "no device for major={} minor={}", major, minor)
            }
            Self::AlreadyRegistered { resource, id } => {
                write!(f, "{} {} already registered", resource, id)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::InvalidAddress { addr } => write!(f, "invalid address 0x{:x}", addr),
            Self::Interrupted { restartable } => {
                write!(f, "interrupted (restartable={})", restartable)
            }
            Self::TimedOut { operation } => write!(f, "timed out during {}", operation),
            Self::AccessDenied { addr } => write!(f, "access denied at 0x{:x}", addr),
            Self::NotFound { resource, id } => write!(f, "{} {} not found", resource, id),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::NotSupported { operation } => write!(f, "not supported: {}", operation),
            Self::Fatal { reason } => write!(f, "fatal: {}", reason),
            Self::LegacyError { message } => write!(f, "{}", message),
        }
    }
}

/// Conversion from legacy `&'static str` errors to [`KernelError`].
impl From<&'static str> for KernelError {
    fn from(msg: &'static str) -> Self {
        Self::LegacyError { message: msg }
    }
}

/// Helper macro for concise error construction at call sites.
#[macro_export]
macro_rules! kernel_error {
    (OutOfMemory { requested: $req:expr, available: $avail:expr }) => {
        $crate::error::KernelError::OutOfMemory {
            requested: $req,
            available: $avail,
        }
    };
    (InvalidArgument { $name:expr => $value:expr }) => {
        $crate::error::KernelError::InvalidArgument {
            name: $name,
            value: $value,
        }
    };
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_negation_is_negative() {
        let err = KernelError::OutOfMemory {
            requested: 4096,
            available: 0,
        };
        assert!(err.to_errno() < 0);
    }

    #[test]
    fn restartable_interrupt_uses_pause_marker() {
        let restart = KernelError::Interrupted { restartable: true };
        let abort = KernelError::Interrupted { restartable: false };
        assert_ne!(restart.to_errno(), abort.to_errno());
    }

    #[test]
    fn fatal_is_detected() {
        assert!(KernelError::Fatal { reason: "ptd overflow" }.is_fatal());
        assert!(!KernelError::TimedOut { operation: "ipi" }.is_fatal());
    }
}
