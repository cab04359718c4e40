//! No-std test framework.
//!
//! `#[test_case]` functions run under the custom test runner enabled in
//! [`crate`]'s crate attributes, report through the serial port, and exit
//! QEMU via the `isa-debug-exit` device at port `0xf4` so CI doesn't need
//! to watch the VGA console to know whether a run passed.

use core::panic::PanicInfo;

use crate::error::KernelError;
use crate::{serial_print, serial_println};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub trait Testable {
    fn run(&self) -> Result<(), KernelError>;
}

impl<T> Testable for T
where
    T: Fn() -> Result<(), KernelError>,
{
    fn run(&self) -> Result<(), KernelError> {
        serial_print!("{}...\t", core::any::type_name::<T>());
        match self() {
            Ok(()) => {
                serial_println!("[ok]");
                Ok(())
            }
            Err(e) => {
                serial_println!("[failed]: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("Running {} tests", tests.len());
    let mut passed = 0;
    let mut failed = 0;

    for test in tests {
        match test.run() {
            Ok(()) => passed += 1,
            Err(_) => failed += 1,
        }
    }

    serial_println!("\nTest Results: {passed} passed, {failed} failed");
    exit_qemu(if failed == 0 { QemuExitCode::Success } else { QemuExitCode::Failed });
}

pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {info}\n");
    exit_qemu(QemuExitCode::Failed);
}

pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    // SAFETY: port 0xf4 is QEMU's isa-debug-exit device; writing to it
    // always terminates the VM before the next instruction would run.
    unsafe {
        crate::platform::outl(crate::platform::IoPort::new(0xf4), exit_code as u32);
        core::hint::unreachable_unchecked();
    }
}

/// Define a `#[test_case]` entry out of a `Result`-returning expression.
#[macro_export]
macro_rules! kernel_test {
    ($name:ident, $test:expr) => {
        #[test_case]
        const $name: &dyn $crate::test_framework::Testable =
            &|| -> Result<(), $crate::error::KernelError> { $test };
    };
}

#[macro_export]
macro_rules! kernel_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::serial_println!("assertion failed: {}", stringify!($cond));
            panic!("assertion failed");
        }
    };
}

#[macro_export]
macro_rules! kernel_assert_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            $crate::serial_println!(
                "assertion failed: {} != {}\n  left: {:?}\n right: {:?}",
                stringify!($left),
                stringify!($right),
                $left,
                $right
            );
            panic!("assertion failed: not equal");
        }
    };
}
