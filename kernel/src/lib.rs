//! 32-bit x86 kernel core.
//!
//! Frame allocator, paging, heap, IRQ manager, driver manager, and the
//! syscall dispatcher for a single preemptible address space. Process
//! management, the file system, and networking are out of scope (§1
//! Non-goals) and live outside this repository; [`pm`] is the narrow
//! boundary this core calls into and is satisfied here, not implemented.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]
#![feature(custom_test_frameworks)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", test_runner(crate::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelHeap = mm::heap::KernelHeap;

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootparam;
pub mod bootstrap;
pub mod config;
pub mod cpu;
pub mod drivers;
pub mod error;
mod intrinsics;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod platform;
pub mod pm;
pub mod sync;
mod syscall;
mod test_framework;
pub mod utils;

pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};
#[cfg(test)]
pub use test_framework::test_runner;

use arch::x86::multiboot::BootInfo;

/// Called from [`arch::x86::multiboot::multiboot_main`] once the Multiboot2
/// tags have been parsed into a `'static` `BootInfo`. Brings up early serial
/// output, then runs the full boot sequence (§2) before falling into an
/// idle halt loop — this repository stops at the handoff to process
/// management, it doesn't run a scheduler of its own (§1 Non-goals).
pub fn kernel_main_impl(info: BootInfo) -> ! {
    arch::x86::entry::arch_early_init();

    if let Err(e) = bootstrap::kernel_init(&info) {
        panic!("boot sequence failed: {e}");
    }

    log::info!("boot sequence complete, idling");
    arch::x86::halt_loop();
}

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::x86::entry::arch_panic_handler(info);
    arch::x86::halt_loop();
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {layout:?}");
}
