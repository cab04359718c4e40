//! x86 (32-bit, protected mode) architecture support.
//!
//! Hand-rolled GDT/TSS, IDT, PIC/APIC bring-up, serial and VGA text output,
//! and the common-stub interrupt entry path. Raw port I/O, MSR access, and
//! control-register primitives live in [`crate::platform`] — this module is
//! where that trusted boundary gets assembled into a running CPU.

pub mod bootstrap;
pub mod context;
pub mod early_serial;
pub mod entry;
pub mod gdt;
pub mod idt;
pub mod multiboot;
pub mod serial;
pub mod timer;
pub mod vga;

pub mod apic;

use pic8259::ChainedPics;
use spin::Mutex;

use crate::platform::{self, IoPort};

/// Legacy 8259 PIC vector offsets, chosen so the master/slave ranges sit
/// inside the IRQ manager's `PIC_RESERVED` band (§4.9) without colliding
/// with the CPU exception vectors below 0x20.
pub const PIC1_OFFSET: u8 = crate::irq::PIC_RESERVED_BASE;
pub const PIC2_OFFSET: u8 = PIC1_OFFSET + 8;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC1_OFFSET, PIC2_OFFSET) });

/// Initialize the legacy PIC and mask every line. Used only in
/// [`crate::irq::ControllerMode::Pic`] fallback mode, when the config-table
/// parse found no usable I/O APIC (§4.9, §9).
///
/// # Safety
/// Must run once, early, before any IRQ line is unmasked.
pub unsafe fn init_pic() {
    // SAFETY: the PIC is uninitialized hardware at this point in boot; the
    // ICW sequence `pic8259` issues is the standard 8259 bring-up.
    unsafe {
        PICS.lock().initialize();
    }
}

/// Send end-of-interrupt to the PIC for `vector` (§4.9 `do_eoi`, PIC mode).
pub fn pic_eoi(vector: u8) {
    // SAFETY: notify_end_of_interrupt only issues an EOI command byte to
    // whichever PIC owns `vector`; harmless if the vector is out of its
    // configured range beyond a spurious EOI.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}

pub fn mask_pic_all() {
    // SAFETY: writes the OCW1 mask registers; always safe post-init.
    unsafe {
        platform::outb(IoPort::new(0x21), 0xFF);
        platform::outb(IoPort::new(0xA1), 0xFF);
    }
}

/// Speculation barrier (LFENCE) to bound Spectre-style speculative reads
/// across a trust boundary (e.g. before using a user-supplied index).
#[inline(always)]
pub fn speculation_barrier() {
    // SAFETY: lfence only serializes the instruction stream.
    unsafe {
        core::arch::asm!("lfence", options(nostack, nomem, preserves_flags));
    }
}

/// Halt forever. Used by the panic handler and a CPU that has nothing left
/// to schedule.
pub fn halt_loop() -> ! {
    platform::disable_interrupts();
    loop {
        platform::halt();
    }
}

/// RAII interrupt guard: disables interrupts on construction, restores the
/// prior state on drop. Used by the handful of call sites that need a
/// non-lock-shaped critical section (e.g. `vga`/`serial` output).
pub struct InterruptGuard {
    was_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        Self { was_enabled: platform::disable_interrupts() }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        platform::restore_interrupts(self.was_enabled);
    }
}

pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _guard = InterruptGuard::new();
    f()
}
