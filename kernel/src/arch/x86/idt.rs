//! 32-bit Interrupt Descriptor Table.
//!
//! Every vector gets its own tiny assembly stub (see [`super::entry`]) that
//! builds an [`super::context::ExecContext`] on the stack and calls into
//! [`super::entry::common_trap_handler`], which is the single Rust entry
//! point for exceptions, hardware IRQs, and `int 0x80` alike (§2 interrupt
//! control flow, §4.12 syscall flow).

use core::mem::size_of;

use spin::Once;

use super::entry::isr_stub_table;
use super::gdt::KERNEL_CODE_SELECTOR;
use crate::irq::SYSCALL_VECTOR;

const IDT_ENTRIES: usize = 256;

const TYPE_INTERRUPT_GATE_RING0: u8 = 0x8E;
const TYPE_INTERRUPT_GATE_RING3: u8 = 0xEE;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self { offset_low: 0, selector: 0, zero: 0, type_attr: 0, offset_high: 0 }
    }

    fn new(handler: u32, type_attr: u8) -> Self {
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CODE_SELECTOR,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

static mut IDT: [IdtEntry; IDT_ENTRIES] = [IdtEntry::missing(); IDT_ENTRIES];

static INIT: Once<()> = Once::new();

/// Build the IDT from the stub table `entry.rs` emits and load it. Must run
/// after [`super::gdt::init`] (gates reference the kernel code selector).
pub fn init() {
    INIT.call_once(|| {
        // SAFETY: single-threaded boot context; IDT is untouched elsewhere
        // until this returns.
        unsafe {
            for vector in 0..IDT_ENTRIES {
                let handler = isr_stub_table[vector];
                let type_attr = if vector as u8 == SYSCALL_VECTOR {
                    TYPE_INTERRUPT_GATE_RING3
                } else {
                    TYPE_INTERRUPT_GATE_RING0
                };
                IDT[vector] = IdtEntry::new(handler, type_attr);
            }

            let pointer = DescriptorTablePointer {
                limit: (size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
                base: &raw const IDT as u32,
            };
            load_idt(&pointer);
        }
    });
}

/// # Safety
/// `pointer` must describe a live, correctly laid out IDT.
unsafe fn load_idt(pointer: &DescriptorTablePointer) {
    // SAFETY: caller contract above; lidt only affects interrupt dispatch.
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) pointer, options(nostack, preserves_flags));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_gate_is_ring3_reachable() {
        let entry = IdtEntry::new(0, TYPE_INTERRUPT_GATE_RING3);
        assert_eq!(entry.type_attr & 0x60, 0x60);
    }
}
