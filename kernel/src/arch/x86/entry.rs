//! Common interrupt/exception/syscall entry path (§2, §4.12).
//!
//! 256 tiny per-vector stubs normalize the stack (pushing a dummy error
//! code where the CPU doesn't supply one, then the vector number) and fall
//! into `isr_common`, which finishes building an [`ExecContext`] and calls
//! [`common_trap_handler`]. From there everything is ordinary Rust:
//! [`crate::irq::handle_interrupt`] is the single dispatch point for
//! exceptions, hardware IRQs, and `int 0x80` alike.

use core::arch::global_asm;
use core::panic::PanicInfo;

use super::context::ExecContext;

pub fn arch_early_init() {
    crate::platform::disable_interrupts();
    super::early_serial::init();
    crate::early_println!("[EARLY] x86 kernel_main reached!");
    crate::early_println!("[EARLY] veridian kernel v{}", env!("CARGO_PKG_VERSION"));
    crate::early_println!("[EARLY] Architecture: x86 (32-bit, protected mode)");
}

pub fn arch_panic_handler(info: &PanicInfo) {
    crate::println!("[KERNEL PANIC] {}", info);
}

/// Single Rust-side entry point every stub funnels into. `ctx` points at
/// the top of the just-built `ExecContext` on this CPU's current stack.
#[no_mangle]
extern "C" fn common_trap_handler(ctx: *mut ExecContext) -> u32 {
    // SAFETY: `ctx` was just constructed by `isr_common` immediately below
    // it on this thread's stack; it is valid and uniquely borrowed for the
    // duration of this call.
    let ctx = unsafe { &mut *ctx };
    crate::irq::handle_interrupt(ctx)
}

global_asm!(
    r#"
.text
.macro isr_noerr num
.global isr_stub_\num
isr_stub_\num:
    push 0
    push \num
    jmp isr_common
.endm

.macro isr_err num
.global isr_stub_\num
isr_stub_\num:
    push \num
    jmp isr_common
.endm

isr_noerr 0
isr_noerr 1
isr_noerr 2
isr_noerr 3
isr_noerr 4
isr_noerr 5
isr_noerr 6
isr_noerr 7
isr_err   8
isr_noerr 9
isr_err   10
isr_err   11
isr_err   12
isr_err   13
isr_err   14
isr_noerr 15
isr_noerr 16
isr_err   17
isr_noerr 18
isr_noerr 19
isr_noerr 20
isr_noerr 21
isr_noerr 22
isr_noerr 23
isr_noerr 24
isr_noerr 25
isr_noerr 26
isr_noerr 27
isr_noerr 28
isr_noerr 29
isr_noerr 30
isr_noerr 31

.altmacro
.set i, 32
.rept 224
    isr_noerr %i
    .set i, i+1
.endr

isr_common:
    pushad
    push ds
    push es
    push fs
    push gs

    mov ax, 0x10
    mov ds, ax
    mov es, ax

    push esp
    call common_trap_handler
    add esp, 4
    test eax, eax
    jz 1f
    mov esp, eax
1:
    pop gs
    pop fs
    pop es
    pop ds
    popad
    add esp, 8
    iretd

.section .rodata
.global isr_stub_table
isr_stub_table:
.altmacro
.set i, 0
.rept 256
    .long isr_stub_%i
    .set i, i+1
.endr
.text
"#
);

unsafe extern "C" {
    #[link_name = "isr_stub_table"]
    pub static isr_stub_table: [u32; 256];
}
