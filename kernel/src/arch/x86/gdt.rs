//! 32-bit Global Descriptor Table and Task State Segment.
//!
//! Flat segmentation: one kernel code/data pair at ring 0, one user
//! code/data pair at ring 3, and a TSS whose only job is to carry ESP0 so
//! the CPU knows which kernel stack to switch to on a ring 3 -> ring 0
//! transition (interrupt, exception, or `int 0x80`).

use core::mem::size_of;

use spin::Once;

/// Selector of the kernel code segment (ring 0).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Selector of the kernel data segment (ring 0).
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// Selector of the TSS descriptor.
pub const TSS_SELECTOR: u16 = 0x18;
/// Selector of the user data segment, RPL 3.
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
/// Selector of the user code segment, RPL 3.
pub const USER_CODE_SELECTOR: u16 = 0x28 | 3;

const GDT_ENTRIES: usize = 6; // null, kcode, kdata, tss, udata, ucode

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        Self { limit_low: 0, base_low: 0, base_mid: 0, access: 0, granularity: 0, base_high: 0 }
    }

    const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: ((limit >> 16) as u8 & 0x0F) | (flags << 4),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// 32-bit Task State Segment. Only `esp0`/`ss0` (the ring-0 stack to load
/// on a privilege-level change) and the I/O permission bitmap offset are
/// meaningful; the rest is hardware bookkeeping this kernel never uses
/// (no hardware task switching).
#[repr(C, packed)]
struct Tss {
    link: u16,
    _r0: u16,
    esp0: u32,
    ss0: u16,
    _r1: u16,
    esp1: u32,
    ss1: u16,
    _r2: u16,
    esp2: u32,
    ss2: u16,
    _r3: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    _r4: u16,
    cs: u16,
    _r5: u16,
    ss: u16,
    _r6: u16,
    ds: u16,
    _r7: u16,
    fs: u16,
    _r8: u16,
    gs: u16,
    _r9: u16,
    ldtr: u16,
    _r10: u16,
    _r11: u16,
    iomap_base: u16,
}

impl Tss {
    const fn new() -> Self {
        // Every field above is a plain integer, so the all-zero bit
        // pattern is a valid `Tss`.
        unsafe { core::mem::zeroed() }
    }
}

const KERNEL_STACK_SIZE: usize = 4096 * 4;

#[repr(align(16))]
struct Stack([u8; KERNEL_STACK_SIZE]);

static mut DOUBLE_FAULT_STACK: Stack = Stack([0; KERNEL_STACK_SIZE]);
static mut TSS: Tss = Tss::new();
static mut GDT: [GdtEntry; GDT_ENTRIES] = [GdtEntry::null(); GDT_ENTRIES];

static INIT: Once<()> = Once::new();

const ACCESS_KERNEL_CODE: u8 = 0x9A; // present, ring0, code, executable, readable
const ACCESS_KERNEL_DATA: u8 = 0x92; // present, ring0, data, writable
const ACCESS_USER_CODE: u8 = 0xFA; // present, ring3, code, executable, readable
const ACCESS_USER_DATA: u8 = 0xF2; // present, ring3, data, writable
const ACCESS_TSS: u8 = 0x89; // present, ring0, 32-bit TSS (available)
const FLAGS_4K_32BIT: u8 = 0xC; // granularity=4K, size=32-bit

/// Build the GDT/TSS and load them. Called once on the BSP before the IDT.
pub fn init() {
    INIT.call_once(|| {
        // SAFETY: single-threaded, pre-SMP boot; no other code touches
        // these statics until `init` returns.
        unsafe {
            let tss_base = &raw const TSS as u32;
            let tss_limit = (size_of::<Tss>() - 1) as u32;

            GDT[0] = GdtEntry::null();
            GDT[1] = GdtEntry::new(0, 0xFFFFF, ACCESS_KERNEL_CODE, FLAGS_4K_32BIT);
            GDT[2] = GdtEntry::new(0, 0xFFFFF, ACCESS_KERNEL_DATA, FLAGS_4K_32BIT);
            GDT[3] = GdtEntry::new(tss_base, tss_limit, ACCESS_TSS, 0);
            GDT[4] = GdtEntry::new(0, 0xFFFFF, ACCESS_USER_DATA, FLAGS_4K_32BIT);
            GDT[5] = GdtEntry::new(0, 0xFFFFF, ACCESS_USER_CODE, FLAGS_4K_32BIT);

            TSS.ss0 = KERNEL_DATA_SELECTOR;
            TSS.esp0 = (&raw const DOUBLE_FAULT_STACK as u32) + KERNEL_STACK_SIZE as u32;
            TSS.iomap_base = size_of::<Tss>() as u16;

            let pointer = DescriptorTablePointer {
                limit: (size_of::<[GdtEntry; GDT_ENTRIES]>() - 1) as u16,
                base: &raw const GDT as u32,
            };

            load_gdt(&pointer);
            reload_segments();
            load_tss(TSS_SELECTOR);
        }
    });
}

/// # Safety
/// `pointer` must describe a live, correctly laid out GDT.
unsafe fn load_gdt(pointer: &DescriptorTablePointer) {
    // SAFETY: caller contract above; lgdt only affects descriptor lookups.
    unsafe {
        core::arch::asm!("lgdt [{}]", in(reg) pointer, options(nostack, preserves_flags));
    }
}

/// # Safety
/// The GDT must already be loaded and contain the kernel code/data
/// descriptors at the selectors used below.
unsafe fn reload_segments() {
    // SAFETY: caller contract above. CS is reloaded via the classic
    // push-selector/push-offset/retf trick (there is no direct "far jump
    // to immediate" in the LLVM integrated assembler's Intel syntax); the
    // data segment registers are loaded directly.
    unsafe {
        core::arch::asm!(
            "push {code_sel}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov ax, {data_sel:x}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            code_sel = const KERNEL_CODE_SELECTOR,
            data_sel = in(reg) KERNEL_DATA_SELECTOR,
            tmp = out(reg) _,
        );
    }
}

/// # Safety
/// `selector` must name a valid, present TSS descriptor in the loaded GDT.
unsafe fn load_tss(selector: u16) {
    // SAFETY: caller contract above.
    unsafe {
        core::arch::asm!("ltr {0:x}", in(reg) selector, options(nostack, preserves_flags));
    }
}

/// Update ESP0 in the TSS. Called by PM before resuming a task, so that the
/// next ring 3 -> ring 0 transition lands on that task's kernel stack.
pub fn set_kernel_stack(esp0: u32) {
    // SAFETY: TSS is static and only written here; the call-site contract
    // (PM calls this with interrupts disabled during a task switch) rules
    // out a concurrent write on this CPU.
    unsafe {
        TSS.esp0 = esp0;
    }
}

pub fn kernel_stack() -> u32 {
    // SAFETY: plain read of a static `u32` field.
    unsafe { TSS.esp0 }
}
