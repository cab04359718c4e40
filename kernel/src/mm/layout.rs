//! Virtual address space layout (§3 "Process address space").
//!
//! Low to high: low memory & kernel image, the RAM-disk window, the kernel
//! heap, the memory-mapped I/O window — all part of the 128 MiB "common
//! area" shared byte-for-byte across every process — then the per-process
//! user code/data/heap, user stack, per-task kernel stacks, the transient
//! mapping band, and finally the recursive PTD window in the top 4 MiB.
//! These constants are the only place this layout is spelled out; every
//! other module reaches addresses in a given band through the accessors
//! here rather than hard-coding offsets a second time.

use crate::platform::VirtAddr;

pub const PAGE_SIZE: u32 = 4096;
pub const PTD_ENTRIES: usize = 1024;

/// Number of PTD entries making up the shared common area (128 MiB).
pub const COMMON_AREA_ENTRIES: usize = 32;
pub const COMMON_AREA_END: VirtAddr = VirtAddr::new(0x0800_0000);

pub const KERNEL_IMAGE_BASE: VirtAddr = VirtAddr::new(0x0010_0000);
pub const RAMDISK_WINDOW_BASE: VirtAddr = VirtAddr::new(0x0040_0000);
pub const RAMDISK_WINDOW_END: VirtAddr = VirtAddr::new(0x0080_0000);

pub const HEAP_START: VirtAddr = VirtAddr::new(0x0080_0000);
pub const MMIO_BASE: VirtAddr = VirtAddr::new(0x0400_0000);
pub const MMIO_END: VirtAddr = VirtAddr::new(0x0800_0000);

pub const USER_AREA_START: VirtAddr = COMMON_AREA_END;
pub const USER_STACK_TOP: VirtAddr = VirtAddr::new(0xFF00_0000);

/// Per-task kernel stack band: K pages of stack separated by G pages of
/// unmapped guard space (§3 "Stack allocator"). K+2G <= 1024 so the band
/// below always fits comfortably under the transient band.
pub const KSTACK_BAND_BASE: VirtAddr = VirtAddr::new(0xFF00_0000);
pub const KSTACK_BAND_END: VirtAddr = VirtAddr::new(0xFFA0_0000);
pub const TASK_STACK_PAGES: u32 = 8; // K
pub const STACK_GAP_PAGES: u32 = 1; // G

/// Band of slots for [`crate::mm::page_table::attach_page`] transient
/// mappings, between the kernel-stack band and the recursive window.
pub const TRANSIENT_BAND_BASE: VirtAddr = VirtAddr::new(0xFFA0_0000);
pub const TRANSIENT_BAND_END: VirtAddr = VirtAddr::new(0xFFC0_0000);

/// Recursive self-map: PTD index 1023 maps to the PTD itself, so the 1024
/// page tables (including the PTD, at the very top) are reachable here.
pub const RECURSIVE_SLOT: usize = PTD_ENTRIES - 1;
pub const RECURSIVE_PT_BASE: u32 = 0xFFC0_0000;
pub const RECURSIVE_PTD_ADDR: VirtAddr = VirtAddr::new(0xFFFF_F000);

pub fn recursive_pt_vaddr(ptd_index: usize) -> VirtAddr {
    VirtAddr::new(RECURSIVE_PT_BASE + (ptd_index as u32) * PAGE_SIZE)
}

pub fn in_common_area(addr: VirtAddr) -> bool {
    addr.ptd_index() < COMMON_AREA_ENTRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_area_boundary_matches_ptd_index() {
        assert_eq!(COMMON_AREA_END.ptd_index(), COMMON_AREA_ENTRIES);
        assert!(in_common_area(VirtAddr::new(0x0010_0000)));
        assert!(!in_common_area(USER_AREA_START));
    }

    #[test]
    fn recursive_slot_is_last_ptd_entry() {
        assert_eq!(RECURSIVE_SLOT, PTD_ENTRIES - 1);
    }
}
