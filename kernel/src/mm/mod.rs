//! Memory manager: frame allocator, page-table manager, kernel heap, and
//! per-process address spaces (§2 components 1-4).

pub mod frame_allocator;
pub mod heap;
pub mod layout;
pub mod page_table;
pub mod vas;

pub use frame_allocator::MemoryRegion;
pub use heap::KernelHeap;

use crate::error::KernelResult;

/// Boot-time sequence for this subsystem (§2 "Boot flow"): frame-allocator
/// init from the memory map, initial page tables are assumed already live
/// (installed by the architecture's early-boot assembly before Rust code
/// runs), then the heap.
pub fn init(regions: &[MemoryRegion], heap_validate: bool) -> KernelResult<()> {
    frame_allocator::init(regions);
    heap::init(layout::PAGE_SIZE as usize * 4, heap_validate)?;
    Ok(())
}
