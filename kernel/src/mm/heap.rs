//! Kernel heap (§4.3).
//!
//! `malloc`/`malloc_aligned`/`free` are served out of a `linked_list_allocator`
//! freelist that the heap grows, whole pages at a time, up to the MMIO base
//! when exhausted; it never shrinks. The same freelist backs the
//! `#[global_allocator]` used by `alloc::{Box, Vec, BTreeMap}` throughout the
//! rest of the kernel (§4.3 ADDED), so there is exactly one heap.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use linked_list_allocator::Heap;

use crate::error::{KernelError, KernelResult};
use crate::mm::{layout, page_table};
use crate::platform::{PhysAddr, VirtAddr};
use crate::sync::IrqSpinlock;

struct KernelHeapInner {
    heap: Heap,
    top: u32,
    validate: bool,
}

impl KernelHeapInner {
    const fn new() -> Self {
        Self {
            heap: Heap::empty(),
            top: layout::HEAP_START.raw(),
            validate: false,
        }
    }

    fn grow(&mut self, at_least: usize) -> KernelResult<()> {
        let pages = (at_least as u32).div_ceil(layout::PAGE_SIZE).max(1);
        let mut extended = 0u32;
        while extended < pages * layout::PAGE_SIZE {
            if self.top >= layout::MMIO_BASE.raw() {
                return Err(KernelError::OutOfMemory {
                    requested: at_least,
                    available: extended as usize,
                });
            }
            let frame = crate::mm::frame_allocator::get_page()?;
            page_table::map_page(frame.phys(), VirtAddr::new(self.top), true, false, false)?;
            self.top += layout::PAGE_SIZE;
            extended += layout::PAGE_SIZE;
        }
        // SAFETY: the pages just mapped above are writable kernel memory
        // exclusively owned by this extension.
        unsafe {
            self.heap
                .extend(extended as usize);
        }
        Ok(())
    }

    /// Sweep the freelist for internal consistency (§4.3). `Heap` doesn't
    /// expose its hole list publicly, so the sweep checks the one
    /// cross-cutting invariant it does expose: every byte mapped into the
    /// heap is accounted for as either used or free. A freelist corruption
    /// (a clobbered hole header merging/losing blocks) shows up as this
    /// total drifting from the mapped size.
    fn validate_if_enabled(&self) {
        if !self.validate {
            return;
        }
        let mapped = self.top.saturating_sub(layout::HEAP_START.raw()) as usize;
        let accounted = self.heap.used() + self.heap.free();
        if accounted != mapped {
            panic!(
                "heap freelist corrupt: used({}) + free({}) = {accounted} != mapped {mapped}",
                self.heap.used(),
                self.heap.free(),
            );
        }
    }
}

static HEAP: IrqSpinlock<KernelHeapInner> = IrqSpinlock::new(KernelHeapInner::new());

/// Map the heap's first page and hand ownership of the freelist to
/// `linked_list_allocator`. Must run after paging is enabled.
pub fn init(initial_size: usize, validate: bool) -> KernelResult<()> {
    let mut inner = HEAP.lock();
    inner.validate = validate;
    let base = layout::HEAP_START;
    let frame = crate::mm::frame_allocator::get_page()?;
    page_table::map_page(frame.phys(), base, true, false, false)?;
    inner.top = base.raw() + layout::PAGE_SIZE;
    // SAFETY: `base..base+PAGE_SIZE` was just mapped as writable kernel
    // memory and is not aliased anywhere else.
    unsafe {
        inner.heap.init(base.as_mut_ptr::<u8>(), layout::PAGE_SIZE as usize);
    }
    drop(inner);
    if initial_size > layout::PAGE_SIZE as usize {
        HEAP.lock().grow(initial_size - layout::PAGE_SIZE as usize)?;
    }
    Ok(())
}

pub fn malloc(size: usize) -> KernelResult<VirtAddr> {
    malloc_aligned(size, core::mem::align_of::<usize>())
}

pub fn malloc_aligned(size: usize, align: usize) -> KernelResult<VirtAddr> {
    let layout = Layout::from_size_align(size.max(1), align)
        .map_err(|_| KernelError::InvalidArgument { name: "align", value: "not a power of two" })?;
    let mut inner = HEAP.lock();
    let ptr = match inner.heap.allocate_first_fit(layout) {
        Ok(p) => p,
        Err(()) => {
            inner.grow(size + align)?;
            inner
                .heap
                .allocate_first_fit(layout)
                .map_err(|()| KernelError::OutOfMemory { requested: size, available: 0 })?
        }
    };
    inner.validate_if_enabled();
    Ok(VirtAddr::new(ptr.as_ptr() as u32))
}

/// # Safety
/// `ptr` must have been returned by [`malloc`]/[`malloc_aligned`] with
/// matching `size`/`align`, and not freed already.
pub unsafe fn free(ptr: VirtAddr, size: usize, align: usize) {
    let Ok(layout) = Layout::from_size_align(size.max(1), align) else {
        return;
    };
    let Some(nn) = NonNull::new(ptr.as_mut_ptr::<u8>()) else {
        return;
    };
    let mut inner = HEAP.lock();
    // SAFETY: caller contract above.
    unsafe {
        inner.heap.deallocate(nn, layout);
    }
    inner.validate_if_enabled();
}

/// `#[global_allocator]`-compatible wrapper over the same freelist (§4.3
/// ADDED), so `alloc::{Box, Vec, BTreeMap}` go through this heap instead of
/// a second allocator.
pub struct KernelHeap;

// SAFETY: every method forwards to the single `HEAP` spinlock, which
// serialises all access; extension on exhaustion maps fresh pages rather
// than ever returning stale memory.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut inner = HEAP.lock();
        match inner.heap.allocate_first_fit(layout) {
            Ok(p) => p.as_ptr(),
            Err(()) => {
                if inner.grow(layout.size() + layout.align()).is_err() {
                    return core::ptr::null_mut();
                }
                inner
                    .heap
                    .allocate_first_fit(layout)
                    .map(|p| p.as_ptr())
                    .unwrap_or(core::ptr::null_mut())
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(nn) = NonNull::new(ptr) else { return };
        // SAFETY: the caller of `GlobalAlloc::dealloc` guarantees `ptr`
        // was allocated by this allocator with this `layout`.
        unsafe {
            HEAP.lock().heap.deallocate(nn, layout);
        }
    }
}

pub fn heap_top() -> PhysAddr {
    PhysAddr::new(HEAP.lock().top)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_heap_has_page_size_zero() {
        let inner = KernelHeapInner::new();
        assert_eq!(inner.top, layout::HEAP_START.raw());
    }
}
