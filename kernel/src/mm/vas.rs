//! Per-process address space and stack allocators (§4.4).
//!
//! Lock discipline (enforced by the design, not a runtime checker):
//! `address_space.lock -> {heap_lock, st_lock[pid]}; heap_lock -> pt_lock[pid];
//! st_lock[pid] -> pt_lock[pid]; pt_lock[pid] -> {frame_lock, sp_lock[pid]};
//! address_space.lock -> frame_lock`. No other acquisition order is
//! permitted. `pt_lock`/`sp_lock`/`frame_lock` are the implicit locks inside
//! [`super::page_table`]/[`super::frame_allocator`]; `st_lock` is
//! [`AddressSpace`]'s own `stacks` lock, taken here.

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::mm::{frame_allocator, layout, page_table};
use crate::platform::VirtAddr;
use crate::sync::IrqSpinlock;

/// Per-task kernel stack reservation (§3 "Stack allocator").
#[derive(Debug, Clone, Copy)]
pub struct StackAllocator {
    pub task_id: u32,
    pub pid: u32,
    pub lowest_page: VirtAddr,
    pub highest_page: VirtAddr,
    pub valid: bool,
}

pub struct AddressSpace {
    pub pid: u32,
    pub brk: IrqSpinlock<VirtAddr>,
    pub end_data: VirtAddr,
    stacks: IrqSpinlock<Vec<StackAllocator>>,
}

impl AddressSpace {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            brk: IrqSpinlock::new(layout::USER_AREA_START),
            end_data: layout::USER_AREA_START,
            stacks: IrqSpinlock::new(Vec::new()),
        }
    }

    /// Map `TASK_STACK_PAGES` at the top of the user area and reset `brk`
    /// and `end_data` to the start-of-code marker.
    pub fn init_user_area(&mut self) -> KernelResult<()> {
        let top = layout::USER_STACK_TOP;
        for i in 0..layout::TASK_STACK_PAGES {
            let virt = VirtAddr::new(top.raw() - (i + 1) * layout::PAGE_SIZE);
            let frame = frame_allocator::get_page()?;
            page_table::map_page(frame.phys(), virt, true, true, false)?;
        }
        *self.brk.lock() = layout::USER_AREA_START;
        self.end_data = layout::USER_AREA_START;
        Ok(())
    }

    /// Round the new break up to a page boundary, map new user pages, and
    /// update `brk`. Never contracts the break.
    pub fn sbrk(&self, increment: i32) -> KernelResult<VirtAddr> {
        let mut brk = self.brk.lock();
        if increment <= 0 {
            return Ok(*brk);
        }
        let old = *brk;
        let new_raw = old.raw().checked_add(increment as u32).ok_or(KernelError::InvalidArgument {
            name: "increment",
            value: "overflows address space",
        })?;
        let new_brk = VirtAddr::new(new_raw.div_ceil(layout::PAGE_SIZE) * layout::PAGE_SIZE);
        let mut page = old.raw().div_ceil(layout::PAGE_SIZE) * layout::PAGE_SIZE;
        while page < new_brk.raw() {
            let frame = frame_allocator::get_page()?;
            page_table::map_page(frame.phys(), VirtAddr::new(page), true, true, false)?;
            page += layout::PAGE_SIZE;
        }
        *brk = new_brk;
        Ok(new_brk)
    }

    /// Scan the MMIO band for a contiguous run of unmapped pages of the
    /// required length and map it supervisor read-write.
    pub fn map_memio(&self, phys_base: crate::platform::PhysAddr, size: u32) -> KernelResult<VirtAddr> {
        let pages_needed = size.div_ceil(layout::PAGE_SIZE);
        let mut base = layout::MMIO_BASE.raw();
        'search: while base + pages_needed * layout::PAGE_SIZE <= layout::MMIO_END.raw() {
            for i in 0..pages_needed {
                if page_table::validate_buffer(VirtAddr::new(base + i * layout::PAGE_SIZE), 1, false).is_ok() {
                    base += layout::PAGE_SIZE;
                    continue 'search;
                }
            }
            for i in 0..pages_needed {
                page_table::map_page(
                    phys_base.offset(i * layout::PAGE_SIZE),
                    VirtAddr::new(base + i * layout::PAGE_SIZE),
                    true,
                    false,
                    true,
                )?;
            }
            return Ok(VirtAddr::new(base));
        }
        Err(KernelError::OutOfMemory { requested: size as usize, available: 0 })
    }

    /// Scan the sorted stack-allocator list for the first gap of at least
    /// `K + 2G` pages and insert a new allocator `K` pages wide with `G`
    /// page separators on each side.
    pub fn reserve_task_stack(&self, task_id: u32, pid: u32) -> KernelResult<VirtAddr> {
        let k = layout::TASK_STACK_PAGES;
        let g = layout::STACK_GAP_PAGES;
        let mut stacks = self.stacks.lock();

        let mut candidate_top = layout::KSTACK_BAND_END.raw() - g * layout::PAGE_SIZE;
        let mut insert_at = stacks.len();
        for (i, existing) in stacks.iter().enumerate() {
            let gap_needed = g * layout::PAGE_SIZE;
            if candidate_top >= existing.highest_page.raw() + gap_needed + k * layout::PAGE_SIZE {
                insert_at = i;
                break;
            }
            candidate_top = existing.lowest_page.raw() - gap_needed;
        }
        if candidate_top < layout::KSTACK_BAND_BASE.raw() + k * layout::PAGE_SIZE {
            return Err(KernelError::OutOfMemory { requested: (k * layout::PAGE_SIZE) as usize, available: 0 });
        }

        let highest = VirtAddr::new(candidate_top);
        let lowest = VirtAddr::new(candidate_top - (k - 1) * layout::PAGE_SIZE);
        for i in 0..k {
            let virt = VirtAddr::new(lowest.raw() + i * layout::PAGE_SIZE);
            let frame = frame_allocator::get_page()?;
            page_table::map_page(frame.phys(), virt, true, false, false)?;
        }
        stacks.insert(
            insert_at,
            StackAllocator { task_id, pid, lowest_page: lowest, highest_page: highest, valid: true },
        );
        Ok(highest)
    }

    /// Remove the allocator from the list, then unmap every page and free
    /// the underlying frames.
    pub fn release_task_stack(&self, task_id: u32) -> KernelResult<()> {
        let removed = {
            let mut stacks = self.stacks.lock();
            let idx = stacks
                .iter()
                .position(|a| a.task_id == task_id)
                .ok_or(KernelError::NotFound { resource: "stack allocator", id: task_id as u64 })?;
            stacks.remove(idx)
        };
        let mut addr = removed.lowest_page.raw();
        while addr <= removed.highest_page.raw() {
            page_table::unmap_page(VirtAddr::new(addr))?;
            addr += layout::PAGE_SIZE;
        }
        Ok(())
    }

    /// Snapshot of the current stack-allocator list, for tests and for
    /// `clone` below.
    pub fn stack_ranges(&self) -> Vec<(VirtAddr, VirtAddr)> {
        self.stacks.lock().iter().map(|a| (a.lowest_page, a.highest_page)).collect()
    }
}

/// Allocate a fresh PTD in the process slot, clone it from `src`, and copy
/// the caller's stack-allocator list into the new process's. Must be
/// called with interrupts enabled (the frame allocator and page-table
/// manager it drives both expect to run with interrupts on, per §4.4).
pub fn clone(src: &AddressSpace, new_pid: u32) -> KernelResult<AddressSpace> {
    let dst = AddressSpace::new(new_pid);
    let dst_frame = frame_allocator::get_page()?;
    let user_range = (layout::USER_AREA_START, *src.brk.lock());
    let stack_ranges = src.stack_ranges();
    page_table::clone_ptd(dst_frame.phys(), user_range, &stack_ranges)?;
    *dst.brk.lock() = *src.brk.lock();
    *dst.stacks.lock() = src
        .stacks
        .lock()
        .iter()
        .map(|s| StackAllocator { pid: new_pid, ..*s })
        .collect();
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_address_space_starts_at_user_area() {
        let space = AddressSpace::new(7);
        assert_eq!(*space.brk.lock(), layout::USER_AREA_START);
        assert!(space.stack_ranges().is_empty());
    }
}
