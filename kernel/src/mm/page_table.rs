//! Page-table manager (§4.2).
//!
//! Two-level 32-bit paging: a page-table directory (PTD) of 1024 entries,
//! each pointing at a page table of 1024 entries, each mapping one 4 KiB
//! frame. The last PTD slot is a recursive self-map (§3), so once paging is
//! enabled every PTD and page table in the system is reachable at a fixed
//! virtual window (`layout::RECURSIVE_PT_BASE`) without a separate
//! physical-to-virtual translation step.

use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator;
use crate::mm::layout::{self, PTD_ENTRIES};
use crate::platform::{self, FrameIndex, PhysAddr, VirtAddr};

const PTE_PRESENT: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_US: u32 = 1 << 2;
const PTE_PCD: u32 = 1 << 4;
const PTE_ADDR_MASK: u32 = 0xFFFF_F000;

/// One 32-bit page-table entry: `{present, rw, us, pcd, page_base[20]}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const EMPTY: Self = Self(0);

    pub fn new(frame: FrameIndex, rw: bool, us: bool, pcd: bool) -> Self {
        let mut bits = frame.phys().raw() & PTE_ADDR_MASK;
        bits |= PTE_PRESENT;
        if rw {
            bits |= PTE_RW;
        }
        if us {
            bits |= PTE_US;
        }
        if pcd {
            bits |= PTE_PCD;
        }
        Self(bits)
    }

    pub fn present(self) -> bool {
        self.0 & PTE_PRESENT != 0
    }

    pub fn writable(self) -> bool {
        self.0 & PTE_RW != 0
    }

    pub fn user(self) -> bool {
        self.0 & PTE_US != 0
    }

    pub fn frame(self) -> FrameIndex {
        PhysAddr::new(self.0 & PTE_ADDR_MASK).frame_index()
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; PTD_ENTRIES],
}

impl PageTable {
    pub fn zero(&mut self) {
        for e in self.entries.iter_mut() {
            *e = PageTableEntry::EMPTY;
        }
    }
}

/// Access the currently active PTD through the recursive window.
///
/// # Safety
/// Paging must already be enabled and the recursive slot correctly
/// installed; the caller must not alias this reference across a CR3 switch.
unsafe fn current_ptd() -> &'static mut PageTable {
    // SAFETY: caller contract above; RECURSIVE_PTD_ADDR is always mapped by
    // construction of every PTD this module creates.
    unsafe { &mut *(layout::RECURSIVE_PTD_ADDR.as_mut_ptr()) }
}

/// Access the page table for a given PTD index through the recursive
/// window. Only valid once `current_ptd().entries[ptd_index]` is present.
///
/// # Safety
/// See [`current_ptd`].
unsafe fn pt_at(ptd_index: usize) -> &'static mut PageTable {
    // SAFETY: caller contract above.
    unsafe { &mut *(layout::recursive_pt_vaddr(ptd_index).as_mut_ptr()) }
}

/// Ensure the page table covering `virt`'s 4 MiB region exists, allocating
/// and zeroing a fresh frame for it if necessary, then write the PTE for
/// `virt` itself.
pub fn map_page(phys: PhysAddr, virt: VirtAddr, rw: bool, us: bool, pcd: bool) -> KernelResult<()> {
    let ptd_index = virt.ptd_index();
    let pt_index = virt.pt_index();

    // SAFETY: paging is enabled for the lifetime of this function by
    // kernel invariant; see module docs.
    let ptd = unsafe { current_ptd() };
    if !ptd.entries[ptd_index].present() {
        let frame = frame_allocator::get_page()?;
        ptd.entries[ptd_index] = PageTableEntry::new(frame, true, us, false);
        platform::invlpg(layout::recursive_pt_vaddr(ptd_index));
        // SAFETY: the PTD entry above was just installed, so the
        // recursive window for this index is now valid.
        unsafe { pt_at(ptd_index) }.zero();
    }

    // SAFETY: the PTD entry for `ptd_index` is present, either because it
    // already was or because the block above just installed it.
    let pt = unsafe { pt_at(ptd_index) };
    pt.entries[pt_index] = PageTableEntry::new(phys.frame_index(), rw, us, pcd);
    platform::invlpg(virt);
    Ok(())
}

/// Clear the PTE for `virt`, invalidate the TLB entry, and free the
/// underlying frame.
pub fn unmap_page(virt: VirtAddr) -> KernelResult<()> {
    let ptd_index = virt.ptd_index();
    let pt_index = virt.pt_index();
    // SAFETY: see module docs.
    let ptd = unsafe { current_ptd() };
    if !ptd.entries[ptd_index].present() {
        return Err(KernelError::InvalidAddress { addr: virt.raw() });
    }
    // SAFETY: the PTD entry was just confirmed present.
    let pt = unsafe { pt_at(ptd_index) };
    let pte = pt.entries[pt_index];
    if !pte.present() {
        return Err(KernelError::InvalidAddress { addr: virt.raw() });
    }
    let frame = pte.frame();
    pt.entries[pt_index] = PageTableEntry::EMPTY;
    platform::invlpg(virt);
    frame_allocator::put_page(frame);
    Ok(())
}

/// Find the first free slot in the transient-mapping band, map `phys`
/// there as supervisor read-write, and return the virtual address.
pub fn attach_page(phys: PhysAddr) -> KernelResult<VirtAddr> {
    let mut addr = layout::TRANSIENT_BAND_BASE.raw();
    // SAFETY: see module docs.
    let ptd = unsafe { current_ptd() };
    while addr < layout::TRANSIENT_BAND_END.raw() {
        let v = VirtAddr::new(addr);
        let free = if ptd.entries[v.ptd_index()].present() {
            // SAFETY: just confirmed present.
            !unsafe { pt_at(v.ptd_index()) }.entries[v.pt_index()].present()
        } else {
            true
        };
        if free {
            map_page(phys, v, true, false, false)?;
            return Ok(v);
        }
        addr += layout::PAGE_SIZE;
    }
    Err(KernelError::OutOfMemory {
        requested: layout::PAGE_SIZE as usize,
        available: 0,
    })
}

/// Undo [`attach_page`] without freeing the underlying frame, since a
/// transient mapping never owns it.
pub fn detach_page(virt: VirtAddr) {
    let ptd_index = virt.ptd_index();
    let pt_index = virt.pt_index();
    // SAFETY: see module docs; `virt` must be a value previously returned
    // by `attach_page`.
    let pt = unsafe { pt_at(ptd_index) };
    pt.entries[pt_index] = PageTableEntry::EMPTY;
    platform::invlpg(virt);
}

/// Classification produced by the page-fault handler's first pass, fed into
/// the policy table in §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    ReservedBit,
    InstructionFetch,
    UnmappedSupervisor,
    UnmappedUser,
    StalePermitted,
    PermissionDenied { supervisor: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    Fatal,
    DeliverSegv,
    InvalidateAndReturn,
}

pub fn classify_fault(class: FaultClass) -> FaultDisposition {
    match class {
        FaultClass::ReservedBit => FaultDisposition::Fatal,
        FaultClass::InstructionFetch => FaultDisposition::DeliverSegv,
        FaultClass::UnmappedSupervisor => FaultDisposition::Fatal,
        FaultClass::UnmappedUser => FaultDisposition::DeliverSegv,
        FaultClass::StalePermitted => FaultDisposition::InvalidateAndReturn,
        FaultClass::PermissionDenied { supervisor } => {
            if supervisor {
                FaultDisposition::Fatal
            } else {
                FaultDisposition::DeliverSegv
            }
        }
    }
}

const ERR_PRESENT: u32 = 1 << 0;
const ERR_WRITE: u32 = 1 << 1;
const ERR_USER: u32 = 1 << 2;
const ERR_RESERVED: u32 = 1 << 3;
const ERR_INSTRUCTION_FETCH: u32 = 1 << 4;

/// Turn a raw `#PF` error code plus the faulting address into a
/// [`FaultClass`], consulting the live PTE to distinguish a stale TLB entry
/// (already fixed up by a concurrent writer) from a real violation.
pub fn classify_page_fault(addr: VirtAddr, error_code: u32, from_user: bool) -> FaultClass {
    if error_code & ERR_RESERVED != 0 {
        return FaultClass::ReservedBit;
    }
    if error_code & ERR_INSTRUCTION_FETCH != 0 {
        return FaultClass::InstructionFetch;
    }

    let pte = read_pte(addr);
    let not_present = error_code & ERR_PRESENT == 0;
    if not_present {
        return if from_user { FaultClass::UnmappedUser } else { FaultClass::UnmappedSupervisor };
    }

    // Present in the error code but the live PTE now allows the access
    // (another CPU already fixed it up via copy-on-write or similar):
    // invalidate and retry rather than treating it as a real violation.
    if let Some(pte) = pte {
        let wants_write = error_code & ERR_WRITE != 0;
        let permitted = pte.present() && (!wants_write || pte.writable()) && (!from_user || pte.user());
        if permitted {
            return FaultClass::StalePermitted;
        }
    }

    FaultClass::PermissionDenied { supervisor: !(error_code & ERR_USER != 0) }
}

/// Clone a PTD for `fork`: the shared common-area entries are copied
/// verbatim (they point at page tables shared with every process); entries
/// above the common area get a fresh page table with only the pages inside
/// `user_range` and `stack_range` actually duplicated (copy, not
/// copy-on-write, matching §4.4's `clone_ptd` contract).
pub fn clone_ptd(
    dst_phys: PhysAddr,
    user_range: (VirtAddr, VirtAddr),
    stack_ranges: &[(VirtAddr, VirtAddr)],
) -> KernelResult<()> {
    // SAFETY: see module docs.
    let src = unsafe { current_ptd() };
    let dst_frame = dst_phys.frame_index();
    let dst_virt = attach_page(dst_phys)?;
    // SAFETY: `dst_virt` was just mapped by `attach_page` above.
    let dst = unsafe { &mut *dst_virt.as_mut_ptr::<PageTable>() };
    dst.zero();

    for i in 0..layout::COMMON_AREA_ENTRIES {
        dst.entries[i] = src.entries[i];
    }
    dst.entries[layout::RECURSIVE_SLOT] = PageTableEntry::new(dst_frame, true, false, false);

    let mut ranges = alloc::vec![user_range];
    ranges.extend_from_slice(stack_ranges);
    for range in ranges {
        let (lo, hi) = range;
        let mut addr = lo.raw();
        while addr < hi.raw() {
            let v = VirtAddr::new(addr);
            if let Some(src_pte) = read_pte(v) {
                if src_pte.present() {
                    let new_frame = frame_allocator::get_page()?;
                    copy_frame(src_pte.frame(), new_frame)?;
                    write_pte_into(dst, v, PageTableEntry::new(new_frame, src_pte.writable(), src_pte.user(), false))?;
                }
            }
            addr += layout::PAGE_SIZE;
        }
    }
    Ok(())
}

fn read_pte(virt: VirtAddr) -> Option<PageTableEntry> {
    // SAFETY: see module docs.
    let ptd = unsafe { current_ptd() };
    if !ptd.entries[virt.ptd_index()].present() {
        return None;
    }
    // SAFETY: just confirmed present.
    Some(unsafe { pt_at(virt.ptd_index()) }.entries[virt.pt_index()])
}

fn write_pte_into(dst: &mut PageTable, virt: VirtAddr, pte: PageTableEntry) -> KernelResult<()> {
    let ptd_index = virt.ptd_index();
    if !dst.entries[ptd_index].present() {
        let frame = frame_allocator::get_page()?;
        dst.entries[ptd_index] = PageTableEntry::new(frame, true, false, false);
        let pt_virt = attach_page(frame.phys())?;
        // SAFETY: freshly mapped above.
        unsafe { &mut *pt_virt.as_mut_ptr::<PageTable>() }.zero();
        detach_page(pt_virt);
    }
    let frame = dst.entries[ptd_index].frame();
    let pt_virt = attach_page(frame.phys())?;
    // SAFETY: freshly mapped above.
    unsafe { &mut *pt_virt.as_mut_ptr::<PageTable>() }.entries[virt.pt_index()] = pte;
    detach_page(pt_virt);
    Ok(())
}

fn copy_frame(src: FrameIndex, dst: FrameIndex) -> KernelResult<()> {
    let src_virt = attach_page(src.phys())?;
    let dst_virt = attach_page(dst.phys())?;
    // SAFETY: both addresses were just mapped above and are exactly
    // PAGE_SIZE apart from any alias, since `attach_page` never reuses a
    // slot while its mapping is live.
    unsafe {
        core::ptr::copy_nonoverlapping(
            src_virt.as_ptr::<u8>(),
            dst_virt.as_mut_ptr::<u8>(),
            layout::PAGE_SIZE as usize,
        );
    }
    detach_page(src_virt);
    detach_page(dst_virt);
    Ok(())
}

/// Validate `[ptr, ptr+len)` (or, for `len == 0`, a NUL-terminated string)
/// against the current PTD: every touched page must be present and match
/// the requested access (§4.2, §4.12).
pub fn validate_buffer(ptr: VirtAddr, len: usize, require_write: bool) -> KernelResult<()> {
    let start = ptr.raw();
    if len == 0 {
        // `len == 0` means "walk a NUL-terminated string": confirm each
        // page is mapped+user as the scan crosses it, until a NUL byte is
        // found or a hard cap is hit (wrap-around protection).
        const MAX_STRING: u32 = 64 * 1024;
        let mut offset = 0u32;
        let mut last_checked_page = u32::MAX;
        loop {
            let addr = start.wrapping_add(offset);
            if offset >= MAX_STRING || addr < start {
                return Err(KernelError::InvalidAddress { addr: start });
            }
            let page = addr & !(layout::PAGE_SIZE - 1);
            if page != last_checked_page {
                let pte = read_pte(VirtAddr::new(page)).ok_or(KernelError::InvalidAddress { addr: page })?;
                if !pte.present() || !pte.user() {
                    return Err(KernelError::AccessDenied { addr: page });
                }
                last_checked_page = page;
            }
            // SAFETY: the page containing `addr` was just confirmed
            // present, user-accessible, and this is a read-only probe.
            let byte = unsafe { core::ptr::read_volatile(addr as *const u8) };
            if byte == 0 {
                return Ok(());
            }
            offset += 1;
        }
    }
    let end = start.checked_add(len as u32).ok_or(KernelError::InvalidAddress { addr: start })?;
    if end < start {
        return Err(KernelError::InvalidAddress { addr: start });
    }
    let mut page = start & !(layout::PAGE_SIZE - 1);
    while page < end {
        let pte = read_pte(VirtAddr::new(page)).ok_or(KernelError::InvalidAddress { addr: page })?;
        if !pte.present() || !pte.user() || (require_write && !pte.writable()) {
            return Err(KernelError::AccessDenied { addr: page });
        }
        page += layout::PAGE_SIZE;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_roundtrip_is_bijective() {
        let frame = FrameIndex::from_raw(0x123);
        let pte = PageTableEntry::new(frame, true, true, false);
        assert_eq!(pte.frame(), frame);
        assert!(pte.present());
        assert!(pte.writable());
        assert!(pte.user());
    }

    #[test]
    fn fault_classification_matches_policy_table() {
        assert_eq!(classify_fault(FaultClass::ReservedBit), FaultDisposition::Fatal);
        assert_eq!(classify_fault(FaultClass::InstructionFetch), FaultDisposition::DeliverSegv);
        assert_eq!(classify_fault(FaultClass::UnmappedSupervisor), FaultDisposition::Fatal);
        assert_eq!(classify_fault(FaultClass::UnmappedUser), FaultDisposition::DeliverSegv);
        assert_eq!(classify_fault(FaultClass::StalePermitted), FaultDisposition::InvalidateAndReturn);
        assert_eq!(
            classify_fault(FaultClass::PermissionDenied { supervisor: true }),
            FaultDisposition::Fatal
        );
        assert_eq!(
            classify_fault(FaultClass::PermissionDenied { supervisor: false }),
            FaultDisposition::DeliverSegv
        );
    }
}
