//! RAM disk (§4.11): a block device backed by the physical window the
//! bootloader handed off (e.g. a multiboot module), mapped once into
//! [`crate::mm::layout::RAMDISK_WINDOW_BASE`].

use crate::error::{KernelError, KernelResult};
use crate::mm::{layout, page_table};
use crate::platform::{PhysAddr, VirtAddr};
use crate::sync::GlobalState;

use super::{BlkDevOps, CloseFn, OpenFn, ReadFn, WriteFn};

pub const BLOCK_SIZE: u32 = 512;
const MINOR: u32 = 0;

#[derive(Clone, Copy)]
struct Window {
    virt_base: VirtAddr,
    size_bytes: u32,
}

static WINDOW: GlobalState<Window> = GlobalState::new();

/// Map the image at `phys_base` (`size_bytes` long) into the RAM-disk
/// window. Called once at boot, before [`super::init`].
pub fn set_window(phys_base: PhysAddr, size_bytes: u32) -> KernelResult<()> {
    let pages = size_bytes.div_ceil(layout::PAGE_SIZE);
    if layout::RAMDISK_WINDOW_BASE.raw() + pages * layout::PAGE_SIZE > layout::RAMDISK_WINDOW_END.raw() {
        return Err(KernelError::OutOfMemory { requested: size_bytes as usize, available: 0 });
    }
    for i in 0..pages {
        let virt = VirtAddr::new(layout::RAMDISK_WINDOW_BASE.raw() + i * layout::PAGE_SIZE);
        let phys = PhysAddr::new(phys_base.raw() + i * layout::PAGE_SIZE);
        page_table::map_page(phys, virt, true, false, false)?;
    }
    WINDOW
        .init(Window { virt_base: layout::RAMDISK_WINDOW_BASE, size_bytes })
        .map_err(|_| KernelError::AlreadyRegistered { resource: "ramdisk window", id: 0 })
}

pub fn init() -> KernelResult<()> {
    Ok(())
}

fn open(minor: u32) -> KernelResult<()> {
    if minor != MINOR {
        return Err(KernelError::NoDevice { major: 0, minor });
    }
    Ok(())
}

fn close(_minor: u32) -> KernelResult<()> {
    Ok(())
}

fn read(minor: u32, blocks: u32, lba: u64, buf: &mut [u8]) -> KernelResult<usize> {
    if minor != MINOR {
        return Err(KernelError::NoDevice { major: 0, minor });
    }
    let window = WINDOW.with(|w| *w).ok_or(KernelError::NotInitialized { subsystem: "ramdisk" })?;

    let byte_offset = lba
        .checked_mul(BLOCK_SIZE as u64)
        .ok_or(KernelError::InvalidArgument { name: "lba", value: "overflows byte offset" })?;
    let len = blocks as u64 * BLOCK_SIZE as u64;
    if byte_offset + len > window.size_bytes as u64 {
        return Err(KernelError::InvalidAddress { addr: (byte_offset + len) as u32 });
    }
    let len = len as usize;
    let src = unsafe { core::slice::from_raw_parts((window.virt_base.raw() + byte_offset as u32) as *const u8, len) };
    buf[..len].copy_from_slice(src);
    Ok(len)
}

fn write(minor: u32, blocks: u32, lba: u64, buf: &[u8]) -> KernelResult<usize> {
    if minor != MINOR {
        return Err(KernelError::NoDevice { major: 0, minor });
    }
    let window = WINDOW.with(|w| *w).ok_or(KernelError::NotInitialized { subsystem: "ramdisk" })?;

    let byte_offset = lba
        .checked_mul(BLOCK_SIZE as u64)
        .ok_or(KernelError::InvalidArgument { name: "lba", value: "overflows byte offset" })?;
    let len = blocks as u64 * BLOCK_SIZE as u64;
    if byte_offset + len > window.size_bytes as u64 {
        return Err(KernelError::InvalidAddress { addr: (byte_offset + len) as u32 });
    }
    let len = len as usize;
    let dst = unsafe { core::slice::from_raw_parts_mut((window.virt_base.raw() + byte_offset as u32) as *mut u8, len) };
    dst.copy_from_slice(&buf[..len]);
    Ok(len)
}

pub const OPS: BlkDevOps = BlkDevOps { open: open as OpenFn, close: close as CloseFn, read: read as ReadFn, write: write as WriteFn };

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_rejects_non_zero_minor() {
        let mut buf = [0u8; 4];
        assert!(matches!(read(1, 1, 0, &mut buf), Err(KernelError::NoDevice { .. })));
    }
}
