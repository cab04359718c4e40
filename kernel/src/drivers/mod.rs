//! Driver manager (§4.10) and the bus/device drivers it fronts.

pub mod pci;
pub mod ramdisk;

use crate::error::{KernelError, KernelResult};
use crate::sync::{GlobalState, IrqSpinlock};

pub type OpenFn = fn(minor: u32) -> KernelResult<()>;
pub type CloseFn = fn(minor: u32) -> KernelResult<()>;
pub type ReadFn = fn(minor: u32, blocks: u32, lba: u64, buf: &mut [u8]) -> KernelResult<usize>;
pub type WriteFn = fn(minor: u32, blocks: u32, lba: u64, buf: &[u8]) -> KernelResult<usize>;

/// `blk_dev_ops = {open, close, read, write}` (§4.10).
#[derive(Debug, Clone, Copy)]
pub struct BlkDevOps {
    pub open: OpenFn,
    pub close: CloseFn,
    pub read: ReadFn,
    pub write: WriteFn,
}

pub type CharReadFn = fn(minor: u32, buf: &mut [u8]) -> KernelResult<usize>;
pub type CharWriteFn = fn(minor: u32, buf: &[u8]) -> KernelResult<usize>;

#[derive(Debug, Clone, Copy)]
pub struct CharDevOps {
    pub open: OpenFn,
    pub close: CloseFn,
    pub read: CharReadFn,
    pub write: CharWriteFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    None,
    Blk,
    Char,
}

#[derive(Clone, Copy)]
enum Ops {
    Blk(BlkDevOps),
    Char(CharDevOps),
}

struct Slot {
    kind: SlotKind,
    ops: Option<Ops>,
}

const MAX_MAJOR: usize = 64;

struct Table {
    slots: [Slot; MAX_MAJOR],
}

static TABLE: GlobalState<IrqSpinlock<Table>> = GlobalState::new();

/// `ramdisk_module` is the Multiboot2 module tag's `(phys_base, size)`, if
/// the loader was handed one (§4.11) — mapped into the RAM-disk window
/// before the block device is registered, so `read`/`write` against major
/// 0 serve real blocks instead of failing `NotInitialized`.
pub fn init(ramdisk_module: Option<(crate::platform::PhysAddr, u32)>) -> KernelResult<()> {
    let slots = core::array::from_fn(|_| Slot { kind: SlotKind::None, ops: None });
    TABLE.init(IrqSpinlock::new(Table { slots })).map_err(|_| KernelError::AlreadyRegistered { resource: "driver manager", id: 0 })?;
    pci::enumerate()?;
    ramdisk::init()?;
    if let Some((phys_base, size_bytes)) = ramdisk_module {
        ramdisk::set_window(phys_base, size_bytes)?;
    }
    register_blk_dev(0, ramdisk::OPS)?;
    Ok(())
}

fn check_major(major: u32) -> KernelResult<usize> {
    if major as usize >= MAX_MAJOR {
        return Err(KernelError::InvalidArgument { name: "major", value: "exceeds MAX_MAJOR" });
    }
    Ok(major as usize)
}

pub fn register_blk_dev(major: u32, ops: BlkDevOps) -> KernelResult<()> {
    let idx = check_major(major)?;
    TABLE
        .with_mut(|lock| {
            let mut table = lock.lock();
            if table.slots[idx].kind != SlotKind::None {
                return Err(KernelError::AlreadyRegistered { resource: "block major", id: major as u64 });
            }
            table.slots[idx] = Slot { kind: SlotKind::Blk, ops: Some(Ops::Blk(ops)) };
            Ok(())
        })
        .unwrap_or(Err(KernelError::NotInitialized { subsystem: "driver manager" }))
}

pub fn register_char_dev(major: u32, ops: CharDevOps) -> KernelResult<()> {
    let idx = check_major(major)?;
    TABLE
        .with_mut(|lock| {
            let mut table = lock.lock();
            if table.slots[idx].kind != SlotKind::None {
                return Err(KernelError::AlreadyRegistered { resource: "char major", id: major as u64 });
            }
            table.slots[idx] = Slot { kind: SlotKind::Char, ops: Some(Ops::Char(ops)) };
            Ok(())
        })
        .unwrap_or(Err(KernelError::NotInitialized { subsystem: "driver manager" }))
}

pub fn get_blk_dev_ops(major: u32) -> Option<BlkDevOps> {
    let idx = check_major(major).ok()?;
    TABLE
        .with(|lock| match lock.lock().slots[idx].ops {
            Some(Ops::Blk(ops)) => Some(ops),
            _ => None,
        })
        .flatten()
}

pub fn get_char_dev_ops(major: u32) -> Option<CharDevOps> {
    let idx = check_major(major).ok()?;
    TABLE
        .with(|lock| match lock.lock().slots[idx].ops {
            Some(Ops::Char(ops)) => Some(ops),
            _ => None,
        })
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_major_rejects_out_of_range() {
        assert!(check_major(MAX_MAJOR as u32).is_err());
        assert!(check_major(0).is_ok());
    }
}
