//! Syscall dispatcher (§4.12).
//!
//! A fixed table indexed by `eax`. Each adapter validates its pointer
//! arguments against the caller's page tables (when the caller is in user
//! mode), unpacks the rest from the interrupt context, calls the backend,
//! and stores a signed return value (negative = `-errno`) back into the
//! context. Out-of-range call numbers return `-ENOSYS`.
//!
//! Process/file-system/network backends live outside this repository
//! (§1); the handful of adapters below are the ones this core can satisfy
//! on its own — console I/O, the RAM disk, `brk`, and PM's minimal
//! boundary surface.

use crate::arch::x86::context::ExecContext;
use crate::error::{KernelError, KernelResult};
use crate::mm::page_table::validate_buffer;
use crate::mm::vas::AddressSpace;
use crate::platform::VirtAddr;
use crate::sync::{GlobalState, IrqSpinlock};
use crate::{drivers, pm};

pub const SYS_WRITE: u32 = 0;
pub const SYS_YIELD: u32 = 1;
pub const SYS_GETPID: u32 = 2;
pub const SYS_SBRK: u32 = 3;
pub const SYS_BLK_READ: u32 = 4;
pub const SYS_BLK_WRITE: u32 = 5;
pub const SYS_VERSION: u32 = 6;
pub const SYS_EXIT: u32 = 7;

const MAX_CONSOLE_WRITE: usize = 4096;

/// Placeholder for the single-process address space this boot sequence
/// runs until PM brings up real process tables. Adapters that need "the
/// current address space" (`brk`) use this rather than a real per-task
/// registry, which belongs to PM, not this core.
static CURRENT_ADDRESS_SPACE: GlobalState<IrqSpinlock<AddressSpace>> = GlobalState::new();

pub fn set_current_address_space(space: AddressSpace) -> KernelResult<()> {
    CURRENT_ADDRESS_SPACE
        .init(IrqSpinlock::new(space))
        .map_err(|_| KernelError::AlreadyRegistered { resource: "current address space", id: 0 })
}

/// Run `f` against the current address space. Used by subsystems that need
/// to claim a shared MMIO window (the Local/I-O APIC, §4.7) through
/// [`AddressSpace::map_memio`] rather than mapping pages directly.
pub fn with_current_address_space<T>(f: impl FnOnce(&AddressSpace) -> T) -> KernelResult<T> {
    CURRENT_ADDRESS_SPACE
        .with(|lock| f(&lock.lock()))
        .ok_or(KernelError::NotInitialized { subsystem: "current address space" })
}

/// Run the syscall named by `ctx.eax`, store its result, and report
/// whether PM asked for a restart (§2 step 4).
pub fn dispatch(ctx: &mut ExecContext) -> bool {
    let number = ctx.syscall_number();
    let args = ctx.syscall_args();
    let from_user = ctx.is_from_user_mode();

    let result = run(number, args, from_user);

    match result {
        Ok(value) => ctx.set_return_value(value as i32),
        Err(err) => {
            if err.is_fatal() {
                panic!("fatal error in syscall {number}: {err}");
            }
            let restartable = matches!(err, KernelError::Interrupted { restartable: true });
            ctx.set_return_value(err.to_errno());
            if restartable {
                pm::request_restart();
            }
        }
    }

    pm::deliver_signals()
}

fn run(number: u32, args: [u32; 5], from_user: bool) -> KernelResult<usize> {
    match number {
        SYS_WRITE => sys_write(args[0], VirtAddr::new(args[1]), args[2] as usize, from_user),
        SYS_YIELD => sys_yield(),
        SYS_GETPID => sys_getpid(),
        SYS_SBRK => sys_sbrk(args[0] as i32),
        SYS_BLK_READ => sys_blk_read(args[0], args[1], args[2] as u64, VirtAddr::new(args[3]), args[4] as usize, from_user),
        SYS_BLK_WRITE => sys_blk_write(args[0], args[1], args[2] as u64, VirtAddr::new(args[3]), args[4] as usize, from_user),
        SYS_VERSION => sys_version(VirtAddr::new(args[0]), from_user),
        SYS_EXIT => sys_exit(args[0] as i32),
        _ => Err(KernelError::NotSupported { operation: "unknown syscall number" }),
    }
}

fn sys_write(fd: u32, buf: VirtAddr, len: usize, from_user: bool) -> KernelResult<usize> {
    if len > MAX_CONSOLE_WRITE {
        return Err(KernelError::InvalidArgument { name: "len", value: "exceeds MAX_CONSOLE_WRITE" });
    }
    if from_user {
        validate_buffer(buf, len, false)?;
    }
    // SAFETY: `validate_buffer` confirmed every page in `[buf, buf+len)` is
    // present and user-readable when `from_user`; kernel-mode callers are
    // trusted the way every other in-kernel slice read is.
    let bytes = unsafe { core::slice::from_raw_parts(buf.as_ptr::<u8>(), len) };
    let text = core::str::from_utf8(bytes).unwrap_or("<invalid utf8>");
    match fd {
        1 | 2 => crate::print!("{text}"),
        _ => return Err(KernelError::NoDevice { major: fd, minor: 0 }),
    }
    Ok(len)
}

fn sys_yield() -> KernelResult<usize> {
    pm::request_reschedule();
    Ok(0)
}

fn sys_getpid() -> KernelResult<usize> {
    Ok(pm::current().pid as usize)
}

fn sys_sbrk(increment: i32) -> KernelResult<usize> {
    CURRENT_ADDRESS_SPACE
        .with(|lock| lock.lock().sbrk(increment).map(|addr| addr.raw() as usize))
        .unwrap_or(Err(KernelError::NotInitialized { subsystem: "current address space" }))
}

fn sys_blk_read(major: u32, lba_hi: u32, lba: u64, buf: VirtAddr, blocks: usize, from_user: bool) -> KernelResult<usize> {
    let _ = lba_hi;
    let ops = drivers::get_blk_dev_ops(major).ok_or(KernelError::NoDevice { major, minor: 0 })?;
    let len = blocks * drivers::ramdisk::BLOCK_SIZE as usize;
    if from_user {
        validate_buffer(buf, len, true)?;
    }
    // SAFETY: length validated above when the caller is user-mode; kernel
    // callers are trusted like any other in-kernel mutable slice.
    let dst = unsafe { core::slice::from_raw_parts_mut(buf.as_mut_ptr::<u8>(), len) };
    (ops.read)(0, blocks as u32, lba, dst)
}

fn sys_blk_write(major: u32, lba_hi: u32, lba: u64, buf: VirtAddr, blocks: usize, from_user: bool) -> KernelResult<usize> {
    let _ = lba_hi;
    let ops = drivers::get_blk_dev_ops(major).ok_or(KernelError::NoDevice { major, minor: 0 })?;
    let len = blocks * drivers::ramdisk::BLOCK_SIZE as usize;
    if from_user {
        validate_buffer(buf, len, false)?;
    }
    // SAFETY: length validated above when the caller is user-mode.
    let src = unsafe { core::slice::from_raw_parts(buf.as_ptr::<u8>(), len) };
    (ops.write)(0, blocks as u32, lba, src)
}

fn sys_version(out: VirtAddr, from_user: bool) -> KernelResult<usize> {
    let info = crate::utils::version::get_version_info();
    let len = core::mem::size_of_val(&info);
    if from_user {
        validate_buffer(out, len, true)?;
    }
    // SAFETY: length validated above when the caller is user-mode;
    // `KernelVersionInfo` is `repr(C)` and plain-old-data.
    unsafe {
        core::ptr::write_unaligned(out.as_mut_ptr(), info);
    }
    Ok(len)
}

fn sys_exit(code: i32) -> KernelResult<usize> {
    pm::run_exit_hooks();
    log::info!("task {:?} exited with code {code}", pm::current());
    pm::request_reschedule();
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscall_number_is_not_supported() {
        assert!(matches!(run(0xFFFF, [0; 5], false), Err(KernelError::NotSupported { .. })));
    }

    #[test]
    fn write_rejects_oversized_length() {
        assert!(matches!(
            sys_write(1, VirtAddr::new(0x1000), MAX_CONSOLE_WRITE + 1, false),
            Err(KernelError::InvalidArgument { .. })
        ));
    }
}
