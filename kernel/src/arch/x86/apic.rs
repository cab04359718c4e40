//! Local APIC and I/O APIC driver (§4.7).
//!
//! The Local APIC MMIO page and each I/O APIC's MMIO page are mapped once,
//! at boot, through [`crate::mm::vas::AddressSpace::map_memio`] — the same
//! path any other MMIO consumer uses to claim a run out of the shared
//! common area — rather than a hand-picked fixed slot, so the virtual
//! addresses are discovered at [`map_all`] time and cached here.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::mm::layout;
use crate::platform::{self, ApicId, PhysAddr, Vector, VirtAddr};
use crate::sync::IrqSpinlock;

const IA32_APIC_BASE_MSR: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;

const LAPIC_PHYS: u32 = 0xFEE0_0000;

/// Virtual address [`map_all`] mapped the Local APIC's page to. Zero until
/// then; every accessor below runs after boot stage 4, so that's never
/// observed.
static LAPIC_VIRT: AtomicU32 = AtomicU32::new(0);

const LAPIC_ID: u32 = 0x020;
const LAPIC_VERSION: u32 = 0x030;
const LAPIC_TPR: u32 = 0x080;
const LAPIC_EOI: u32 = 0x0B0;
const LAPIC_LDR: u32 = 0x0D0;
const LAPIC_DFR: u32 = 0x0E0;
const LAPIC_SVR: u32 = 0x0F0;
const LAPIC_ICR_LOW: u32 = 0x300;
const LAPIC_ICR_HIGH: u32 = 0x310;
const LAPIC_LVT_TIMER: u32 = 0x320;
const LAPIC_LVT_LINT0: u32 = 0x350;
const LAPIC_LVT_LINT1: u32 = 0x360;
const LAPIC_LVT_ERROR: u32 = 0x370;
const LAPIC_TIMER_INIT_COUNT: u32 = 0x380;
const LAPIC_TIMER_CUR_COUNT: u32 = 0x390;
const LAPIC_TIMER_DIV: u32 = 0x3E0;

const LVT_MASKED: u32 = 1 << 16;
const SVR_SOFTWARE_ENABLE: u32 = 1 << 8;
const SPURIOUS_VECTOR: u8 = 0xFF;
const TIMER_ONE_SHOT: u32 = 0b00 << 17;
const TIMER_PERIODIC: u32 = 0b01 << 17;
const TIMER_DIVIDE_128: u32 = 0b1010;

const ICR_DELIVERY_STATUS: u32 = 1 << 12;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_TRIGGER_LEVEL: u32 = 1 << 15;

/// Maximum number of I/O APICs the config-table parser can hand us; one
/// page each, contiguous after the Local APIC's page in the MMIO window.
const MAX_IOAPICS: usize = 4;

const IOREGSEL: u32 = 0x00;
const IOWIN: u32 = 0x10;
const IOAPIC_REG_VER: u32 = 0x01;
const IOAPIC_REDTBL_BASE: u32 = 0x10;

/// `send_ipi` delivery kinds (§4.7 "IPIs").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiKind {
    Init { assert: bool },
    Startup { vector: u8 },
    Fixed { vector: Vector },
    Nmi,
}

/// `add_redir_entry` modes (§4.7 "I/O APIC").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    PhysicalToBsp,
    LogicalFixed,
    LogicalLowestPriority,
}

fn lapic_read(offset: u32) -> u32 {
    unsafe { platform::mmio_read32(VirtAddr::new(LAPIC_VIRT.load(Ordering::Relaxed) + offset)) }
}

fn lapic_write(offset: u32, value: u32) {
    unsafe { platform::mmio_write32(VirtAddr::new(LAPIC_VIRT.load(Ordering::Relaxed) + offset), value) };
}

fn ioapic_read(base: VirtAddr, reg: u32) -> u32 {
    unsafe {
        platform::mmio_write32(VirtAddr::new(base.raw() + IOREGSEL), reg);
        platform::mmio_read32(VirtAddr::new(base.raw() + IOWIN))
    }
}

fn ioapic_write(base: VirtAddr, reg: u32, value: u32) {
    unsafe {
        platform::mmio_write32(VirtAddr::new(base.raw() + IOREGSEL), reg);
        platform::mmio_write32(VirtAddr::new(base.raw() + IOWIN), value);
    }
}

struct IoApicInfo {
    phys: PhysAddr,
    virt: VirtAddr,
    gsi_base: u32,
}

struct ApicState {
    io_apics: [Option<IoApicInfo>; MAX_IOAPICS],
    io_apic_count: usize,
}

static STATE: IrqSpinlock<ApicState> = IrqSpinlock::new(ApicState { io_apics: [None, None, None, None], io_apic_count: 0 });
static TICKS_PER_SECOND: AtomicU32 = AtomicU32::new(0);
static TIMER_VECTOR: AtomicU8 = AtomicU8::new(0);

/// Map the Local APIC and every I/O APIC named by the config tables into
/// the common area via [`crate::syscall::with_current_address_space`]'s
/// [`crate::mm::vas::AddressSpace::map_memio`]. Must run once, on the BSP,
/// before [`init_local`].
pub fn map_all() -> KernelResult<()> {
    let lapic_virt =
        crate::syscall::with_current_address_space(|space| space.map_memio(PhysAddr::new(LAPIC_PHYS), layout::PAGE_SIZE))??;
    LAPIC_VIRT.store(lapic_virt.raw(), Ordering::Relaxed);

    crate::config::with(|tables| {
        let mut state = STATE.lock();
        for (i, ioapic) in tables.ioapics.iter().take(MAX_IOAPICS).enumerate() {
            let virt = crate::syscall::with_current_address_space(|space| space.map_memio(ioapic.phys_base, layout::PAGE_SIZE))??;
            state.io_apics[i] = Some(IoApicInfo { phys: ioapic.phys_base, virt, gsi_base: ioapic.gsi_base });
            state.io_apic_count = i + 1;
        }
        Ok(())
    })
    .unwrap_or(Ok(()))
}

/// Per-CPU Local APIC init, shared by BSP and APs (§4.7 "shared BSP/AP").
pub fn init_local(smp_cpu_id: u32) -> KernelResult<()> {
    let base_msr = unsafe { platform::rdmsr(IA32_APIC_BASE_MSR) };
    if base_msr & APIC_BASE_ENABLE == 0 {
        unsafe { platform::wrmsr(IA32_APIC_BASE_MSR, base_msr | APIC_BASE_ENABLE) };
    }

    lapic_write(LAPIC_LVT_TIMER, LVT_MASKED);
    lapic_write(LAPIC_LVT_LINT0, LVT_MASKED);
    lapic_write(LAPIC_LVT_LINT1, LVT_MASKED);
    lapic_write(LAPIC_LVT_ERROR, LVT_MASKED);

    lapic_write(LAPIC_TPR, 0);
    lapic_write(LAPIC_LDR, (1u32 << smp_cpu_id) << 24);
    lapic_write(LAPIC_DFR, 0xFFFF_FFFF); // flat model
    lapic_write(LAPIC_SVR, SVR_SOFTWARE_ENABLE | SPURIOUS_VECTOR as u32);
    Ok(())
}

pub fn local_apic_id() -> Option<ApicId> {
    Some(ApicId::from_raw(((lapic_read(LAPIC_ID) >> 24) & 0xFF) as u8))
}

pub fn eoi() {
    lapic_write(LAPIC_EOI, 0);
}

/// BSP-only timer calibration against `pit_ticks` global PIT ticks
/// (§4.7 "Timer calibration").
pub fn calibrate_timer(vector: Vector, pit_wait: impl FnOnce()) {
    lapic_write(LAPIC_TIMER_DIV, TIMER_DIVIDE_128);
    lapic_write(LAPIC_LVT_TIMER, LVT_MASKED | TIMER_ONE_SHOT | vector.raw() as u32);
    lapic_write(LAPIC_TIMER_INIT_COUNT, 0xFFFF_FFFF);

    pit_wait();

    let remaining = lapic_read(LAPIC_TIMER_CUR_COUNT);
    lapic_write(LAPIC_TIMER_INIT_COUNT, 0);
    let elapsed = 0xFFFF_FFFFu32.saturating_sub(remaining);
    TICKS_PER_SECOND.store(elapsed, Ordering::Relaxed);
    TIMER_VECTOR.store(vector.raw(), Ordering::Relaxed);

    lapic_write(LAPIC_TIMER_DIV, TIMER_DIVIDE_128);
    lapic_write(LAPIC_LVT_TIMER, TIMER_PERIODIC | vector.raw() as u32);
    lapic_write(LAPIC_TIMER_INIT_COUNT, elapsed);
}

fn find_ioapic_for_gsi(state: &ApicState, gsi: u32) -> Option<usize> {
    state
        .io_apics
        .iter()
        .enumerate()
        .filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
        .filter(|(_, e)| e.gsi_base <= gsi)
        .max_by_key(|(_, e)| e.gsi_base)
        .map(|(i, _)| i)
}

/// Write a redirection entry for `gsi` (§4.7 "I/O APIC"). `pin` is the
/// GSI-relative pin within the I/O APIC that owns it.
#[allow(clippy::too_many_arguments)]
pub fn add_redir_entry(
    gsi: u32,
    polarity_active_low: bool,
    trigger_level: bool,
    vector: Vector,
    mode: RouteMode,
    bsp_id: ApicId,
    cpu_count: u32,
) -> KernelResult<()> {
    let state = STATE.lock();
    let ioapic = find_ioapic_for_gsi(&state, gsi).ok_or(KernelError::NotFound { resource: "ioapic for gsi", id: gsi as u64 })?;
    let info = state.io_apics[ioapic].as_ref().unwrap();
    let pin = gsi - info.gsi_base;
    let base = info.virt;
    drop(state);

    let (delivery_mode, dest_mode_logical, dest) = match mode {
        RouteMode::PhysicalToBsp => (0b000u32, false, bsp_id.raw() as u32),
        RouteMode::LogicalFixed => {
            let logical_id = 1u32 << (vector.raw() as u32 % cpu_count.max(1));
            (0b000u32, true, logical_id)
        }
        RouteMode::LogicalLowestPriority => {
            let all_cpus = if cpu_count >= 32 { 0xFFu32 } else { (1u32 << cpu_count) - 1 };
            (0b001u32, true, all_cpus)
        }
    };

    let mut low = vector.raw() as u32;
    low |= delivery_mode << 8;
    low |= (dest_mode_logical as u32) << 11;
    low |= (polarity_active_low as u32) << 13;
    low |= (trigger_level as u32) << 15;
    let high = dest << 24;

    let reg = IOAPIC_REDTBL_BASE + pin * 2;
    ioapic_write(base, reg + 1, high);
    ioapic_write(base, reg, low | LVT_MASKED); // masked while programming
    ioapic_write(base, reg, low); // unmask
    Ok(())
}

pub fn mask_gsi(gsi: u32) -> KernelResult<()> {
    let state = STATE.lock();
    let ioapic = find_ioapic_for_gsi(&state, gsi).ok_or(KernelError::NotFound { resource: "ioapic for gsi", id: gsi as u64 })?;
    let info = state.io_apics[ioapic].as_ref().unwrap();
    let pin = gsi - info.gsi_base;
    let base = info.virt;
    drop(state);
    let reg = IOAPIC_REDTBL_BASE + pin * 2;
    let low = ioapic_read(base, reg);
    ioapic_write(base, reg, low | LVT_MASKED);
    Ok(())
}

/// Send an IPI and poll the delivery-status bit with a bounded spin
/// (§4.7 "IPIs").
pub fn send_ipi(dest: ApicId, kind: IpiKind) -> KernelResult<()> {
    lapic_write(LAPIC_ICR_HIGH, (dest.raw() as u32) << 24);

    let low = match kind {
        IpiKind::Init { assert: true } => (0b101u32 << 8) | ICR_TRIGGER_LEVEL | ICR_LEVEL_ASSERT,
        IpiKind::Init { assert: false } => (0b101u32 << 8) | ICR_TRIGGER_LEVEL,
        IpiKind::Startup { vector } => (0b110u32 << 8) | vector as u32,
        IpiKind::Fixed { vector } => vector.raw() as u32,
        IpiKind::Nmi => 0b100u32 << 8,
    };
    lapic_write(LAPIC_ICR_LOW, low);

    const MAX_SPINS: u32 = 1_000_000;
    for _ in 0..MAX_SPINS {
        if lapic_read(LAPIC_ICR_LOW) & ICR_DELIVERY_STATUS == 0 {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(KernelError::TimedOut { operation: "ipi delivery" })
}

pub fn max_redirection_entries(ioapic_index: usize) -> u8 {
    let base = STATE.lock().io_apics[ioapic_index].as_ref().map(|e| e.virt).unwrap_or(VirtAddr::new(0));
    (((ioapic_read(base, IOAPIC_REG_VER) >> 16) & 0xFF) + 1) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipi_init_assert_sets_level_and_assert_bits() {
        match (IpiKind::Init { assert: true }, IpiKind::Init { assert: false }) {
            (a, b) => assert_ne!(a, b),
        }
    }
}
