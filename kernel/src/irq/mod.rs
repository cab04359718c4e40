//! IRQ manager (§4.9).
//!
//! Owns the vector space, the per-vector ordered handler chains, and the
//! top-half dispatch that every interrupt/exception/syscall entry stub
//! calls into.

extern crate alloc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch::x86::apic;
use crate::arch::x86::context::ExecContext;
use crate::config;
use crate::error::{KernelError, KernelResult};
use crate::pm::{self, ExecLevel};
use crate::sync::{GlobalState, IrqSpinlock};

/// §4.9 "Vector space".
pub const EXCEPTION_BASE: u8 = 0x00;
pub const EXCEPTION_END: u8 = 0x1F;
pub const PIC_RESERVED_BASE: u8 = 0x20;
pub const PIC_RESERVED_END: u8 = 0x2F;
pub const HW_BAND_BASE: u8 = 0x30;
pub const HW_BAND_END: u8 = 0x7F;
pub const HW_BAND_COUNT: u8 = 5;
pub const HW_BAND_WIDTH: u8 = 16;
pub const SYSCALL_VECTOR: u8 = 0x80;

const MAX_HANDLERS_PER_VECTOR: usize = 8;
const VECTOR_COUNT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerMode {
    Pic,
    Apic,
}

/// Handler signature: returns `true` if it wants the debugger entered
/// after dispatch (§4.9 step 3, "OR their return values into a
/// debug-requested flag").
pub type IrqHandlerFn = fn(&mut ExecContext) -> bool;

/// What a vector is routed from, used to decide whether this is the first
/// registration against a given pin/MSI source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    Isa(u8),
    PciGsi(u32),
    Msi { dev: u32 },
}

struct HandlerEntry {
    priority: u8,
    handler: IrqHandlerFn,
    dev: Option<u32>,
}

struct VectorSlot {
    source: Option<IrqSource>,
    pinned_to_bsp: bool,
    handlers: Vec<HandlerEntry>,
}

impl VectorSlot {
    const fn empty() -> Self {
        Self { source: None, pinned_to_bsp: false, handlers: Vec::new() }
    }
}

struct IrqManagerState {
    mode: ControllerMode,
    /// Delivery mode selected by the `apic` boot parameter (§4.9
    /// "Balancing"): consulted by [`add_isr`] for any entry not pinned to
    /// the BSP, and by [`irq_balance`] when re-programming every unpinned
    /// vector once all CPUs are up.
    route_mode: apic::RouteMode,
    slots: Vec<VectorSlot>,
    /// gsi -> vector, so a second `add_isr` call for the same pin reuses
    /// the vector instead of allocating a fresh one.
    gsi_to_vector: Vec<(u32, u8)>,
}

static MANAGER: GlobalState<IrqSpinlock<IrqManagerState>> = GlobalState::new();
static DEBUGGER_ACTIVE: AtomicBool = AtomicBool::new(false);
static DISPATCH_COUNT: AtomicU32 = AtomicU32::new(0);

pub fn init(mode: ControllerMode, route_mode: apic::RouteMode) -> KernelResult<()> {
    let mut slots = Vec::with_capacity(VECTOR_COUNT);
    for _ in 0..VECTOR_COUNT {
        slots.push(VectorSlot::empty());
    }
    MANAGER
        .init(IrqSpinlock::new(IrqManagerState { mode, route_mode, slots, gsi_to_vector: Vec::new() }))
        .map_err(|_| KernelError::AlreadyRegistered { resource: "irq manager", id: 0 })
}

pub fn set_debugger_active(active: bool) {
    DEBUGGER_ACTIVE.store(active, Ordering::Relaxed);
}

pub fn is_debugger_active() -> bool {
    DEBUGGER_ACTIVE.load(Ordering::Relaxed)
}

fn band_range(priority: u8) -> (u8, u8) {
    let band = priority.min(HW_BAND_COUNT - 1) as u32;
    let base = HW_BAND_BASE as u32 + band * HW_BAND_WIDTH as u32;
    (base as u8, (base + HW_BAND_WIDTH as u32 - 1) as u8)
}

/// Search a priority band top-down for the first unused vector slot.
fn allocate_in_band(state: &IrqManagerState, priority: u8) -> KernelResult<u8> {
    let (start, end) = band_range(priority);
    for vector in (start..=end).rev() {
        if state.slots[vector as usize].source.is_none() {
            return Ok(vector);
        }
    }
    Err(KernelError::OutOfMemory { requested: 1, available: 0 })
}

fn rollback_route(vector: u8, source: IrqSource) {
    match source {
        IrqSource::Msi { dev } => {
            let _ = crate::drivers::pci::disable_msi(dev);
        }
        IrqSource::Isa(_) | IrqSource::PciGsi(_) => {
            if let Some(gsi) = gsi_of(source) {
                let _ = apic::mask_gsi(gsi);
            }
        }
    }
    let _ = vector;
}

fn gsi_of(source: IrqSource) -> Option<u32> {
    match source {
        IrqSource::PciGsi(gsi) => Some(gsi),
        IrqSource::Isa(irq) => Some(irq as u32),
        IrqSource::Msi { .. } => None,
    }
}

/// `add_isr(irq, priority, isr, force_bsp, dev)` (§4.9).
pub fn add_isr(source: IrqSource, priority: u8, handler: IrqHandlerFn, force_bsp: bool, dev: Option<u32>) -> KernelResult<u8> {
    MANAGER
        .with_mut(|lock| {
            let mut state = lock.lock();
            let is_msi = matches!(source, IrqSource::Msi { .. });

            let vector = match state.mode {
                ControllerMode::Pic => match source {
                    IrqSource::Isa(irq) => irq + PIC_RESERVED_BASE,
                    IrqSource::PciGsi(irq) => irq as u8 + PIC_RESERVED_BASE,
                    IrqSource::Msi { .. } => return Err(KernelError::NotSupported { operation: "msi without apic" }),
                },
                ControllerMode::Apic => {
                    if is_msi {
                        allocate_in_band(&state, priority)?
                    } else {
                        let gsi = gsi_of(source).expect("non-msi source has a gsi");
                        match state.gsi_to_vector.iter().find(|(g, _)| *g == gsi) {
                            Some((_, v)) => *v,
                            None => allocate_in_band(&state, priority)?,
                        }
                    }
                }
            };

            let first_assignment = state.slots[vector as usize].source.is_none();
            if first_assignment {
                state.slots[vector as usize].source = Some(source);
                if let ControllerMode::Apic = state.mode {
                    if !is_msi {
                        let gsi = gsi_of(source).unwrap();
                        state.gsi_to_vector.push((gsi, vector));
                        let (polarity, trigger) = config::with(|t| t.trigger_polarity(gsi as u8)).unwrap_or((
                            crate::config::Polarity::ActiveHigh,
                            crate::config::Trigger::Edge,
                        ));
                        let bsp_id = crate::cpu::current_apic_id().unwrap_or(crate::platform::ApicId::from_raw(0));
                        let mode = if force_bsp { apic::RouteMode::PhysicalToBsp } else { state.route_mode };
                        let active_low = matches!(polarity, crate::config::Polarity::ActiveLow);
                        let level = matches!(trigger, crate::config::Trigger::Level);
                        if let Err(e) = apic::add_redir_entry(
                            gsi,
                            active_low,
                            level,
                            crate::platform::Vector::from_raw(vector),
                            mode,
                            bsp_id,
                            crate::cpu::count() as u32,
                        ) {
                            state.slots[vector as usize].source = None;
                            state.gsi_to_vector.retain(|(g, _)| *g != gsi);
                            return Err(e);
                        }
                    } else if let Some(dev_id) = dev {
                        if let Err(e) = crate::drivers::pci::config_msi(dev_id, vector, 0) {
                            state.slots[vector as usize].source = None;
                            return Err(e);
                        }
                    }
                }
            }

            let slot = &mut state.slots[vector as usize];
            let already = slot.handlers.iter().any(|h| h.handler as usize == handler as usize && h.dev == dev);
            if !already {
                if slot.handlers.len() >= MAX_HANDLERS_PER_VECTOR {
                    if first_assignment {
                        rollback_route(vector, source);
                        slot.source = None;
                    }
                    return Err(KernelError::OutOfMemory { requested: 1, available: 0 });
                }
                slot.handlers.push(HandlerEntry { priority, handler, dev });
            }
            Ok(vector)
        })
        .unwrap_or(Err(KernelError::NotInitialized { subsystem: "irq manager" }))
}

/// `add_handler_pci` (§4.9).
pub fn add_handler_pci(handler: IrqHandlerFn, priority: u8, dev: &crate::drivers::pci::PciDevice) -> KernelResult<u8> {
    let source = if dev.msi_capable && config::msi_allowed() {
        IrqSource::Msi { dev: dev.id }
    } else {
        let gsi = config::with(|t| t.apic_pin_for_pci(dev.bus, dev.device, dev.interrupt_pin)).flatten();
        match gsi {
            Some(gsi) => IrqSource::PciGsi(gsi as u32),
            None => IrqSource::Isa(dev.interrupt_line),
        }
    };
    add_isr(source, priority, handler, true, Some(dev.id))
}

/// `add_handler_isa` (§4.9).
pub fn add_handler_isa(handler: IrqHandlerFn, priority: u8, irq: u8, lock: bool) -> KernelResult<u8> {
    let source = MANAGER
        .with(|l| l.lock().mode)
        .map(|mode| match mode {
            ControllerMode::Apic => {
                let pin = config::with(|t| t.apic_pin_for_isa(irq)).flatten().unwrap_or(irq);
                IrqSource::PciGsi(pin as u32)
            }
            ControllerMode::Pic => IrqSource::Isa(irq),
        })
        .unwrap_or(IrqSource::Isa(irq));

    let vector = add_isr(source, priority, handler, true, None)?;
    if lock {
        MANAGER.with_mut(|l| l.lock().slots[vector as usize].pinned_to_bsp = true);
    }
    Ok(vector)
}

fn do_eoi(vector: u8) {
    if vector < 0x20 || vector == 0x80 || vector == 0x81 {
        return;
    }
    let mode = MANAGER.with(|l| l.lock().mode);
    match mode {
        Some(ControllerMode::Pic) => crate::arch::x86::pic_eoi(vector),
        Some(ControllerMode::Apic) | None => apic::eoi(),
    }
}

/// `handle_interrupt(ctx)` (§4.9 "Top-half dispatch"). Returns the
/// per-CPU common-stack top address if a task switch is needed, else 0.
pub fn handle_interrupt(ctx: &mut ExecContext) -> u32 {
    let vector = (ctx.vector & 0xFF) as u8;

    if is_debugger_active() && !(vector <= EXCEPTION_END) && vector != DEBUGGER_IPI_VECTOR {
        do_eoi(vector);
        return 0;
    }

    DISPATCH_COUNT.fetch_add(1, Ordering::Relaxed);

    let prev_level = pm::current_level();
    let mut debug_requested = false;

    loop {
        if vector == SYSCALL_VECTOR {
            pm::set_level(ExecLevel::KernelThread);
            platform_enable_interrupts();
            let restart = crate::syscall::dispatch(ctx);
            platform_disable_interrupts();
            if restart {
                continue;
            }
        } else if vector >= PIC_RESERVED_BASE {
            let chain_result = MANAGER.with(|l| {
                let state = l.lock();
                state.slots[vector as usize].handlers.iter().map(|h| h.handler).collect::<Vec<_>>()
            });
            if let Some(handlers) = chain_result {
                for handler in handlers {
                    debug_requested |= handler(ctx);
                }
            }
            do_eoi(vector);
        } else {
            match vector {
                14 => {
                    let addr = crate::platform::read_cr2();
                    let class = crate::mm::page_table::classify_page_fault(addr, ctx.error_code, ctx.is_from_user_mode());
                    match crate::mm::page_table::classify_fault(class) {
                        crate::mm::page_table::FaultDisposition::InvalidateAndReturn => {
                            crate::platform::invlpg(addr);
                        }
                        crate::mm::page_table::FaultDisposition::DeliverSegv => {
                            pm::deliver_signals();
                        }
                        crate::mm::page_table::FaultDisposition::Fatal => {
                            debug_requested = true;
                        }
                    }
                }
                7 => {
                    // NM: lazy FPU restore is PM's concern; nothing to do
                    // at this layer beyond clearing TS, left to the FPU
                    // trap handler once task switching exists.
                }
                _ => debug_requested = true,
            }
        }
        break;
    }

    if pm::deliver_signals() {
        // A signal was delivered onto a restartable syscall; PM has
        // rewound the context, loop to re-run the dispatch.
        if vector == SYSCALL_VECTOR {
            return handle_interrupt(ctx);
        }
    }

    if matches!(prev_level, ExecLevel::User | ExecLevel::KernelThread) {
        pm::set_level(prev_level);
        platform_enable_interrupts();
        pm::run_exit_hooks();
        platform_disable_interrupts();
    }

    let _ = debug_requested;
    if pm::reschedule_needed() { common_stack_top() } else { 0 }
}

const DEBUGGER_IPI_VECTOR: u8 = 0x8F;

fn platform_enable_interrupts() {
    let _ = crate::platform::restore_interrupts(true);
}

fn platform_disable_interrupts() {
    let _ = crate::platform::disable_interrupts();
}

static COMMON_STACK_TOP: GlobalState<IrqSpinlock<[u32; 32]>> = GlobalState::new();

fn common_stack_top() -> u32 {
    let idx = crate::cpu::current_apic_id().map(|id| id.raw() as usize % 32).unwrap_or(0);
    COMMON_STACK_TOP.with(|l| l.lock()[idx]).unwrap_or(0)
}

pub fn set_common_stack_top(cpu_index: usize, addr: u32) {
    let _ = COMMON_STACK_TOP.init(IrqSpinlock::new([0; 32]));
    COMMON_STACK_TOP.with_mut(|l| {
        let mut g = l.lock();
        if cpu_index < g.len() {
            g[cpu_index] = addr;
        }
    });
}

/// `irq_balance()` (§4.9 "Balancing"). Re-programs every unpinned vector
/// using the boot-time delivery mode (the `apic` boot parameter, threaded
/// through from [`init`]), not a fixed routing — a PIC-era "always the
/// BSP" default would defeat the point of balancing once more CPUs are
/// online.
pub fn irq_balance() {
    let (targets, route_mode): (Vec<(u8, IrqSource)>, apic::RouteMode) = MANAGER
        .with(|l| {
            let state = l.lock();
            let targets = state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.pinned_to_bsp)
                .filter_map(|(v, s)| s.source.map(|src| (v as u8, src)))
                .collect();
            (targets, state.route_mode)
        })
        .unwrap_or((Vec::new(), apic::RouteMode::PhysicalToBsp));

    for (vector, source) in targets {
        if let IrqSource::Msi { dev } = source {
            let _ = crate::drivers::pci::config_msi(dev, vector, 0);
            continue;
        }
        if let Some(gsi) = gsi_of(source) {
            let (polarity, trigger) = config::with(|t| t.trigger_polarity(gsi as u8))
                .unwrap_or((crate::config::Polarity::ActiveHigh, crate::config::Trigger::Edge));
            let bsp_id = crate::cpu::current_apic_id().unwrap_or(crate::platform::ApicId::from_raw(0));
            let _ = apic::add_redir_entry(
                gsi,
                matches!(polarity, crate::config::Polarity::ActiveLow),
                matches!(trigger, crate::config::Trigger::Level),
                crate::platform::Vector::from_raw(vector),
                route_mode,
                bsp_id,
                crate::cpu::count() as u32,
            );
        }
    }
}

pub fn dispatch_count() -> u32 {
    DISPATCH_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_range_covers_sixteen_vectors_per_band() {
        let (start, end) = band_range(0);
        assert_eq!(end - start, HW_BAND_WIDTH - 1);
        assert_eq!(start, HW_BAND_BASE);
        let (start4, end4) = band_range(4);
        assert_eq!(end4, HW_BAND_END);
        assert_eq!(start4, HW_BAND_BASE + 4 * HW_BAND_WIDTH);
    }
}
