//! Boot sequence (§2).
//!
//! [`crate::arch::x86::multiboot::multiboot_main`] hands a parsed `BootInfo`
//! to [`crate::kernel_main_impl`], which brings serial/logging up as early as
//! possible and then calls [`kernel_init`] here to run the rest of the boot
//! flow in order: CPU bring-up, memory management, platform configuration,
//! the driver manager, IRQ balancing, and finally the handoff to process
//! management. Each stage prints a banner via [`crate::arch::x86::bootstrap`]
//! so a hang narrows to a stage instead of a blank screen.

use crate::arch::x86::multiboot::BootInfo;
use crate::arch::x86::{self as x86, apic, bootstrap as stage, gdt, idt, timer};
use crate::bootparam::{self, ApicMode, BootParams};
use crate::error::KernelResult;
use crate::irq::{self, ControllerMode};
use crate::mm::vas::AddressSpace;
use crate::platform::{self, ApicId, Vector};
use crate::{config, cpu, drivers, logger, pm};

/// PID reserved for the single common address space this boot sequence
/// runs until PM brings up real per-process tables (§2 step 4's "address
/// space tables"; see [`crate::syscall::set_current_address_space`]).
const BOOT_PID: u32 = 0;

/// `ControllerMode` is the IRQ manager's to own (§4.9), but something has
/// to decide which one a given boot gets: the `apic` boot parameter can
/// force the legacy PIC, and even a `use_acpi`/MP parse that succeeds may
/// simply not have found an I/O APIC to route through.
fn choose_controller_mode(params: &BootParams) -> ControllerMode {
    if matches!(params.apic, ApicMode::Pic) {
        return ControllerMode::Pic;
    }
    let has_ioapics = config::with(|t| !t.ioapics.is_empty()).unwrap_or(false);
    if has_ioapics {
        ControllerMode::Apic
    } else {
        ControllerMode::Pic
    }
}

/// Map the `apic` boot parameter onto the I/O APIC delivery mode
/// `irq_balance` re-programs unpinned vectors with (§4.9 "Balancing").
/// Irrelevant in `Pic` mode, where there's no I/O APIC to address.
fn choose_route_mode(params: &BootParams) -> apic::RouteMode {
    match params.apic {
        ApicMode::Pic | ApicMode::FixedBsp => apic::RouteMode::PhysicalToBsp,
        ApicMode::LogicalFixed => apic::RouteMode::LogicalFixed,
        ApicMode::LogicalLowestPriority => apic::RouteMode::LogicalLowestPriority,
    }
}

/// Route IRQ0 to [`timer::timer_interrupt_handler`] and start it ticking,
/// either via the PIT directly (`Pic` mode) or by calibrating the LAPIC
/// timer against a PIT busy-wait (`Apic` mode, §9).
fn init_timer(mode: ControllerMode) -> KernelResult<()> {
    irq::add_handler_isa(timer::timer_interrupt_handler, 0, 0, true)?;
    match mode {
        ControllerMode::Pic => timer::setup_timer(100),
        ControllerMode::Apic => {
            let vector = Vector::from_raw(irq::HW_BAND_BASE);
            apic::calibrate_timer(vector, || timer::pit_wait_ms(10));
        }
    }
    Ok(())
}

/// Run the full boot sequence on the BSP.
pub fn kernel_init(info: &BootInfo) -> KernelResult<()> {
    let params = bootparam::parse(info.cmdline);
    logger::init(&params);

    stage::stage1_start();
    gdt::init();
    idt::init();
    stage::stage1_complete();

    stage::stage2_start();
    crate::mm::init(&info.regions[..info.region_count], params.heap_validate)?;
    crate::syscall::set_current_address_space(AddressSpace::new(BOOT_PID))?;
    stage::stage2_complete();

    stage::stage3_start();
    config::set_msi_allowed(params.use_msi);
    if params.use_acpi {
        config::init()?;
    } else {
        log::warn!("use_acpi=0: ACPI/MP config-table parse skipped, PIC fallback only");
    }
    cpu::init()?;
    stage::stage3_complete();

    stage::stage4_start();
    let mode = choose_controller_mode(&params);
    irq::init(mode, choose_route_mode(&params))?;
    match mode {
        // SAFETY: the legacy PIC has received no IRQs yet at this point in
        // boot; this is the one-time ICW bring-up.
        ControllerMode::Pic => unsafe { x86::init_pic() },
        ControllerMode::Apic => {
            apic::map_all()?;
            apic::init_local(0)?;
        }
    }
    let bsp_id = cpu::current_apic_id().unwrap_or(ApicId::from_raw(0));
    cpu::identify_running_cpu(bsp_id)?;
    drivers::init(info.module)?;
    init_timer(mode)?;
    stage::stage4_complete();

    stage::stage5_start();
    // No AP startup trampoline exists in this repository — bringing
    // additional CPUs online is process management's job, once it has
    // tasks worth scheduling onto them. The BSP is the only CPU running
    // past this point, so `irq_balance` has exactly one target to spread
    // load across.
    irq::irq_balance();
    stage::stage5_complete();

    stage::stage6_start();
    pm::init();
    platform::restore_interrupts(true);
    stage::stage6_complete();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pic_mode_forced_by_boot_param() {
        let mut params = BootParams::default();
        params.apic = ApicMode::Pic;
        assert_eq!(choose_controller_mode(&params), ControllerMode::Pic);
    }

    #[test]
    fn route_mode_follows_apic_boot_param() {
        let mut params = BootParams::default();
        params.apic = ApicMode::LogicalLowestPriority;
        assert_eq!(choose_route_mode(&params), apic::RouteMode::LogicalLowestPriority);
        params.apic = ApicMode::FixedBsp;
        assert_eq!(choose_route_mode(&params), apic::RouteMode::PhysicalToBsp);
    }
}
