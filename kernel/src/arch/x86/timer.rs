//! Programmable Interval Timer (8254/8253).
//!
//! Two jobs: drive the legacy IRQ0 tick when the I/O APIC/LAPIC timer isn't
//! available (`ControllerMode::Pic`, §4.9), and hand [`super::apic::calibrate_timer`]
//! a busy-wait of known duration to measure the LAPIC timer's tick rate
//! against (§9).

use core::sync::atomic::{AtomicU64, Ordering};

use super::context::ExecContext;
use crate::platform::{self, IoPort};

const PIT_FREQUENCY_HZ: u32 = 1_193_182;
const PIT_CHANNEL0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_LATCH_CHANNEL0: u8 = 0x00;
const PIT_MODE2_RATE_GENERATOR: u8 = 0x34; // channel 0, lobyte/hibyte, mode 2

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the IRQ0 handler in PIC mode. Advances the tick count and
/// asks PM to reschedule at the next safe point.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::pm::request_reschedule();
}

/// `IrqHandlerFn` adapter registered against ISA IRQ0 (§4.9). Never asks
/// for the debugger.
pub fn timer_interrupt_handler(_ctx: &mut ExecContext) -> bool {
    tick();
    false
}

fn program_periodic(hz: u32) {
    let divisor = (PIT_FREQUENCY_HZ / hz).clamp(1, u16::MAX as u32) as u16;
    // SAFETY: the PIT command/data ports are always safe to reprogram;
    // only the IRQ0 consumer's notion of tick rate depends on this.
    unsafe {
        platform::outb(IoPort::new(PIT_COMMAND), PIT_MODE2_RATE_GENERATOR);
        platform::outb(IoPort::new(PIT_CHANNEL0_DATA), (divisor & 0xFF) as u8);
        platform::outb(IoPort::new(PIT_CHANNEL0_DATA), (divisor >> 8) as u8);
    }
}

/// Program the PIT to fire IRQ0 at `hz` and print the configured rate.
pub fn setup_timer(hz: u32) {
    program_periodic(hz);
    log::info!("PIT programmed for {hz} Hz periodic IRQ0");
}

fn read_counter() -> u16 {
    // SAFETY: latch-then-read-back is the standard PIT readback sequence;
    // no invariant beyond "channel 0 is in a counting mode" is required.
    unsafe {
        platform::outb(IoPort::new(PIT_COMMAND), PIT_LATCH_CHANNEL0);
        let lo = platform::inb(IoPort::new(PIT_CHANNEL0_DATA)) as u16;
        let hi = platform::inb(IoPort::new(PIT_CHANNEL0_DATA)) as u16;
        (hi << 8) | lo
    }
}

/// Busy-wait for approximately `ms` milliseconds by polling the PIT
/// countdown register. Used only during BSP boot, before interrupts are
/// enabled, to calibrate the LAPIC timer (§9 `calibrate_timer`).
pub fn pit_wait_ms(ms: u32) {
    const TICK_HZ: u32 = 100; // 10ms per countdown period
    program_periodic(TICK_HZ);
    let periods_needed = ms.div_ceil(1000 / TICK_HZ).max(1);

    let mut periods_elapsed = 0u32;
    let mut last = read_counter();
    while periods_elapsed < periods_needed {
        let now = read_counter();
        if now > last {
            periods_elapsed += 1;
        }
        last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_advances_counter() {
        let before = get_ticks();
        tick();
        assert_eq!(get_ticks(), before + 1);
    }
}
