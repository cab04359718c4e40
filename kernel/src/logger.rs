//! `log::Log` backend (§1.1).
//!
//! A single global logger is installed once at boot via `log::set_logger`.
//! The crate-wide max level comes from the `loglevel` boot parameter, but
//! the `irq` target gets its own finer gate (`irq_log`) since IRQ routing
//! is chattier than everything else put together. Every record is rendered
//! through [`crate::println`]/[`crate::serial_println`] — the same macros
//! early boot output uses — and kept in a small ring buffer so a panic
//! handler or a future `dmesg`-style syscall can dump recent history.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use spin::Mutex;

use crate::bootparam::BootParams;

const RING_CAPACITY: usize = 256;
const MESSAGE_MAX_LEN: usize = 128;
const TARGET_MAX_LEN: usize = 16;

#[derive(Clone, Copy)]
struct Entry {
    level: log::Level,
    target: [u8; TARGET_MAX_LEN],
    target_len: u8,
    message: [u8; MESSAGE_MAX_LEN],
    message_len: u8,
}

impl Entry {
    const fn blank() -> Self {
        Self {
            level: log::Level::Trace,
            target: [0; TARGET_MAX_LEN],
            target_len: 0,
            message: [0; MESSAGE_MAX_LEN],
            message_len: 0,
        }
    }
}

struct Ring {
    entries: [Entry; RING_CAPACITY],
    next: usize,
    count: usize,
}

static RING: Mutex<Ring> =
    Mutex::new(Ring { entries: [Entry::blank(); RING_CAPACITY], next: 0, count: 0 });

static IRQ_LOG: AtomicBool = AtomicBool::new(false);
static SERIAL_MIRROR: AtomicBool = AtomicBool::new(true);

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        let target = metadata.target();
        if target.starts_with("irq::") || target == "irq" {
            return IRQ_LOG.load(Ordering::Relaxed);
        }
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = record.level();
        let target = record.target();

        crate::println!("[{level:<5}] {target}: {}", record.args());
        if SERIAL_MIRROR.load(Ordering::Relaxed) {
            crate::serial_println!("[{level:<5}] {target}: {}", record.args());
        }

        store(level, target, record.args());
    }

    fn flush(&self) {}
}

fn store(level: log::Level, target: &str, args: &core::fmt::Arguments) {
    use core::fmt::Write;

    struct Sink<'a> {
        buf: &'a mut [u8],
        len: usize,
    }
    impl core::fmt::Write for Sink<'_> {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let remaining = self.buf.len() - self.len;
            let take = remaining.min(s.len());
            self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
            self.len += take;
            Ok(())
        }
    }

    let mut entry = Entry::blank();
    entry.level = level;
    let tgt_len = target.len().min(TARGET_MAX_LEN);
    entry.target[..tgt_len].copy_from_slice(&target.as_bytes()[..tgt_len]);
    entry.target_len = tgt_len as u8;

    let mut sink = Sink { buf: &mut entry.message, len: 0 };
    let _ = write!(sink, "{args}");
    entry.message_len = sink.len as u8;

    let mut ring = RING.lock();
    let idx = ring.next;
    ring.entries[idx] = entry;
    ring.next = (ring.next + 1) % RING_CAPACITY;
    ring.count = (ring.count + 1).min(RING_CAPACITY);
}

/// Install the global logger and apply gating from the parsed boot
/// parameters. Must run once, after [`crate::arch::x86::serial`] (or at
/// least early serial) is up, before any subsystem starts calling `log::*`.
pub fn init(params: &BootParams) {
    IRQ_LOG.store(params.irq_log, Ordering::Relaxed);

    log::set_max_level(params.loglevel);
    // SAFETY: called once during single-threaded boot, before any other
    // thread could call `log::set_logger` or emit a log record.
    let _ = log::set_logger(&LOGGER);
}

/// Number of ring-buffer entries currently held (for diagnostics).
pub fn recorded_count() -> usize {
    RING.lock().count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_truncates_overlong_messages() {
        let long = "x".repeat(MESSAGE_MAX_LEN * 2);
        store(log::Level::Info, "test", &format_args!("{long}"));
        let ring = RING.lock();
        let idx = (ring.next + RING_CAPACITY - 1) % RING_CAPACITY;
        assert_eq!(ring.entries[idx].message_len as usize, MESSAGE_MAX_LEN);
    }
}
