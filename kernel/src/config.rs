//! Config-table parser (§4.5): MP Floating Pointer + Configuration Table,
//! and ACPI RSDP -> RSDT/XSDT -> MADT/FADT. Both are scanned; where both are
//! present, ACPI wins for bus/IRQ routing and the MP table is kept only as
//! a fallback. Low physical memory (below 1 MiB, where the EBDA and BIOS
//! ROM window live) is identity-mapped by the early-boot page tables, so
//! table bytes are read directly through [`PhysAddr`] without a transient
//! mapping.

#![allow(dead_code)]

extern crate alloc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::platform::PhysAddr;

const MODULE: &str = "config";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    BusDefault,
    ActiveHigh,
    ActiveLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    BusDefault,
    Edge,
    Level,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Isa,
    Pci,
}

#[derive(Debug, Clone, Copy)]
pub struct IrqRoutingEntry {
    pub src_bus: Bus,
    pub src_device: u8,
    pub src_pin: u8,
    pub src_irq: u8,
    pub dest_ioapic_pin: u8,
    pub polarity: Polarity,
    pub trigger: Trigger,
}

impl IrqRoutingEntry {
    /// Resolve `bus-default` against the bus the routing came from, per
    /// §4.5: PCI defaults to level/active-low, ISA to edge/active-high.
    pub fn effective(&self) -> (Polarity, Trigger) {
        let polarity = match self.polarity {
            Polarity::BusDefault => match self.src_bus {
                Bus::Pci => Polarity::ActiveLow,
                Bus::Isa => Polarity::ActiveHigh,
            },
            p => p,
        };
        let trigger = match self.trigger {
            Trigger::BusDefault => match self.src_bus {
                Bus::Pci => Trigger::Level,
                Bus::Isa => Trigger::Edge,
            },
            t => t,
        };
        (polarity, trigger)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CpuEntry {
    pub lapic_id: u8,
    pub is_bsp: bool,
    pub apic_ver: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct IoApicEntry {
    pub id: u8,
    pub phys_base: PhysAddr,
    pub gsi_base: u32,
}

#[derive(Default)]
pub struct ConfigTables {
    pub cpus: Vec<CpuEntry>,
    pub ioapics: Vec<IoApicEntry>,
    pub routings: Vec<IrqRoutingEntry>,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Source {
    #[default]
    None,
    Mp,
    Acpi,
}

impl ConfigTables {
    pub fn apic_pin_for_isa(&self, irq: u8) -> Option<u8> {
        self.routings
            .iter()
            .find(|r| matches!(r.src_bus, Bus::Isa) && r.src_irq == irq)
            .map(|r| r.dest_ioapic_pin)
            // §9 open question, carried verbatim: the original falls back
            // to `apic_pin = irq` in PIC-equivalent configurations with no
            // explicit ISA routing; whether this is intentional for
            // systems with a re-mapped ISA bus is unclear, and this
            // repository does not silently "fix" it (see DESIGN.md).
            .or(Some(irq))
    }

    pub fn apic_pin_for_pci(&self, _bus: u8, device: u8, pin_letter: u8) -> Option<u8> {
        self.routings
            .iter()
            .find(|r| matches!(r.src_bus, Bus::Pci) && r.src_device == device && r.src_pin == pin_letter)
            .map(|r| r.dest_ioapic_pin)
    }

    pub fn trigger_polarity(&self, apic_pin: u8) -> (Polarity, Trigger) {
        self.routings
            .iter()
            .find(|r| r.dest_ioapic_pin == apic_pin)
            .map(|r| r.effective())
            .unwrap_or((Polarity::ActiveHigh, Trigger::Edge))
    }

    pub fn primary_ioapic(&self) -> Option<&IoApicEntry> {
        self.ioapics.first()
    }

    fn merge_mp_fallback(&mut self, mp: ConfigTables) {
        if self.cpus.is_empty() {
            self.cpus = mp.cpus;
        }
        if self.ioapics.is_empty() {
            self.ioapics = mp.ioapics;
        }
        if self.routings.is_empty() {
            self.routings = mp.routings;
        }
    }
}

// ---------------------------------------------------------------------
// Hard-coded motherboard overrides
// ---------------------------------------------------------------------

struct Override {
    oem_id: &'static [u8; 6],
    product_id: &'static [u8; 8],
    inject: fn(&mut ConfigTables),
}

static OVERRIDES: &[Override] = &[
    // Boards whose firmware tables omit the legacy PS/2 keyboard IRQ2
    // cascade routing; without this the IO-APIC redirection entry for
    // ISA IRQ 2 is never programmed.
    Override {
        oem_id: b"BOCHS \0",
        product_id: b"BXPC    ",
        inject: |tables| {
            tables.routings.push(IrqRoutingEntry {
                src_bus: Bus::Isa,
                src_device: 0,
                src_pin: 0,
                src_irq: 2,
                dest_ioapic_pin: 2,
                polarity: Polarity::ActiveHigh,
                trigger: Trigger::Edge,
            });
        },
    },
];

fn apply_overrides(tables: &mut ConfigTables, oem_id: &[u8; 6], product_id: &[u8; 8]) {
    for o in OVERRIDES {
        if o.oem_id == oem_id && o.product_id == product_id {
            (o.inject)(tables);
        }
    }
}

// ---------------------------------------------------------------------
// MP Floating Pointer + Configuration Table
// ---------------------------------------------------------------------

mod mp {
    use super::*;

    #[repr(C, packed)]
    struct FloatingPointer {
        signature: [u8; 4],
        phys_addr: u32,
        length: u8,
        spec_rev: u8,
        checksum: u8,
        feature: [u8; 5],
    }

    #[repr(C, packed)]
    struct ConfigHeader {
        signature: [u8; 4],
        base_len: u16,
        spec_rev: u8,
        checksum: u8,
        oem_id: [u8; 8],
        product_id: [u8; 12],
        oem_table: u32,
        oem_length: u16,
        entry_count: u16,
        lapic_addr: u32,
        ext_len: u16,
        ext_checksum: u8,
        reserved: u8,
    }

    const ENTRY_CPU: u8 = 0;
    const ENTRY_BUS: u8 = 1;
    const ENTRY_IOAPIC: u8 = 2;
    const ENTRY_IRQ: u8 = 3;
    const ENTRY_LOCAL_INT: u8 = 4;

    /// Scan the BIOS ROM window, the EBDA, and upper conventional memory
    /// at 16-byte alignment for the `_MP_` floating-pointer signature.
    pub fn find() -> Option<u32> {
        let ebda_seg = unsafe { core::ptr::read_volatile(0x40E as *const u16) };
        let candidates: [(u32, u32); 3] = [
            ((ebda_seg as u32) << 4, ((ebda_seg as u32) << 4) + 1024),
            (0x9FC00, 0xA0000),
            (0xF0000, 0x100000),
        ];
        for (start, end) in candidates {
            let mut addr = start;
            while addr + 16 <= end {
                // SAFETY: `addr` is within the first 1 MiB, identity-mapped
                // by the early-boot page tables; reading 4 bytes to check
                // a signature has no side effects.
                let sig = unsafe { core::ptr::read_volatile(addr as *const [u8; 4]) };
                if &sig == b"_MP_" {
                    return Some(addr);
                }
                addr += 16;
            }
        }
        None
    }

    pub fn parse(fp_addr: u32) -> KernelResult<ConfigTables> {
        // SAFETY: `fp_addr` was just located by `find` and is within the
        // identity-mapped low-memory window.
        let fp = unsafe { &*(fp_addr as *const FloatingPointer) };
        if fp.phys_addr == 0 {
            return Err(KernelError::NotSupported { operation: "default MP configuration" });
        }
        let header_addr = fp.phys_addr;
        // SAFETY: see above.
        let header = unsafe { &*(header_addr as *const ConfigHeader) };
        if &header.signature != b"PCMP" {
            return Err(KernelError::Fatal { reason: "bad MP config signature" });
        }

        let mut tables = ConfigTables { source: crate::config::Source::Mp, ..Default::default() };
        let mut cursor = header_addr + core::mem::size_of::<ConfigHeader>() as u32;
        let mut bsp_seen = false;
        for _ in 0..header.entry_count {
            // SAFETY: MP entries are tightly packed after the header and
            // each begins with a one-byte type tag; `cursor` stays within
            // the table bounds because `entry_count` bounds the loop.
            let entry_type = unsafe { core::ptr::read_volatile(cursor as *const u8) };
            match entry_type {
                ENTRY_CPU => {
                    #[repr(C, packed)]
                    struct CpuEnt {
                        _type: u8,
                        lapic_id: u8,
                        lapic_ver: u8,
                        flags: u8,
                        _sig: [u8; 4],
                        _features: u32,
                        _reserved: [u8; 8],
                    }
                    let e = unsafe { &*(cursor as *const CpuEnt) };
                    let is_bsp = e.flags & 0x2 != 0 && !bsp_seen;
                    bsp_seen |= is_bsp;
                    tables.cpus.push(CpuEntry { lapic_id: e.lapic_id, is_bsp, apic_ver: e.lapic_ver });
                    cursor += 20;
                }
                ENTRY_IOAPIC => {
                    #[repr(C, packed)]
                    struct IoApicEnt {
                        _type: u8,
                        id: u8,
                        _ver: u8,
                        _flags: u8,
                        addr: u32,
                    }
                    let e = unsafe { &*(cursor as *const IoApicEnt) };
                    tables.ioapics.push(IoApicEntry { id: e.id, phys_base: PhysAddr::new(e.addr), gsi_base: 0 });
                    cursor += 8;
                }
                ENTRY_IRQ => {
                    #[repr(C, packed)]
                    struct IrqEnt {
                        _type: u8,
                        irq_type: u8,
                        flags: u16,
                        src_bus: u8,
                        src_irq: u8,
                        dest_ioapic: u8,
                        dest_pin: u8,
                    }
                    let e = unsafe { &*(cursor as *const IrqEnt) };
                    let polarity = match e.flags & 0x3 {
                        1 => Polarity::ActiveHigh,
                        3 => Polarity::ActiveLow,
                        _ => Polarity::BusDefault,
                    };
                    let trigger = match (e.flags >> 2) & 0x3 {
                        1 => Trigger::Edge,
                        3 => Trigger::Level,
                        _ => Trigger::BusDefault,
                    };
                    tables.routings.push(IrqRoutingEntry {
                        src_bus: Bus::Isa,
                        src_device: e.src_bus,
                        src_pin: 0,
                        src_irq: e.src_irq,
                        dest_ioapic_pin: e.dest_pin,
                        polarity,
                        trigger,
                    });
                    let _ = e.irq_type;
                    let _ = e.dest_ioapic;
                    cursor += 8;
                }
                ENTRY_BUS | ENTRY_LOCAL_INT => cursor += 8,
                _ => break,
            }
        }
        Ok(tables)
    }
}

// ---------------------------------------------------------------------
// ACPI RSDP -> RSDT/XSDT -> MADT
// ---------------------------------------------------------------------

mod acpi {
    use super::*;

    #[repr(C, packed)]
    struct Rsdp {
        signature: [u8; 8],
        checksum: u8,
        oem_id: [u8; 6],
        revision: u8,
        rsdt_addr: u32,
    }

    #[repr(C, packed)]
    struct SdtHeader {
        signature: [u8; 4],
        length: u32,
        revision: u8,
        checksum: u8,
        oem_id: [u8; 6],
        oem_table_id: [u8; 8],
        oem_revision: u32,
        creator_id: u32,
        creator_revision: u32,
    }

    pub fn find_rsdp() -> Option<u32> {
        let ebda_seg = unsafe { core::ptr::read_volatile(0x40E as *const u16) };
        let candidates = [((ebda_seg as u32) << 4, ((ebda_seg as u32) << 4) + 1024), (0xE0000, 0x100000)];
        for (start, end) in candidates {
            let mut addr = start;
            while addr + 16 <= end {
                // SAFETY: within the identity-mapped first 1 MiB.
                let sig = unsafe { core::ptr::read_volatile(addr as *const [u8; 8]) };
                if &sig == b"RSD PTR " {
                    return Some(addr);
                }
                addr += 16;
            }
        }
        None
    }

    fn checksum_ok(addr: u32, len: u32) -> bool {
        let mut sum: u8 = 0;
        for i in 0..len {
            // SAFETY: `addr..addr+len` names a table whose length field was
            // itself read from identity-mapped memory immediately before.
            sum = sum.wrapping_add(unsafe { core::ptr::read_volatile((addr + i) as *const u8) });
        }
        sum == 0
    }

    pub fn parse(rsdp_addr: u32) -> KernelResult<ConfigTables> {
        // SAFETY: `rsdp_addr` was located by `find_rsdp`.
        let rsdp = unsafe { &*(rsdp_addr as *const Rsdp) };
        if !checksum_ok(rsdp_addr, 20) {
            return Err(KernelError::Fatal { reason: "bad RSDP checksum" });
        }
        let rsdt_addr = rsdp.rsdt_addr;
        // SAFETY: see above.
        let header = unsafe { &*(rsdt_addr as *const SdtHeader) };
        if &header.signature != b"RSDT" || !checksum_ok(rsdt_addr, header.length) {
            return Err(KernelError::Fatal { reason: "bad RSDT" });
        }
        let entry_count = (header.length as usize - core::mem::size_of::<SdtHeader>()) / 4;
        let entries_base = rsdt_addr + core::mem::size_of::<SdtHeader>() as u32;

        let mut tables = ConfigTables { source: crate::config::Source::Acpi, ..Default::default() };
        for i in 0..entry_count {
            // SAFETY: within the RSDT body, bounded by `entry_count`.
            let sdt_addr = unsafe { core::ptr::read_volatile((entries_base + (i as u32) * 4) as *const u32) };
            // SAFETY: every RSDT entry points at another SDT header.
            let sdt = unsafe { &*(sdt_addr as *const SdtHeader) };
            if &sdt.signature == b"APIC" {
                parse_madt(sdt_addr, sdt.length, &mut tables);
            }
        }
        apply_overrides(&mut tables, &rsdp.oem_id, &header.oem_table_id);
        Ok(tables)
    }

    fn parse_madt(addr: u32, length: u32, tables: &mut ConfigTables) {
        const MADT_LOCAL_APIC: u8 = 0;
        const MADT_IO_APIC: u8 = 1;
        const MADT_ISO: u8 = 2;

        let body_start = addr + core::mem::size_of::<SdtHeader>() as u32 + 4; // + local apic addr + flags
        let mut cursor = body_start;
        let end = addr + length;
        while cursor + 2 <= end {
            // SAFETY: walking the MADT entry list, bounded by `end`.
            let entry_type = unsafe { core::ptr::read_volatile(cursor as *const u8) };
            let entry_len = unsafe { core::ptr::read_volatile((cursor + 1) as *const u8) } as u32;
            if entry_len == 0 {
                break;
            }
            match entry_type {
                MADT_LOCAL_APIC => {
                    #[repr(C, packed)]
                    struct LocalApicEnt {
                        _type: u8,
                        _len: u8,
                        _processor_id: u8,
                        apic_id: u8,
                        flags: u32,
                    }
                    let e = unsafe { &*(cursor as *const LocalApicEnt) };
                    if e.flags & 1 != 0 {
                        let is_bsp = tables.cpus.is_empty();
                        tables.cpus.push(CpuEntry { lapic_id: e.apic_id, is_bsp, apic_ver: 0 });
                    }
                }
                MADT_IO_APIC => {
                    #[repr(C, packed)]
                    struct IoApicEnt {
                        _type: u8,
                        _len: u8,
                        id: u8,
                        _reserved: u8,
                        addr: u32,
                        gsi_base: u32,
                    }
                    let e = unsafe { &*(cursor as *const IoApicEnt) };
                    tables.ioapics.push(IoApicEntry { id: e.id, phys_base: PhysAddr::new(e.addr), gsi_base: e.gsi_base });
                }
                MADT_ISO => {
                    #[repr(C, packed)]
                    struct IsoEnt {
                        _type: u8,
                        _len: u8,
                        _bus: u8,
                        source: u8,
                        gsi: u32,
                        flags: u16,
                    }
                    let e = unsafe { &*(cursor as *const IsoEnt) };
                    let polarity = match e.flags & 0x3 {
                        1 => Polarity::ActiveHigh,
                        3 => Polarity::ActiveLow,
                        _ => Polarity::BusDefault,
                    };
                    let trigger = match (e.flags >> 2) & 0x3 {
                        1 => Trigger::Edge,
                        3 => Trigger::Level,
                        _ => Trigger::BusDefault,
                    };
                    tables.routings.push(IrqRoutingEntry {
                        src_bus: Bus::Isa,
                        src_device: 0,
                        src_pin: 0,
                        src_irq: e.source,
                        dest_ioapic_pin: e.gsi as u8,
                        polarity,
                        trigger,
                    });
                }
                _ => {}
            }
            cursor += entry_len;
        }
    }
}

static TABLES: crate::sync::GlobalState<ConfigTables> = crate::sync::GlobalState::new();

/// Parse whichever tables are present; ACPI wins, MP is the fallback.
pub fn init() -> KernelResult<()> {
    let acpi_result = acpi::find_rsdp().and_then(|addr| acpi::parse(addr).ok());
    let mp_result = mp::find().and_then(|addr| mp::parse(addr).ok());

    let tables = match (acpi_result, mp_result) {
        (Some(mut acpi), Some(mp)) => {
            acpi.merge_mp_fallback(mp);
            acpi
        }
        (Some(acpi), None) => acpi,
        (None, Some(mp)) => mp,
        (None, None) => {
            log::warn!(target: MODULE, "no ACPI or MP configuration tables found");
            ConfigTables::default()
        }
    };
    log::info!(target: MODULE, "{} CPUs, {} I/O APICs, {} routings (source {:?})", tables.cpus.len(), tables.ioapics.len(), tables.routings.len(), tables.source);
    TABLES.init(tables).map_err(|_| KernelError::AlreadyRegistered { resource: "config tables", id: 0 })
}

pub fn with<R>(f: impl FnOnce(&ConfigTables) -> R) -> Option<R> {
    TABLES.with(f)
}

/// Boot parameter gating whether IRQ registration may use MSI even on a
/// capable device (§4.9 "add_handler_pci"). Set from the kernel command
/// line during early boot; defaults to allowed.
static MSI_ALLOWED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(true);

pub fn msi_allowed() -> bool {
    MSI_ALLOWED.load(core::sync::atomic::Ordering::Relaxed)
}

pub fn set_msi_allowed(allowed: bool) {
    MSI_ALLOWED.store(allowed, core::sync::atomic::Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_default_resolves_per_bus() {
        let pci = IrqRoutingEntry {
            src_bus: Bus::Pci,
            src_device: 0,
            src_pin: 0,
            src_irq: 0,
            dest_ioapic_pin: 0,
            polarity: Polarity::BusDefault,
            trigger: Trigger::BusDefault,
        };
        assert_eq!(pci.effective(), (Polarity::ActiveLow, Trigger::Level));

        let isa = IrqRoutingEntry { src_bus: Bus::Isa, ..pci };
        assert_eq!(isa.effective(), (Polarity::ActiveHigh, Trigger::Edge));
    }
}
