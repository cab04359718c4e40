//! PCI bus driver (§4.8).

extern crate alloc;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::platform::IoPort;
use crate::sync::{GlobalState, IrqSpinlock};

const CONFIG_ADDRESS: IoPort = IoPort::new(0xCF8);
const CONFIG_DATA: IoPort = IoPort::new(0xCFC);

const REG_VENDOR_DEVICE: u8 = 0x00;
const REG_COMMAND_STATUS: u8 = 0x04;
const REG_CLASS: u8 = 0x08;
const REG_HEADER_TYPE: u8 = 0x0C;
const REG_BAR0: u8 = 0x10;
const REG_SECONDARY_BUS: u8 = 0x18;
const REG_CAPABILITIES_PTR: u8 = 0x34;
const REG_INTERRUPT: u8 = 0x3C;

const STATUS_CAPABILITIES_LIST: u32 = 1 << 4;
const CAP_ID_MSI: u8 = 0x05;
const COMMAND_BUS_MASTER: u32 = 1 << 2;

fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | (bus as u32) << 16
        | (device as u32) << 11
        | (function as u32) << 8
        | (offset as u32 & 0xFC)
}

/// A single spinlock serialises the `ADDR`/`DATA` pair (§4.8).
static CONFIG_LOCK: IrqSpinlock<()> = IrqSpinlock::new(());

fn read_dword(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    let _guard = CONFIG_LOCK.lock();
    unsafe {
        crate::platform::outl(CONFIG_ADDRESS, config_address(bus, device, function, offset));
        crate::platform::inl(CONFIG_DATA)
    }
}

fn write_dword(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    let _guard = CONFIG_LOCK.lock();
    unsafe {
        crate::platform::outl(CONFIG_ADDRESS, config_address(bus, device, function, offset));
        crate::platform::outl(CONFIG_DATA, value);
    }
}

fn read_word(bus: u8, device: u8, function: u8, offset: u8) -> u16 {
    let dword = read_dword(bus, device, function, offset & !0x3);
    ((dword >> ((offset as u32 & 0x2) * 8)) & 0xFFFF) as u16
}

fn read_byte(bus: u8, device: u8, function: u8, offset: u8) -> u8 {
    let dword = read_dword(bus, device, function, offset & !0x3);
    ((dword >> ((offset as u32 & 0x3) * 8)) & 0xFF) as u8
}

/// Read-modify-write for a partial (byte/word) write, since the config
/// port pair only transfers aligned dwords (§4.8).
fn write_byte(bus: u8, device: u8, function: u8, offset: u8, value: u8) {
    let aligned = offset & !0x3;
    let shift = (offset as u32 & 0x3) * 8;
    let mut dword = read_dword(bus, device, function, aligned);
    dword = (dword & !(0xFFu32 << shift)) | ((value as u32) << shift);
    write_dword(bus, device, function, aligned, dword);
}

#[derive(Debug, Clone)]
pub struct PciDevice {
    pub id: u32,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub base_class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub header_type: u8,
    pub command: u16,
    pub status: u16,
    pub bars: [u32; 6],
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub msi_capable: bool,
    pub msi_cap_offset: u8,
    pub msi_64bit: bool,
    /// Bridge bus numbers (§4.8 "Enumeration"): zero for anything that
    /// isn't a PCI-to-PCI bridge (`base_class == 0x06 && subclass == 0x04`).
    pub primary_bus: u8,
    pub secondary_bus: u8,
}

impl PciDevice {
    fn id_of(bus: u8, device: u8, function: u8) -> u32 {
        (bus as u32) << 16 | (device as u32) << 11 | (function as u32) << 8
    }
}

struct PciState {
    devices: Vec<PciDevice>,
    by_id: BTreeMap<u32, usize>,
}

static STATE: GlobalState<IrqSpinlock<PciState>> = GlobalState::new();

struct ChipsetProbe {
    vendor: u16,
    device: u16,
    dev_num: u8,
    short_name: &'static str,
    long_name: &'static str,
}

/// §4.8 "Chipset probing": a static table consulted after enumeration.
const CHIPSET_TABLE: &[ChipsetProbe] = &[ChipsetProbe {
    vendor: 0x8086,
    device: 0x2918,
    dev_num: 31,
    short_name: "ich9-lpc",
    long_name: "Intel ICH9 LPC Interface Controller",
}];

fn probe_function(bus: u8, device: u8, function: u8) -> Option<PciDevice> {
    let vendor_device = read_dword(bus, device, function, REG_VENDOR_DEVICE);
    if vendor_device == 0xFFFF_FFFF {
        return None;
    }
    let vendor_id = (vendor_device & 0xFFFF) as u16;
    let device_id = (vendor_device >> 16) as u16;

    let class = read_dword(bus, device, function, REG_CLASS);
    let prog_if = ((class >> 8) & 0xFF) as u8;
    let subclass = ((class >> 16) & 0xFF) as u8;
    let base_class = ((class >> 24) & 0xFF) as u8;

    let header_type = read_byte(bus, device, function, REG_HEADER_TYPE + 0) & 0x7F;
    let command_status = read_dword(bus, device, function, REG_COMMAND_STATUS);
    let command = (command_status & 0xFFFF) as u16;
    let status = (command_status >> 16) as u16;

    let mut bars = [0u32; 6];
    let bar_count = if header_type == 0 { 6 } else { 2 };
    for (i, bar) in bars.iter_mut().enumerate().take(bar_count) {
        *bar = read_dword(bus, device, function, REG_BAR0 + (i as u8) * 4);
    }

    let interrupt = read_dword(bus, device, function, REG_INTERRUPT);
    let interrupt_line = (interrupt & 0xFF) as u8;
    let interrupt_pin = ((interrupt >> 8) & 0xFF) as u8;

    let mut msi_capable = false;
    let mut msi_cap_offset = 0u8;
    let mut msi_64bit = false;
    if status as u32 & STATUS_CAPABILITIES_LIST != 0 {
        let mut cap_ptr = read_byte(bus, device, function, REG_CAPABILITIES_PTR) & 0xFC;
        let mut guard = 0;
        while cap_ptr != 0 && guard < 48 {
            let cap_id = read_byte(bus, device, function, cap_ptr);
            if cap_id == CAP_ID_MSI {
                msi_capable = true;
                msi_cap_offset = cap_ptr;
                let msg_control = read_word(bus, device, function, cap_ptr + 2);
                msi_64bit = msg_control & (1 << 7) != 0;
                break;
            }
            cap_ptr = read_byte(bus, device, function, cap_ptr + 1) & 0xFC;
            guard += 1;
        }
    }

    Some(PciDevice {
        id: PciDevice::id_of(bus, device, function),
        bus,
        device,
        function,
        vendor_id,
        device_id,
        base_class,
        subclass,
        prog_if,
        header_type,
        command,
        status,
        bars,
        interrupt_line,
        interrupt_pin,
        msi_capable,
        msi_cap_offset,
        msi_64bit,
        primary_bus: 0,
        secondary_bus: 0,
    })
}

fn is_multifunction(header_type: u8) -> bool {
    header_type & 0x80 != 0
}

/// Enumerate starting from bus 0, draining a queue of bridge-discovered
/// buses as they're found (§4.8 "Enumeration").
pub fn enumerate() -> KernelResult<()> {
    let mut devices = Vec::new();
    let mut bus_queue: Vec<u8> = alloc::vec![0];
    let mut seen_buses = [false; 256];

    while let Some(bus) = bus_queue.pop() {
        if seen_buses[bus as usize] {
            continue;
        }
        seen_buses[bus as usize] = true;

        for device in 0..32u8 {
            let Some(f0) = probe_function(bus, device, 0) else { continue };
            let multi = is_multifunction(f0.header_type);
            let function_count = if multi { 8 } else { 1 };

            for function in 0..function_count {
                let Some(mut dev) = (if function == 0 { Some(f0.clone()) } else { probe_function(bus, device, function) }) else {
                    continue;
                };

                if dev.base_class == 0x06 && dev.subclass == 0x04 {
                    dev.primary_bus = read_byte(bus, device, function, REG_SECONDARY_BUS);
                    dev.secondary_bus = read_byte(bus, device, function, REG_SECONDARY_BUS + 1);
                    if dev.secondary_bus != 0 && !seen_buses[dev.secondary_bus as usize] {
                        bus_queue.push(dev.secondary_bus);
                    }
                }
                devices.push(dev);
            }
        }
    }

    let mut by_id = BTreeMap::new();
    for (i, dev) in devices.iter().enumerate() {
        by_id.insert(dev.id, i);
    }

    STATE
        .init(IrqSpinlock::new(PciState { devices, by_id }))
        .map_err(|_| KernelError::AlreadyRegistered { resource: "pci bus", id: 0 })?;

    probe_chipsets();
    Ok(())
}

fn probe_chipsets() {
    STATE.with(|lock| {
        let state = lock.lock();
        for probe in CHIPSET_TABLE {
            let found = state.devices.iter().any(|d| d.vendor_id == probe.vendor && d.device_id == probe.device && d.device == probe.dev_num);
            if found {
                log::info!(target: "pci", "chipset present: {} ({})", probe.short_name, probe.long_name);
            }
        }
    });
}

/// `query_all()` (§4.8 "Queries" — ADDED iterator style per §9).
pub fn query_all() -> Vec<PciDevice> {
    STATE.with(|lock| lock.lock().devices.clone()).unwrap_or_default()
}

pub fn query_by_baseclass(bc: u8) -> Vec<PciDevice> {
    query_all().into_iter().filter(|d| d.base_class == bc).collect()
}

pub fn query_by_class(bc: u8, sc: u8) -> Vec<PciDevice> {
    query_all().into_iter().filter(|d| d.base_class == bc && d.subclass == sc).collect()
}

fn with_device<R>(dev_id: u32, f: impl FnOnce(&PciDevice) -> R) -> KernelResult<R> {
    STATE
        .with(|lock| {
            let state = lock.lock();
            let idx = *state.by_id.get(&dev_id).ok_or(KernelError::NotFound { resource: "pci device", id: dev_id as u64 })?;
            Ok(f(&state.devices[idx]))
        })
        .unwrap_or(Err(KernelError::NotInitialized { subsystem: "pci" }))
}

/// Build the message address/data pair and program the MSI capability
/// (§4.8 "MSI configuration").
pub fn config_msi(dev_id: u32, vector: u8, delivery_mode: u8) -> KernelResult<()> {
    with_device(dev_id, |dev| {
        if !dev.msi_capable {
            return Err(KernelError::NotSupported { operation: "msi on non-msi-capable device" });
        }
        let (bus, device, function, cap, is_64bit) = (dev.bus, dev.device, dev.function, dev.msi_cap_offset, dev.msi_64bit);

        let msg_control = read_word(bus, device, function, cap + 2);
        write_word_at(bus, device, function, cap + 2, msg_control & !(1 << 0)); // disable first

        let bsp_id = crate::cpu::current_apic_id().map(|id| id.raw()).unwrap_or(0);
        let address: u32 = 0xFEE0_0000 | (bsp_id as u32) << 12;
        let data: u32 = vector as u32 | (delivery_mode as u32) << 8;

        write_dword(bus, device, function, cap + 4, address);
        if is_64bit {
            write_dword(bus, device, function, cap + 8, 0);
            write_dword(bus, device, function, cap + 12, data);
        } else {
            write_dword(bus, device, function, cap + 8, data);
        }

        let msg_control = read_word(bus, device, function, cap + 2);
        write_word_at(bus, device, function, cap + 2, msg_control | (1 << 0));
        Ok(())
    })?
}

pub fn disable_msi(dev_id: u32) -> KernelResult<()> {
    with_device(dev_id, |dev| {
        if !dev.msi_capable {
            return Ok(());
        }
        let (bus, device, function, cap) = (dev.bus, dev.device, dev.function, dev.msi_cap_offset);
        let msg_control = read_word(bus, device, function, cap + 2);
        write_word_at(bus, device, function, cap + 2, msg_control & !(1 << 0));
        Ok(())
    })?
}

fn write_word_at(bus: u8, device: u8, function: u8, offset: u8, value: u16) {
    write_byte(bus, device, function, offset, (value & 0xFF) as u8);
    write_byte(bus, device, function, offset + 1, (value >> 8) as u8);
}

/// `enable_bus_master_dma(dev)` (§4.8 "Bus mastering").
pub fn enable_bus_master_dma(dev_id: u32) -> KernelResult<()> {
    let (bus, device, function, command) = with_device(dev_id, |dev| (dev.bus, dev.device, dev.function, dev.command))?;
    let new_command = command as u32 | COMMAND_BUS_MASTER;
    write_dword(bus, device, function, REG_COMMAND_STATUS, new_command);
    let confirm = read_word(bus, device, function, REG_COMMAND_STATUS);
    if confirm as u32 & COMMAND_BUS_MASTER == 0 {
        return Err(KernelError::Fatal { reason: "bus master bit did not stick" });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_address_sets_enable_bit_and_fields() {
        let addr = config_address(1, 2, 3, 0x10);
        assert_eq!(addr & 0x8000_0000, 0x8000_0000);
        assert_eq!((addr >> 16) & 0xFF, 1);
        assert_eq!((addr >> 11) & 0x1F, 2);
        assert_eq!((addr >> 8) & 0x7, 3);
        assert_eq!(addr & 0xFC, 0x10);
    }
}
