//! CPU registry (§4.6).
//!
//! Each detected CPU is added with `(lapic_id, is_bsp, apic_ver)` in status
//! `Identified`. When an AP's boot code runs, it transitions its entry to
//! `Up` and attaches a [`CpuInfo`] populated by executing `CPUID`.

extern crate alloc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::platform::{cpuid, ApicId};
use crate::sync::{GlobalState, IrqSpinlock};

const MODULE: &str = "cpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Identified,
    Up,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuInfo {
    pub vendor: [u8; 12],
    pub brand_signature: u32,
    pub feature_ecx: u32,
    pub feature_edx: u32,
    pub thermal_ecx: u32,
    pub has_fxsave: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CpuEntry {
    pub lapic_id: ApicId,
    pub is_bsp: bool,
    pub apic_ver: u8,
    pub status: Status,
    pub info: Option<CpuInfo>,
}

struct Registry {
    entries: Vec<CpuEntry>,
}

static REGISTRY: GlobalState<IrqSpinlock<Registry>> = GlobalState::new();

/// Seed the registry from the config-table parse (§4.5); the BSP's entry is
/// additionally initialised synchronously (its `CpuInfo` is attached here,
/// since it never goes through the AP boot path).
pub fn init() -> KernelResult<()> {
    let entries = crate::config::with(|tables| {
        tables
            .cpus
            .iter()
            .map(|c| CpuEntry {
                lapic_id: ApicId::from_raw(c.lapic_id),
                is_bsp: c.is_bsp,
                apic_ver: c.apic_ver,
                status: Status::Identified,
                info: None,
            })
            .collect::<Vec<_>>()
    })
    .unwrap_or_default();

    REGISTRY
        .init(IrqSpinlock::new(Registry { entries }))
        .map_err(|_| KernelError::AlreadyRegistered { resource: "cpu registry", id: 0 })?;

    if let Some(bsp_id) = bsp_lapic_id() {
        identify_running_cpu(bsp_id)?;
    }
    crate::pm::set_cpu_count(count() as u32);
    Ok(())
}

fn bsp_lapic_id() -> Option<ApicId> {
    REGISTRY.with(|lock| lock.lock().entries.iter().find(|e| e.is_bsp).map(|e| e.lapic_id)).flatten()
}

/// Run CPUID on the currently executing CPU and attach the result to its
/// registry entry, transitioning it to `Up`. Rejects CPUs lacking FXSAVE
/// (CPUID leaf 1, EDX bit 24).
pub fn identify_running_cpu(lapic_id: ApicId) -> KernelResult<()> {
    let (_, ebx, ecx, edx) = cpuid(0, 0);
    let mut vendor = [0u8; 12];
    vendor[0..4].copy_from_slice(&ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&edx.to_le_bytes());
    vendor[8..12].copy_from_slice(&ecx.to_le_bytes());

    let (eax1, _, ecx1, edx1) = cpuid(1, 0);
    let has_fxsave = edx1 & (1 << 24) != 0;
    if !has_fxsave {
        return Err(KernelError::NotSupported { operation: "cpu without fxsave" });
    }
    let (_, _, thermal_ecx, _) = cpuid(6, 0);

    let info = CpuInfo {
        vendor,
        brand_signature: eax1,
        feature_ecx: ecx1,
        feature_edx: edx1,
        thermal_ecx,
        has_fxsave,
    };

    REGISTRY
        .with_mut(|lock| {
            let mut reg = lock.lock();
            let entry = reg
                .entries
                .iter_mut()
                .find(|e| e.lapic_id == lapic_id)
                .ok_or(KernelError::NotFound { resource: "cpu", id: lapic_id.raw() as u64 })?;
            entry.status = Status::Up;
            entry.info = Some(info);
            log::info!(target: MODULE, "cpu {} up ({})", lapic_id.raw(), if entry.is_bsp { "BSP" } else { "AP" });
            Ok(())
        })
        .unwrap_or(Err(KernelError::NotInitialized { subsystem: "cpu" }))
}

pub fn count() -> usize {
    REGISTRY.with(|lock| lock.lock().entries.len()).unwrap_or(0)
}

pub fn up_count() -> usize {
    REGISTRY
        .with(|lock| lock.lock().entries.iter().filter(|e| e.status == Status::Up).count())
        .unwrap_or(0)
}

pub fn current_apic_id() -> Option<ApicId> {
    crate::arch::x86::apic::local_apic_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_registry_has_no_cpus() {
        let reg = Registry { entries: Vec::new() };
        assert_eq!(reg.entries.len(), 0);
    }
}
