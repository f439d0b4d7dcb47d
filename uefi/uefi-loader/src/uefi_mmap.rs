//! # UEFI Memory Map Utilities
//!
//! Retrieval and conversion of the firmware memory map, and the boot-services
//! exit that freezes it.

use alloc::vec::Vec;
use boot_mmap::{MemoryRegion, RegionKind};
use boot_vmem::PhysAddr;
use log::info;
use uefi::boot::MemoryType;
use uefi::mem::memory_map::{MemoryMap, MemoryMapOwned};
use uefi::{Status, boot};

/// How many leading entries a memory-map dump prints.
const DUMP_ENTRIES: usize = 10;

/// Snapshot the current firmware memory map as loader-side regions.
///
/// # Errors
///
/// Propagates the firmware status if the map cannot be retrieved.
pub fn memory_regions() -> Result<Vec<MemoryRegion>, Status> {
    let map = boot::memory_map(MemoryType::LOADER_DATA).map_err(|e| e.status())?;

    let mut regions = Vec::with_capacity(map.len());
    for desc in map.entries() {
        regions.push(MemoryRegion {
            start: PhysAddr::new(desc.phys_start),
            page_count: desc.page_count,
            kind: region_kind(desc.ty),
        });
    }
    Ok(regions)
}

/// Log the start of the memory map, like firmware shells do. The full map on
/// real hardware runs to hundreds of entries; the first few are enough to see
/// where the loader ended up.
pub fn log_memory_map(regions: &[MemoryRegion]) {
    info!("Memory map: {} regions", regions.len());
    for region in regions.iter().take(DUMP_ENTRIES) {
        info!(
            "  {} +{:5} pages {}",
            region.start, region.page_count, region.kind
        );
    }
    if regions.len() > DUMP_ENTRIES {
        info!("  ... {} more", regions.len() - DUMP_ENTRIES);
    }
}

/// Exit the UEFI boot services.
///
/// After this returns the firmware allocator and console are gone; the caller
/// must keep the returned map alive for as long as it inspects memory.
pub fn exit_boot_services() -> MemoryMapOwned {
    info!("Exiting boot services ...");
    // SAFETY: the loader makes no further boot-services calls; the global
    // allocator is not used past this point.
    unsafe { boot::exit_boot_services(None) }
}

fn region_kind(ty: MemoryType) -> RegionKind {
    match ty {
        MemoryType::LOADER_CODE => RegionKind::LoaderCode,
        MemoryType::LOADER_DATA => RegionKind::LoaderData,
        MemoryType::BOOT_SERVICES_CODE => RegionKind::BootServicesCode,
        MemoryType::BOOT_SERVICES_DATA => RegionKind::BootServicesData,
        MemoryType::RUNTIME_SERVICES_CODE => RegionKind::RuntimeServicesCode,
        MemoryType::RUNTIME_SERVICES_DATA => RegionKind::RuntimeServicesData,
        MemoryType::CONVENTIONAL => RegionKind::Conventional,
        MemoryType::UNUSABLE => RegionKind::Unusable,
        MemoryType::ACPI_RECLAIM => RegionKind::AcpiReclaim,
        MemoryType::ACPI_NON_VOLATILE => RegionKind::AcpiNonVolatile,
        MemoryType::MMIO => RegionKind::Mmio,
        MemoryType::MMIO_PORT_SPACE => RegionKind::MmioPortSpace,
        MemoryType::PAL_CODE => RegionKind::PalCode,
        _ => RegionKind::Reserved,
    }
}
