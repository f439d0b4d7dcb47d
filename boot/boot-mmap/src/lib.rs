//! # Boot-Time Physical Memory Map
//!
//! The collaborator side of the virtual-memory core: a firmware-agnostic
//! description of physical memory ranges, plus a bump frame allocator over
//! the usable ranges that implements [`boot_vmem::FrameAlloc`].
//!
//! The core never interprets region classifications; they exist so the
//! loader can decide *what* to map and where table frames may come from.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

use alloc::vec::Vec;
use boot_vmem::{FrameAlloc, PAGE_SIZE, PhysAddr, PhysMapper, align_up};

/// Firmware classification of a physical memory range.
///
/// Mirrors the UEFI memory descriptor types one-to-one; only
/// [`Conventional`](Self::Conventional) memory is handed out as frames.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Not to be used.
    Reserved,
    /// The loader's own executable code.
    LoaderCode,
    /// The loader's own data and allocations.
    LoaderData,
    /// Firmware boot-services code; reclaimable after the boot-services
    /// exit.
    BootServicesCode,
    /// Firmware boot-services data; reclaimable after the boot-services
    /// exit.
    BootServicesData,
    /// Firmware runtime-services code; must stay mapped if runtime services
    /// are to be called.
    RuntimeServicesCode,
    /// Firmware runtime-services data.
    RuntimeServicesData,
    /// Free general-purpose memory.
    Conventional,
    /// Memory with detected errors.
    Unusable,
    /// ACPI tables; reclaimable once consumed.
    AcpiReclaim,
    /// ACPI non-volatile storage.
    AcpiNonVolatile,
    /// Memory-mapped I/O.
    Mmio,
    /// Memory-mapped I/O port space.
    MmioPortSpace,
    /// Processor firmware/microcode.
    PalCode,
}

impl RegionKind {
    /// The canonical firmware name, as shown in memory-map dumps.
    #[must_use]
    pub const fn firmware_name(self) -> &'static str {
        match self {
            Self::Reserved => "EfiReservedMemoryType",
            Self::LoaderCode => "EfiLoaderCode",
            Self::LoaderData => "EfiLoaderData",
            Self::BootServicesCode => "EfiBootServicesCode",
            Self::BootServicesData => "EfiBootServicesData",
            Self::RuntimeServicesCode => "EfiRuntimeServicesCode",
            Self::RuntimeServicesData => "EfiRuntimeServicesData",
            Self::Conventional => "EfiConventionalMemory",
            Self::Unusable => "EfiUnusableMemory",
            Self::AcpiReclaim => "EfiACPIReclaimMemory",
            Self::AcpiNonVolatile => "EfiACPIMemoryNVS",
            Self::Mmio => "EfiMemoryMappedIO",
            Self::MmioPortSpace => "EfiMemoryMappedIOPortSpace",
            Self::PalCode => "EfiPalCode",
        }
    }

    /// Whether frames may be allocated from a region of this kind.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Conventional)
    }

    /// Whether the loader keeps a region of this kind identity-mapped in the
    /// kernel hierarchy (its own image, firmware leftovers it still runs on,
    /// and free memory).
    #[must_use]
    pub const fn is_mapped(self) -> bool {
        matches!(
            self,
            Self::LoaderCode
                | Self::LoaderData
                | Self::BootServicesCode
                | Self::BootServicesData
                | Self::RuntimeServicesCode
                | Self::RuntimeServicesData
                | Self::Conventional
        )
    }
}

impl core::fmt::Display for RegionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.firmware_name())
    }
}

/// One record of the firmware memory map: a run of whole physical pages with
/// one classification.
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    /// First byte of the region; page-aligned in well-formed maps.
    pub start: PhysAddr,
    /// Length in 4 KiB pages.
    pub page_count: u64,
    /// Firmware classification.
    pub kind: RegionKind,
}

impl MemoryRegion {
    /// One past the last byte of the region.
    #[must_use]
    pub fn end(&self) -> PhysAddr {
        self.start + self.page_count * PAGE_SIZE
    }
}

/// Bump allocator over the conventional ranges of a memory map.
///
/// Hands out one frame after another, region by region, and never reuses or
/// frees one, which is all boot-time page-table construction needs. Frames
/// are zeroed through the mapper before they are handed out, satisfying the
/// [`FrameAlloc`] contract even when firmware left the memory dirty.
pub struct BootFrameAlloc<'m, M: PhysMapper> {
    mapper: &'m M,
    /// Current region as `[next, end)` byte addresses.
    next: u64,
    end: u64,
    /// Remaining regions as `(start, end)` byte ranges.
    rest: alloc::vec::IntoIter<(u64, u64)>,
}

impl<'m, M: PhysMapper> BootFrameAlloc<'m, M> {
    /// Build from a memory map; everything not
    /// [`is_usable`](RegionKind::is_usable) is ignored.
    #[must_use]
    pub fn new(mapper: &'m M, map: &[MemoryRegion]) -> Self {
        let mut ranges = Vec::new();
        for region in map {
            if !region.kind.is_usable() {
                continue;
            }
            let start = align_up(region.start.as_u64(), PAGE_SIZE);
            let end = region.end().as_u64();
            if end > start {
                ranges.push((start, end));
            }
        }
        ranges.sort_unstable();

        let mut rest = ranges.into_iter();
        let (next, end) = rest.next().unwrap_or((0, 0));
        Self {
            mapper,
            next,
            end,
            rest,
        }
    }

    fn next_frame(&mut self) -> Option<u64> {
        loop {
            if self.next + PAGE_SIZE <= self.end {
                let p = self.next;
                self.next += PAGE_SIZE;
                return Some(p);
            }
            let (next, end) = self.rest.next()?;
            self.next = next;
            self.end = end;
        }
    }
}

impl<M: PhysMapper> FrameAlloc for BootFrameAlloc<'_, M> {
    fn alloc_zeroed_4k(&mut self) -> Option<PhysAddr> {
        let pa = PhysAddr::new(self.next_frame()?);
        // SAFETY: `pa` is a whole conventional frame the allocator owns;
        // the mapper makes it reachable and writable.
        let bytes: &mut [u8; 4096] = unsafe { self.mapper.phys_to_mut(pa) };
        bytes.fill(0);
        Some(pa)
    }
}
