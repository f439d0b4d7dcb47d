//! Construction of the kernel address-space hierarchy.
//!
//! While boot services are still running the loader executes with the
//! firmware's identity mapping active, so physical frames can be touched
//! directly and new table frames come straight from the firmware page
//! allocator.

#![allow(unsafe_code)]

use boot_mmap::MemoryRegion;
use boot_vmem::{
    AddressSpace, FrameAlloc, MapError, PAGE_SIZE, PageFlags, PhysAddr, PhysMapper, VirtAddr,
};
use log::{debug, info};
use uefi::boot;
use uefi::boot::{AllocateType, MemoryType};

/// Size of the kernel stack in 4 KiB pages.
pub const KERNEL_STACK_PAGES: u64 = 2;

/// Initial kernel stack pointer. One page below the very top of the 48-bit
/// window: the top page itself cannot be mapped, so the stack region ends at
/// `0xffff_ffff_ffff_f000` and grows down from there.
pub const KERNEL_STACK_PTR: u64 = 0xffff_ffff_ffff_f000;

/// Lowest virtual address of the kernel stack region.
pub const KERNEL_STACK_ADDR: u64 = KERNEL_STACK_PTR - KERNEL_STACK_PAGES * PAGE_SIZE;

/// Errors while building the kernel hierarchy.
#[derive(Debug, thiserror::Error)]
pub enum LoaderVmemError {
    /// The firmware could not provide a frame for the root table.
    #[error("failed to allocate the root page table")]
    OutOfMemoryRoot,
    /// A mapping request failed.
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Frame allocator backed by the UEFI page allocator.
///
/// Only valid while boot services are active; every hierarchy frame is
/// allocated as `LOADER_DATA` so the firmware reports it as mapped loader
/// memory in the final memory map.
struct BsFrameAlloc;

impl FrameAlloc for BsFrameAlloc {
    fn alloc_zeroed_4k(&mut self) -> Option<PhysAddr> {
        let base = boot::allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, 1).ok()?;
        // SAFETY: a single freshly allocated page owned by us, reachable
        // through the firmware identity mapping.
        unsafe {
            core::ptr::write_bytes(base.as_ptr(), 0, PAGE_SIZE as usize);
        }
        Some(PhysAddr::new(base.as_ptr() as u64))
    }
}

/// Identity view of physical memory, as provided by the firmware before
/// `ExitBootServices`: a physical address *is* a valid pointer.
pub struct LoaderPhysMapper;

impl PhysMapper for LoaderPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
        // SAFETY: deferred to the caller; under the identity mapping the
        // physical address is the virtual address.
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}

/// Build the kernel address space: identity-map every region the kernel needs
/// to keep reachable, then map the stack just below the top of the window.
///
/// Returns the physical address of the new root table, ready for CR3.
///
/// # Errors
///
/// Fails if the firmware runs out of pages or a region cannot be mapped.
pub fn create_kernel_address_space(
    regions: &[MemoryRegion],
    stack_phys: PhysAddr,
) -> Result<PhysAddr, LoaderVmemError> {
    let mut alloc = BsFrameAlloc;
    let root = alloc
        .alloc_zeroed_4k()
        .ok_or(LoaderVmemError::OutOfMemoryRoot)?;

    let mapper = LoaderPhysMapper;
    let space = AddressSpace::new(&mapper, root);

    for region in regions {
        if !region.kind.is_mapped() {
            continue;
        }
        debug!(
            "Mapping {} at {} ({} pages)",
            region.kind, region.start, region.page_count
        );
        space.map_range(
            &mut alloc,
            VirtAddr::new(region.start.as_u64()),
            region.start,
            region.page_count,
            PageFlags::WRITABLE,
        )?;
    }

    // The kernel stack lives at the very top of the window, backed by pages
    // the loader allocated below.
    space.map_range(
        &mut alloc,
        VirtAddr::new(KERNEL_STACK_ADDR),
        stack_phys,
        KERNEL_STACK_PAGES,
        PageFlags::WRITABLE,
    )?;

    info!(
        "Kernel address space built, root at {}, stack top at {}",
        root,
        VirtAddr::new(KERNEL_STACK_PTR)
    );
    Ok(root)
}
