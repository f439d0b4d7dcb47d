//! # UEFI Loader
//!
//! A minimal UEFI application that takes the machine from firmware control to
//! its own address space:
//!
//! ```text
//! UEFI Firmware Boot
//!         ↓
//! ┌─────────────────────────────────────────────┐
//! │              UEFI Loader                    │
//! ├─────────────────────────────────────────────┤
//! │  1. Environment Setup                       │
//! │     • Initialize logging and allocator      │
//! │  2. Memory Discovery                        │
//! │     • Snapshot the firmware memory map      │
//! │     • Allocate the kernel stack             │
//! │  3. Virtual Memory Setup                    │
//! │     • Build the page-table hierarchy        │
//! │     • Identity-map loader and firmware      │
//! │     • Map the stack below the window top    │
//! │  4. Environment Transition                  │
//! │     • Exit UEFI boot services               │
//! │     • Switch CR3 and stack, jump onward     │
//! └─────────────────────────────────────────────┘
//!         ↓
//! Kernel Execution
//! ```
//!
//! Everything up to the switch runs under the firmware's identity mapping;
//! the switch itself is the irreversible step and is delegated to
//! [`boot_vmem::switch`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![no_main]
#![allow(unsafe_code)]
extern crate alloc;

mod logger;
mod memory;
mod uefi_mmap;
mod vmem;

use crate::logger::{DebugPort, UefiLogger};
use crate::memory::alloc_kernel_stack;
use crate::vmem::{KERNEL_STACK_PAGES, KERNEL_STACK_PTR, create_kernel_address_space};
use boot_vmem::{VirtAddr, switch};
use log::{LevelFilter, error, info};
use uefi::prelude::*;

#[entry]
fn efi_main() -> Status {
    // Initialize logging and allocator helpers
    if uefi::helpers::init().is_err() {
        return Status::UNSUPPORTED;
    }

    let logger = UefiLogger::new(LevelFilter::Debug);
    let Ok(logger) = logger.init() else {
        return Status::UNSUPPORTED;
    };

    info!("UEFI loader starting");

    let regions = match uefi_mmap::memory_regions() {
        Ok(regions) => regions,
        Err(status) => {
            error!("Failed to read the memory map: {status:?}");
            return status;
        }
    };
    uefi_mmap::log_memory_map(&regions);

    let stack_phys = match alloc_kernel_stack(KERNEL_STACK_PAGES) {
        Ok(base) => base,
        Err(status) => {
            // Physical exhaustion is boot-fatal; stop cleanly instead of
            // continuing with a partial setup.
            error!("Failed to allocate the kernel stack: {status:?}");
            halt()
        }
    };
    info!("Kernel stack at {stack_phys} ({KERNEL_STACK_PAGES} pages)");

    let root = match create_kernel_address_space(&regions, stack_phys) {
        Ok(root) => root,
        Err(e) => {
            error!("Failed to build the kernel address space: {e}");
            halt()
        }
    };

    info!("Switching address space");
    logger.exit_boot_services();
    let owned_map = uefi_mmap::exit_boot_services();
    // The firmware map must outlive the loader image; the switch never
    // returns, so dropping it is unreachable anyway.
    core::mem::forget(owned_map);

    // SAFETY: the hierarchy behind `root` identity-maps the loader image
    // (LoaderCode) and backs the stack region ending at the given top; the
    // continuation only touches port I/O and its own stack.
    unsafe {
        switch::activate(
            root,
            VirtAddr::new(KERNEL_STACK_PTR),
            VirtAddr::from_ptr(kernel_handoff as *const ()),
            root.as_u64(),
        )
    }
}

/// First code on the other side of the switch. Stands in for a kernel entry
/// point: reports over the debug port and parks the CPU.
extern "sysv64" fn kernel_handoff(root: u64) -> ! {
    DebugPort::write_bytes(b"kernel handoff reached, cr3=");
    let mut buf = [0u8; 16];
    for (i, b) in buf.iter_mut().enumerate() {
        let nibble = (root >> (60 - 4 * i)) & 0xf;
        *b = b"0123456789abcdef"[nibble as usize];
    }
    DebugPort::write_bytes(&buf);
    DebugPort::write_bytes(b"\n");
    halt()
}

fn halt() -> ! {
    loop {
        // SAFETY: halting with interrupts off is the terminal state.
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}
