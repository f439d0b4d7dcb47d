//! # Boot-Time Virtual Memory
//!
//! Minimal x86-64 paging support for the loader: build a private four-level
//! page-table hierarchy for the kernel, map physical ranges into it, and
//! perform the one-shot switch onto the new root and stack.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Only the low 48 bits of a virtual address take part in translation. They
//! split into four 9-bit table indices plus a 12-bit in-page offset:
//!
//! ```text
//! | 47..39 | 38..30 | 29..21 | 20..12 | 11..0  |
//! |  PML4  |  PDPT  |   PD   |   PT   | Offset |
//! ```
//!
//! Each level is a 4 KiB table of 512 eight-byte entries. A PML4 entry points
//! to a PDPT, a PDPT entry to a PD, a PD entry to a PT, and a PT entry (the
//! leaf) maps one 4 KiB physical page. One PML4 exists per address space; its
//! physical address is what CR3 holds while the space is active.
//!
//! ## What you get
//!
//! - [`PhysAddr`]/[`VirtAddr`] newtypes and the pure index decomposition
//!   ([`VirtAddr::table_indices`]).
//! - A 4 KiB-aligned [`PageTable`] of raw 64-bit [`PageTableEntry`] words.
//! - [`PageFlags`] for leaf permissions; extra bits pass through verbatim.
//! - [`AddressSpace`], whose [`map_range`](AddressSpace::map_range) walks and
//!   lazily extends the hierarchy with correct 512-entry boundary carry.
//! - [`switch::activate`], the irreversible CR3 + stack handoff.
//! - Tiny collaborator seams ([`FrameAlloc`], [`PhysMapper`]) so everything
//!   above the hardware switch is unit-testable against simulated memory.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod address_space;
mod addresses;
mod page_table;
pub mod switch;

pub use crate::address_space::{AddressSpace, MapError};
pub use crate::addresses::{PhysAddr, TableIndices, VirtAddr};
pub use crate::page_table::{PageTable, PageTableEntry};

/// Size of one page and of one page table, in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Number of entries in a page table at every level.
pub const TABLE_ENTRIES: usize = 512;

bitflags::bitflags! {
    /// Page-table entry flags.
    ///
    /// [`PRESENT`](Self::PRESENT) and [`WRITABLE`](Self::WRITABLE) are the
    /// bits this subsystem interprets. The remaining architectural bits are
    /// recognized so callers can pass them through to leaf entries verbatim;
    /// the builder itself never sets or clears them.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFlags: u64 {
        /// Entry is valid; a zero entry means "unmapped".
        const PRESENT  = 1 << 0;

        /// Writes are permitted. Absent means read/execute-only semantics
        /// at the leaf.
        const WRITABLE = 1 << 1;

        /// Accessible from user mode (CPL=3).
        const USER     = 1 << 2;

        /// Write-through caching.
        const WT       = 1 << 3;

        /// Caching disabled (MMIO and friends).
        const CD       = 1 << 4;

        /// Set by the CPU on first access.
        const ACCESSED = 1 << 5;

        /// Set by the CPU on first write (leaf only).
        const DIRTY    = 1 << 6;

        /// Large-page flag. This builder maps 4 KiB pages only and never
        /// sets it.
        const PS       = 1 << 7;

        /// TLB entry survives CR3 reloads (leaf only, needs CR4.PGE).
        const GLOBAL   = 1 << 8;

        /// No-execute (needs EFER.NXE).
        const NX       = 1 << 63;
    }
}

/// Collaborator primitive supplying physical 4 KiB frames for page tables
/// and mapping targets.
///
/// The implementation decides where frames come from (firmware allocator,
/// memory-map bump pool, ...). Returned frames **must** be 4 KiB-aligned and
/// **zero-filled**; the builder installs them as tables without clearing them
/// again.
///
/// Returns `None` on out-of-memory, which the builder reports as
/// [`MapError::OutOfFrames`].
pub trait FrameAlloc {
    /// Allocate one zeroed, page-aligned 4 KiB physical frame.
    fn alloc_zeroed_4k(&mut self) -> Option<PhysAddr>;
}

/// Converts physical addresses to usable pointers in the *current* address
/// space.
///
/// In the loader this is the firmware identity map; in tests it is a
/// simulated RAM. Keeping the conversion behind a trait is what makes the
/// builder testable without hardware translation.
///
/// # Safety
///
/// - `pa` must be mapped and writable in the current page tables for the
///   lifetime of the returned reference.
/// - `T` must match the bytes at `pa`.
pub trait PhysMapper {
    /// Convert a physical address to a mutable reference.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T;
}

/// View the page table stored in the physical frame at `phys`.
///
/// # Safety
/// - `phys` must point to a valid, writable 4 KiB page-table frame.
#[inline]
pub(crate) unsafe fn get_table<'a, M: PhysMapper>(m: &M, phys: PhysAddr) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(phys) }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two; `x + (a - 1)` must not overflow.
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}
