//! # Page Tables and Their Entries
//!
//! One table layout serves all four levels: 512 raw 64-bit entries in one
//! 4 KiB-aligned frame. An entry combines a page-aligned physical address
//! (bits `[51:12]`) with flag bits; the all-zero entry means "unmapped".
//!
//! - Non-leaf entries name the next table down and are always created
//!   present + writable; access control lives entirely in the leaf.
//! - Leaf entries carry the caller's [`PageFlags`] verbatim.

use crate::{PAGE_SIZE, PageFlags, PhysAddr, TABLE_ENTRIES};

/// Mask of the physical-address field inside an entry (bits `[51:12]`).
const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// A single 64-bit page-table entry, usable at any level.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PageTableEntry(u64);

/// One page table: 512 entries, exactly one 4 KiB-aligned physical page.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTableEntry {
    /// The unmapped entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// A leaf entry: maps one 4 KiB page at `page` with the caller's flags.
    ///
    /// [`PRESENT`](PageFlags::PRESENT) is always set; every other bit is
    /// taken from `flags` verbatim. `page` must be 4 KiB-aligned.
    #[inline]
    #[must_use]
    pub fn leaf(page: PhysAddr, flags: PageFlags) -> Self {
        debug_assert!(page.is_page_aligned());
        Self(page.as_u64() | (flags | PageFlags::PRESENT).bits())
    }

    /// A non-leaf entry pointing at the next table down.
    ///
    /// Always present + writable; leaf flags decide actual access rights.
    #[inline]
    #[must_use]
    pub fn table(table: PhysAddr) -> Self {
        debug_assert!(table.is_page_aligned());
        Self(table.as_u64() | (PageFlags::PRESENT | PageFlags::WRITABLE).bits())
    }

    #[inline]
    #[must_use]
    pub const fn is_unused(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & PageFlags::WRITABLE.bits() != 0
    }

    /// The physical address field, with all flag bits masked out.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ENTRY_ADDR_MASK)
    }

    /// The flag bits, with the address field masked out.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_retain(self.0 & !ENTRY_ADDR_MASK)
    }

    /// The raw 64-bit word (address | flags).
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageTableEntry(0x{:016x})", self.0)
    }
}

impl PageTable {
    /// A fully zeroed table (all entries unmapped).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); TABLE_ENTRIES],
        }
    }

    /// Clear every entry in place.
    #[inline]
    pub const fn zero(&mut self) {
        self.entries = [PageTableEntry::zero(); TABLE_ENTRIES];
    }

    /// Read the entry at `i` (`i < 512`).
    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageTableEntry {
        self.entries[i]
    }

    /// Write the entry at `i` (`i < 512`).
    #[inline]
    pub const fn set(&mut self, i: usize, e: PageTableEntry) {
        self.entries[i] = e;
    }

    /// Number of present entries; diagnostic helper.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

// One table must fill one page exactly.
const _: () = assert!(core::mem::size_of::<PageTable>() as u64 == PAGE_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_combines_address_and_flags() {
        let e = PageTableEntry::leaf(
            PhysAddr::new(0x10_0000),
            PageFlags::WRITABLE | PageFlags::NX,
        );
        assert!(e.is_present());
        assert!(e.is_writable());
        assert_eq!(e.addr().as_u64(), 0x10_0000);
        assert_eq!(
            e.raw(),
            0x10_0000 | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NX).bits()
        );
    }

    #[test]
    fn table_entry_is_present_and_writable() {
        let e = PageTableEntry::table(PhysAddr::new(0x20_3000));
        assert!(e.is_present());
        assert!(e.is_writable());
        assert_eq!(e.addr().as_u64(), 0x20_3000);
    }

    #[test]
    fn addr_masks_all_flag_bits() {
        let e = PageTableEntry::leaf(
            PhysAddr::new(0x7fff_f000),
            PageFlags::from_bits_retain((0b111 << 9) | PageFlags::NX.bits()),
        );
        assert_eq!(e.addr().as_u64(), 0x7fff_f000);
        assert!(e.flags().contains(PageFlags::NX));
    }

    #[test]
    fn zeroed_table_is_empty() {
        let t = PageTable::zeroed();
        assert_eq!(t.present_count(), 0);
        assert!(t.get(0).is_unused());
        assert!(t.get(TABLE_ENTRIES - 1).is_unused());
    }
}
