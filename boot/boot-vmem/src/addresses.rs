//! # Virtual and Physical Memory Addresses

use core::ops::{Add, AddAssign};

/// Bits of a virtual address that take part in translation.
///
/// Anything at bit 48 and above is masked off before decomposition. Canonical
/// sign-extension is deliberately **not** validated: non-canonical inputs are
/// accepted-and-masked, matching the source behavior.
pub(crate) const VADDR_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// One past the highest translatable virtual address (the 48-bit window).
pub(crate) const VADDR_SPAN: u64 = 1 << 48;

/// A **physical** memory address (machine bus address).
///
/// Newtype over `u64` to prevent mixing with virtual addresses. Must be
/// page-aligned when naming a page table or a mapping target.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct PhysAddr(u64);

/// A **virtual** memory address.
///
/// Newtype over `u64` to prevent mixing with physical addresses.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct VirtAddr(u64);

/// The four table indices of a virtual address, outermost to innermost.
///
/// Produced by [`VirtAddr::table_indices`]; each value is in `0..512`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TableIndices {
    /// Level-4 (PML4, root) index, VA bits `[47:39]`.
    pub pml4: usize,
    /// Level-3 (PDPT) index, VA bits `[38:30]`.
    pub pdpt: usize,
    /// Level-2 (PD) index, VA bits `[29:21]`.
    pub pd: usize,
    /// Level-1 (PT, leaf) index, VA bits `[20:12]`.
    pub pt: usize,
}

impl PhysAddr {
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the address is 4 KiB-aligned.
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & 0xfff == 0
    }
}

impl VirtAddr {
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the address is 4 KiB-aligned.
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & 0xfff == 0
    }

    /// Decompose into the four per-level table indices.
    ///
    /// Pure bit extraction; bits 48..64 are ignored per [`VADDR_MASK`].
    #[must_use]
    pub const fn table_indices(self) -> TableIndices {
        let va = self.0 & VADDR_MASK;
        TableIndices {
            pml4: ((va >> 39) & 0x1ff) as usize,
            pdpt: ((va >> 30) & 0x1ff) as usize,
            pd: ((va >> 21) & 0x1ff) as usize,
            pt: ((va >> 12) & 0x1ff) as usize,
        }
    }

    /// The 12-bit offset within the containing 4 KiB page.
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & 0xfff
    }
}

impl core::fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:018x}", self.0)
    }
}

impl core::fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:018x} (Physical)", self.0)
    }
}

impl core::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:018x}", self.0)
    }
}

impl core::fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:018x} (Virtual)", self.0)
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("PhysAddr add"))
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("VirtAddr add"))
    }
}

impl AddAssign<u64> for PhysAddr {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl AddAssign<u64> for VirtAddr {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl From<u64> for PhysAddr {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<u64> for VirtAddr {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_decomposition() {
        // 0xffff_8000_0030_5123: a typical higher-half address.
        let va = VirtAddr::new(0xffff_8000_0030_5123);
        let ix = va.table_indices();
        assert_eq!(ix.pml4, 256);
        assert_eq!(ix.pdpt, 0);
        assert_eq!(ix.pd, 1);
        assert_eq!(ix.pt, 261);
        assert_eq!(va.page_offset(), 0x123);
    }

    #[test]
    fn index_decomposition_zero_and_top() {
        let zero = VirtAddr::new(0).table_indices();
        assert_eq!(
            zero,
            TableIndices {
                pml4: 0,
                pdpt: 0,
                pd: 0,
                pt: 0
            }
        );

        let top = VirtAddr::new(0xffff_ffff_ffff_f000).table_indices();
        assert_eq!(
            top,
            TableIndices {
                pml4: 511,
                pdpt: 511,
                pd: 511,
                pt: 511
            }
        );
    }

    #[test]
    fn non_canonical_bits_are_masked() {
        // Same low 48 bits, wildly different high bits: identical indices.
        let canonical = VirtAddr::new(0x0000_7fff_ffe0_0000);
        let garbage = VirtAddr::new(0xdead_7fff_ffe0_0000);
        assert_eq!(canonical.table_indices(), garbage.table_indices());
    }

    #[test]
    fn alignment_checks() {
        assert!(PhysAddr::new(0x10_0000).is_page_aligned());
        assert!(!PhysAddr::new(0x10_0800).is_page_aligned());
        assert!(VirtAddr::new(0xffff_ffff_ffff_f000).is_page_aligned());
    }
}
