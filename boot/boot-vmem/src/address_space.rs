//! # Address Space (PML4-rooted)
//!
//! Builds and extends a **single** virtual address space: a four-level table
//! tree rooted at a PML4 frame. The active space is always modeled as an
//! explicit value (the root's physical address) rather than ambient machine
//! state, so construction and translation are testable behind a simulated
//! [`PhysMapper`].
//!
//! ## Design
//!
//! - [`AddressSpace::map_range`] installs a contiguous run of 4 KiB leaf
//!   mappings, allocating intermediate tables lazily from a [`FrameAlloc`]
//!   and carrying table indices across 512-entry boundaries at every level.
//! - Non-leaf entries are always created present + writable; access control
//!   is decided entirely by the leaf flags.
//! - Leaf entries are written unconditionally: remapping an already-mapped
//!   page silently overwrites it. That is a documented contract, not an
//!   oversight; [`AddressSpace::map_range_checked`] is the opt-in strict
//!   variant.
//! - Intermediate tables are owned transitively by the root and are never
//!   freed; no teardown path exists at this layer.

use crate::addresses::{VADDR_MASK, VADDR_SPAN};
use crate::{
    FrameAlloc, PAGE_SIZE, PageFlags, PageTable, PageTableEntry, PhysAddr, PhysMapper,
    TABLE_ENTRIES, VirtAddr, get_table,
};

/// Why a mapping request could not be satisfied.
///
/// Both variants are boot-time fatal for the caller: there is no supervisor
/// to degrade to, so the loader logs and halts. The builder itself only
/// reports; partially installed mappings are not rolled back.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// The request runs through or past the top of the 48-bit virtual
    /// window starting at its base. Nothing is truncated.
    #[error("virtual address space exhausted: request runs past the 48-bit window")]
    VirtualSpaceExhausted,

    /// The frame allocator could not supply a zeroed page for a new table.
    #[error("out of physical frames while extending page tables")]
    OutOfFrames,

    /// Strict variant only: the virtual page is already mapped.
    #[error("virtual page {0} is already mapped")]
    AlreadyMapped(VirtAddr),
}

/// Handle to one concrete address space.
///
/// `root_phys` must name a 4 KiB-aligned frame holding the PML4, freshly
/// zeroed or populated by earlier calls on the same hierarchy. The mapper
/// must make every table frame of that hierarchy reachable and writable.
pub struct AddressSpace<'m, M: PhysMapper> {
    root_phys: PhysAddr,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    #[inline]
    #[must_use]
    pub const fn new(mapper: &'m M, root_phys: PhysAddr) -> Self {
        Self { root_phys, mapper }
    }

    /// Physical address of the PML4 (what CR3 holds while active).
    #[inline]
    #[must_use]
    pub const fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    /// Map `page_count` consecutive 4 KiB pages, `virt_base → phys_base`
    /// onwards, with `flags` on every leaf entry.
    ///
    /// Walks PML4 → PDPT → PD → PT, creating any missing intermediate table
    /// from a freshly zeroed frame (installed present + writable). At the
    /// leaf level consecutive entries are written until the run is done or
    /// the table's 512 entries are exhausted; exhaustion carries into the
    /// next-outer index, cascading outward as needed. Existing leaf entries
    /// are silently overwritten.
    ///
    /// Bits 48..64 of `virt_base` are ignored (accepted-and-masked; canonical
    /// form is not validated).
    ///
    /// # Errors
    ///
    /// - [`MapError::VirtualSpaceExhausted`] if the run would carry the
    ///   level-4 index past its 512 entries, i.e. the request reaches
    ///   through the final page of the 48-bit window. Detected up front, so
    ///   nothing is installed and nothing is silently truncated.
    /// - [`MapError::OutOfFrames`] if the allocator runs dry mid-walk;
    ///   tables and leaves installed up to that point remain.
    pub fn map_range<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        virt_base: VirtAddr,
        phys_base: PhysAddr,
        page_count: u64,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        debug_assert!(virt_base.is_page_aligned(), "virt_base not page-aligned");
        debug_assert!(phys_base.is_page_aligned(), "phys_base not page-aligned");
        debug_assert!(page_count >= 1);

        // A request that reaches through the final page of the window would
        // carry the level-4 index to 512 mid-walk. Equivalent check, hoisted
        // so the fatal case costs nothing and installs nothing.
        let pages_in_window = (VADDR_SPAN - (virt_base.as_u64() & VADDR_MASK)) / PAGE_SIZE;
        if page_count >= pages_in_window {
            return Err(MapError::VirtualSpaceExhausted);
        }

        let ix = virt_base.table_indices();
        let (mut i4, mut i3, mut i2, mut i1) = (ix.pml4, ix.pdpt, ix.pd, ix.pt);
        let mut phys = phys_base;
        let mut remaining = page_count;

        loop {
            // Checked before the remaining count: a walk whose carry reaches
            // here with i4 == 512 has run out of virtual space even if it
            // has no pages left to write.
            if i4 == TABLE_ENTRIES {
                return Err(MapError::VirtualSpaceExhausted);
            }
            if remaining == 0 {
                return Ok(());
            }

            // SAFETY: the constructor contract makes the root a valid,
            // writable table frame under this mapper.
            let pml4 = unsafe { get_table(self.mapper, self.root_phys) };
            let pdpt_phys = Self::next_table(alloc, pml4, i4)?;

            while i3 < TABLE_ENTRIES && remaining > 0 {
                // SAFETY: `pdpt_phys` came from a present non-leaf entry or
                // a frame we just installed; both are table frames.
                let pdpt = unsafe { get_table(self.mapper, pdpt_phys) };
                let pd_phys = Self::next_table(alloc, pdpt, i3)?;

                while i2 < TABLE_ENTRIES && remaining > 0 {
                    // SAFETY: as above, one level down.
                    let pd = unsafe { get_table(self.mapper, pd_phys) };
                    let pt_phys = Self::next_table(alloc, pd, i2)?;
                    // SAFETY: as above, leaf table frame.
                    let pt = unsafe { get_table(self.mapper, pt_phys) };

                    while i1 < TABLE_ENTRIES && remaining > 0 {
                        pt.set(i1, PageTableEntry::leaf(phys, flags));
                        phys += PAGE_SIZE;
                        remaining -= 1;
                        i1 += 1;
                    }
                    if i1 == TABLE_ENTRIES {
                        // Leaf table exhausted: carry into the level-2 index.
                        i1 = 0;
                        i2 += 1;
                    }
                }
                if i2 == TABLE_ENTRIES {
                    i2 = 0;
                    i3 += 1;
                }
            }
            if i3 == TABLE_ENTRIES {
                i3 = 0;
                i4 += 1;
            }
        }
    }

    /// Strict variant of [`map_range`](Self::map_range): refuses to touch a
    /// virtual range that already has any present leaf.
    ///
    /// The pre-scan runs before anything is installed, so a rejected request
    /// leaves the hierarchy untouched.
    ///
    /// # Errors
    ///
    /// [`MapError::AlreadyMapped`] naming the first conflicting page, plus
    /// everything [`map_range`](Self::map_range) can return.
    pub fn map_range_checked<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        virt_base: VirtAddr,
        phys_base: PhysAddr,
        page_count: u64,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let pages_in_window = (VADDR_SPAN - (virt_base.as_u64() & VADDR_MASK)) / PAGE_SIZE;
        if page_count >= pages_in_window {
            return Err(MapError::VirtualSpaceExhausted);
        }

        let mut va = virt_base;
        for _ in 0..page_count {
            if self.query(va).is_some() {
                return Err(MapError::AlreadyMapped(va));
            }
            va += PAGE_SIZE;
        }
        self.map_range(alloc, virt_base, phys_base, page_count, flags)
    }

    /// Translate `va` through this hierarchy: the mapped physical address
    /// including the in-page offset, or `None` if any level is absent.
    #[must_use]
    pub fn query(&self, va: VirtAddr) -> Option<PhysAddr> {
        let ix = va.table_indices();

        // SAFETY: constructor contract; see `map_range`.
        let pml4 = unsafe { get_table(self.mapper, self.root_phys) };
        let e4 = pml4.get(ix.pml4);
        if !e4.is_present() {
            return None;
        }

        // SAFETY: present non-leaf entries name table frames.
        let pdpt: &PageTable = unsafe { get_table(self.mapper, e4.addr()) };
        let e3 = pdpt.get(ix.pdpt);
        if !e3.is_present() {
            return None;
        }

        // SAFETY: as above.
        let pd: &PageTable = unsafe { get_table(self.mapper, e3.addr()) };
        let e2 = pd.get(ix.pd);
        if !e2.is_present() {
            return None;
        }

        // SAFETY: as above.
        let pt: &PageTable = unsafe { get_table(self.mapper, e2.addr()) };
        let e1 = pt.get(ix.pt);
        if !e1.is_present() {
            return None;
        }

        Some(e1.addr() + va.page_offset())
    }

    /// Descend one level: return the table the entry at `index` points to,
    /// allocating and installing it (present + writable) if the entry is
    /// still zero.
    fn next_table<A: FrameAlloc>(
        alloc: &mut A,
        table: &mut PageTable,
        index: usize,
    ) -> Result<PhysAddr, MapError> {
        let entry = table.get(index);
        if entry.is_unused() {
            let frame = alloc.alloc_zeroed_4k().ok_or(MapError::OutOfFrames)?;
            table.set(index, PageTableEntry::table(frame));
            Ok(frame)
        } else {
            // Mask the flag bits back out to recover the table's address.
            Ok(entry.addr())
        }
    }

    /// Load CR3 with this space's root, making it the active address space.
    ///
    /// # Safety
    ///
    /// The hierarchy must already map the currently executing code and the
    /// current stack (or execution must transfer immediately afterwards);
    /// loading an incomplete root is an unrecoverable hardware fault, not a
    /// reported error. See [`crate::switch::activate`] for the combined
    /// root + stack handoff.
    #[cfg(target_arch = "x86_64")]
    #[inline]
    pub unsafe fn activate(&self) {
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) self.root_phys.as_u64(),
                options(nostack, preserves_flags)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAlloc, TestPhys};

    const FRAMES: usize = 64;
    const POOL_END: u64 = (FRAMES as u64) << 12;

    fn setup(phys: &TestPhys) -> (AddressSpace<'_, TestPhys>, BumpAlloc) {
        let mut alloc = BumpAlloc::new(0, POOL_END);
        let root = alloc.alloc_zeroed_4k().expect("root frame");
        (AddressSpace::new(phys, root), alloc)
    }

    /// Read the leaf table reached from `root` for `va`, without allocating.
    fn walk_to_pt<'a>(phys: &TestPhys, aspace: &AddressSpace<'a, TestPhys>, va: VirtAddr) -> &'a PageTable {
        let ix = va.table_indices();
        let pml4: &PageTable = unsafe { get_table(phys, aspace.root_phys()) };
        let pdpt: &PageTable = unsafe { get_table(phys, pml4.get(ix.pml4).addr()) };
        let pd: &PageTable = unsafe { get_table(phys, pdpt.get(ix.pdpt).addr()) };
        unsafe { get_table(phys, pd.get(ix.pd).addr()) }
    }

    #[test]
    fn three_pages_from_zero() {
        // Scenario: map_range(root, 0x0, 0x10_0000, 3, WRITABLE).
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        aspace
            .map_range(
                &mut alloc,
                VirtAddr::new(0),
                PhysAddr::new(0x10_0000),
                3,
                PageFlags::WRITABLE,
            )
            .expect("map_range");

        // Exactly three intermediate tables were created, all present+writable.
        let pml4: &PageTable = unsafe { get_table(&phys, aspace.root_phys()) };
        let e4 = pml4.get(0);
        assert!(e4.is_present() && e4.is_writable());
        let pdpt: &PageTable = unsafe { get_table(&phys, e4.addr()) };
        let e3 = pdpt.get(0);
        assert!(e3.is_present() && e3.is_writable());
        let pd: &PageTable = unsafe { get_table(&phys, e3.addr()) };
        let e2 = pd.get(0);
        assert!(e2.is_present() && e2.is_writable());
        assert_eq!(alloc.used(0), 4); // root + PDPT + PD + PT

        let expected_flags = (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
        let pt: &PageTable = unsafe { get_table(&phys, e2.addr()) };
        assert_eq!(pt.get(0).raw(), 0x10_0000 | expected_flags);
        assert_eq!(pt.get(1).raw(), 0x10_1000 | expected_flags);
        assert_eq!(pt.get(2).raw(), 0x10_2000 | expected_flags);
        assert!(pt.get(3).is_unused());
    }

    #[test]
    fn coverage_every_page_resolves() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        let va = VirtAddr::new(0xffff_8000_0000_0000);
        let pa = PhysAddr::new(0x0030_0000);
        aspace
            .map_range(&mut alloc, va, pa, 8, PageFlags::WRITABLE)
            .expect("map_range");

        for n in 0..8u64 {
            let got = aspace.query(va + n * PAGE_SIZE).expect("mapped");
            assert_eq!(got.as_u64(), pa.as_u64() + n * PAGE_SIZE);
        }
        assert!(aspace.query(va + 8 * PAGE_SIZE).is_none());
        // Offsets within a page are preserved.
        assert_eq!(
            aspace.query(va + 0x123).expect("mapped").as_u64(),
            pa.as_u64() + 0x123
        );
    }

    #[test]
    fn remapping_is_idempotent() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        let va = VirtAddr::new(0x40_0000);
        let pa = PhysAddr::new(0x80_0000);
        aspace
            .map_range(&mut alloc, va, pa, 4, PageFlags::WRITABLE)
            .expect("first");
        let used_once = alloc.used(0);
        let before: Vec<u64> = {
            let pt = walk_to_pt(&phys, &aspace, va);
            (0..TABLE_ENTRIES).map(|i| pt.get(i).raw()).collect()
        };

        aspace
            .map_range(&mut alloc, va, pa, 4, PageFlags::WRITABLE)
            .expect("second");

        assert_eq!(alloc.used(0), used_once, "no new tables on re-map");
        let pt = walk_to_pt(&phys, &aspace, va);
        for (i, raw) in before.iter().enumerate() {
            assert_eq!(pt.get(i).raw(), *raw);
        }
    }

    #[test]
    fn remapping_overwrites_without_error() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        let va = VirtAddr::new(0x20_0000);
        aspace
            .map_range(&mut alloc, va, PhysAddr::new(0x100_0000), 1, PageFlags::WRITABLE)
            .expect("first");
        aspace
            .map_range(&mut alloc, va, PhysAddr::new(0x200_0000), 1, PageFlags::WRITABLE)
            .expect("overwrite");

        assert_eq!(aspace.query(va).expect("mapped").as_u64(), 0x200_0000);
    }

    #[test]
    fn leaf_boundary_carry() {
        // Start at leaf index 510, span 4 pages: 510,511 land in the first
        // leaf table, 0,1 in the next, and the level-2 index advances once.
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        let va = VirtAddr::new(510 * PAGE_SIZE);
        let pa = PhysAddr::new(0x500_0000);
        aspace
            .map_range(&mut alloc, va, pa, 4, PageFlags::WRITABLE)
            .expect("map_range");

        let pml4: &PageTable = unsafe { get_table(&phys, aspace.root_phys()) };
        let pdpt: &PageTable = unsafe { get_table(&phys, pml4.get(0).addr()) };
        let pd: &PageTable = unsafe { get_table(&phys, pdpt.get(0).addr()) };
        assert_eq!(pd.present_count(), 2, "level-2 index advanced exactly once");

        let pt0: &PageTable = unsafe { get_table(&phys, pd.get(0).addr()) };
        let pt1: &PageTable = unsafe { get_table(&phys, pd.get(1).addr()) };
        assert_eq!(pt0.get(510).addr().as_u64(), 0x500_0000);
        assert_eq!(pt0.get(511).addr().as_u64(), 0x500_1000);
        assert!(pt0.get(509).is_unused());
        assert_eq!(pt1.get(0).addr().as_u64(), 0x500_2000);
        assert_eq!(pt1.get(1).addr().as_u64(), 0x500_3000);
        assert!(pt1.get(2).is_unused());
    }

    #[test]
    fn simultaneous_carry_across_all_levels() {
        // Last page of one PML4 entry's range, then the first page of the
        // next: every index wraps at once.
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        let va = VirtAddr::new((3u64 << 39) | (511 << 30) | (511 << 21) | (511 << 12));
        aspace
            .map_range(&mut alloc, va, PhysAddr::new(0x600_0000), 2, PageFlags::WRITABLE)
            .expect("map_range");

        let pml4: &PageTable = unsafe { get_table(&phys, aspace.root_phys()) };
        assert!(pml4.get(3).is_present());
        assert!(pml4.get(4).is_present());
        assert_eq!(aspace.query(va).expect("first").as_u64(), 0x600_0000);
        assert_eq!(
            aspace.query(VirtAddr::new(4u64 << 39)).expect("second").as_u64(),
            0x600_1000
        );
        // Two full chains were built: root + 2 * (PDPT + PD + PT).
        assert_eq!(alloc.used(0), 7);
    }

    #[test]
    fn exhaustion_full_window_request() {
        // 2^36 pages from VA 0 exactly fills the 48-bit window, which the
        // carry walk treats as exhaustion. Nothing may be installed.
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        let err = aspace
            .map_range(
                &mut alloc,
                VirtAddr::new(0),
                PhysAddr::new(0),
                1 << 36,
                PageFlags::WRITABLE,
            )
            .expect_err("must not truncate");
        assert_eq!(err, MapError::VirtualSpaceExhausted);
        assert_eq!(alloc.used(0), 1, "only the root frame exists");
        let pml4: &PageTable = unsafe { get_table(&phys, aspace.root_phys()) };
        assert_eq!(pml4.present_count(), 0);
    }

    #[test]
    fn exhaustion_crossing_the_top() {
        // Two pages below the top of the window, asking for four.
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        let va = VirtAddr::new(0xffff_ffff_ffff_e000);
        let err = aspace
            .map_range(&mut alloc, va, PhysAddr::new(0), 4, PageFlags::WRITABLE)
            .expect_err("runs past the window");
        assert_eq!(err, MapError::VirtualSpaceExhausted);

        // Reaching exactly through the final page is exhaustion too.
        let err = aspace
            .map_range(&mut alloc, va, PhysAddr::new(0), 2, PageFlags::WRITABLE)
            .expect_err("reaches through the final page");
        assert_eq!(err, MapError::VirtualSpaceExhausted);
    }

    #[test]
    fn stack_region_below_top_page_maps() {
        // The loader's kernel stack: two pages ending one page below the top
        // of the window. Must succeed.
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        let va = VirtAddr::new(0xffff_ffff_ffff_d000);
        aspace
            .map_range(&mut alloc, va, PhysAddr::new(0x70_0000), 2, PageFlags::WRITABLE)
            .expect("stack mapping");
        assert_eq!(aspace.query(va).expect("low page").as_u64(), 0x70_0000);
        assert_eq!(
            aspace
                .query(VirtAddr::new(0xffff_ffff_ffff_e000))
                .expect("high page")
                .as_u64(),
            0x70_1000
        );
    }

    #[test]
    fn intermediates_writable_even_for_read_only_leaf() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        let va = VirtAddr::new(0x7000_0000);
        aspace
            .map_range(&mut alloc, va, PhysAddr::new(0x30_0000), 1, PageFlags::empty())
            .expect("map_range");

        let ix = va.table_indices();
        let pml4: &PageTable = unsafe { get_table(&phys, aspace.root_phys()) };
        let e4 = pml4.get(ix.pml4);
        assert!(e4.is_present() && e4.is_writable());
        let pdpt: &PageTable = unsafe { get_table(&phys, e4.addr()) };
        let e3 = pdpt.get(ix.pdpt);
        assert!(e3.is_present() && e3.is_writable());
        let pd: &PageTable = unsafe { get_table(&phys, e3.addr()) };
        let e2 = pd.get(ix.pd);
        assert!(e2.is_present() && e2.is_writable());
        let pt: &PageTable = unsafe { get_table(&phys, e2.addr()) };
        let e1 = pt.get(ix.pt);
        assert!(e1.is_present());
        assert!(!e1.is_writable(), "leaf keeps the caller's flags");
    }

    #[test]
    fn single_page_touches_minimal_tables() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        aspace
            .map_range(
                &mut alloc,
                VirtAddr::new(0x1234_5000),
                PhysAddr::new(0x40_0000),
                1,
                PageFlags::WRITABLE,
            )
            .expect("map_range");
        assert_eq!(alloc.used(0), 4, "root + exactly one chain");
    }

    #[test]
    fn out_of_frames_is_reported() {
        let phys = TestPhys::with_frames(FRAMES);
        // Room for the root and one more table; the chain needs three.
        let mut alloc = BumpAlloc::new(0, 2 * PAGE_SIZE);
        let root = alloc.alloc_zeroed_4k().expect("root frame");
        let aspace = AddressSpace::new(&phys, root);

        let err = aspace
            .map_range(
                &mut alloc,
                VirtAddr::new(0),
                PhysAddr::new(0x10_0000),
                1,
                PageFlags::WRITABLE,
            )
            .expect_err("allocator is dry");
        assert_eq!(err, MapError::OutOfFrames);
    }

    #[test]
    fn checked_variant_rejects_overlap() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = setup(&phys);

        let va = VirtAddr::new(0x9000_0000);
        aspace
            .map_range(&mut alloc, va, PhysAddr::new(0x100_0000), 2, PageFlags::WRITABLE)
            .expect("seed mapping");

        // Overlaps the second seeded page.
        let overlapping = VirtAddr::new(0x9000_1000);
        let err = aspace
            .map_range_checked(
                &mut alloc,
                overlapping,
                PhysAddr::new(0x200_0000),
                2,
                PageFlags::WRITABLE,
            )
            .expect_err("overlap must be rejected");
        assert_eq!(err, MapError::AlreadyMapped(overlapping));

        // Nothing was installed: the page past the seed is still unmapped
        // and the seeded translation is unchanged.
        assert!(aspace.query(VirtAddr::new(0x9000_2000)).is_none());
        assert_eq!(aspace.query(overlapping).expect("seed").as_u64(), 0x100_1000);

        // Disjoint request goes through.
        aspace
            .map_range_checked(
                &mut alloc,
                VirtAddr::new(0x9000_2000),
                PhysAddr::new(0x200_0000),
                2,
                PageFlags::WRITABLE,
            )
            .expect("disjoint range maps");
    }

    #[test]
    fn query_unmapped_is_none() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, _alloc) = setup(&phys);
        assert!(aspace.query(VirtAddr::new(0x1000)).is_none());
        assert!(aspace.query(VirtAddr::new(0xffff_8000_0000_0000)).is_none());
    }
}
