//! Virtual memory manager
//!
//! Walks and builds the 4-level page table hierarchy (PML4 -> PDPT -> PD -> PT).
//! Intermediate tables are allocated from a frame allocator on demand; leaves
//! are never overwritten silently.

use core::fmt;

use x86_64::{
    registers::control::Cr3,
    structures::paging::{
        FrameAllocator, PageTable, PageTableFlags, PageTableIndex, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::{
    constants::memory::{ATTRIBUTE_MASK, PAGE_ADDR_MASK},
    memory::{direct_map::DirectMap, tlb},
};

/// The levels whose entries link to another table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLevel {
    Pml4,
    Pdpt,
    Pd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// A zero virtual or physical address was passed.
    Null,
    /// No frame was available for an intermediate table.
    NoMemory,
    /// The table at this level is missing, or its entry cannot be followed.
    InvalidTable(TableLevel),
    AlreadyMapped,
    NotMapped,
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmmError::Null => write!(f, "Null address"),
            VmmError::NoMemory => write!(f, "Out of frames for page tables"),
            VmmError::InvalidTable(level) => write!(f, "Invalid {:?} table", level),
            VmmError::AlreadyMapped => write!(f, "Page already mapped"),
            VmmError::NotMapped => write!(f, "Page not mapped"),
        }
    }
}

/// Storage of page tables plus the two CPU hooks the walker needs.
pub trait PageTableMemory {
    /// Frame of the active top-level table.
    fn root(&self) -> Option<PhysFrame>;

    /// Directly addressable view of the table stored in `frame`.
    fn table(&mut self, frame: PhysFrame) -> Option<&mut PageTable>;

    /// Drops any cached translation for the page at `vaddr`.
    fn invalidate_page(&mut self, vaddr: VirtAddr);
}

/// The page tables the CPU is currently using, reached through the HHDM.
pub struct ActivePageTables {
    direct_map: DirectMap,
}

impl ActivePageTables {
    /// # Safety
    ///
    /// `direct_map` must map all physical memory holding page tables, and
    /// only one mutator of the active tables may exist at a time.
    pub unsafe fn new(direct_map: DirectMap) -> Self {
        Self { direct_map }
    }
}

impl PageTableMemory for ActivePageTables {
    fn root(&self) -> Option<PhysFrame> {
        let (level_4_table_frame, _) = Cr3::read();
        Some(level_4_table_frame)
    }

    fn table(&mut self, frame: PhysFrame) -> Option<&mut PageTable> {
        let virt = self.direct_map.phys_to_virt(frame.start_address());
        let page_table_ptr: *mut PageTable = virt.as_mut_ptr();
        unsafe { page_table_ptr.as_mut() }
    }

    fn invalidate_page(&mut self, vaddr: VirtAddr) {
        tlb::invalidate(vaddr);
    }
}

const LINK_FLAGS: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

/// Maps and unmaps 4 KiB pages in the hierarchy rooted at `memory.root()`.
pub struct PageMapper<M: PageTableMemory> {
    memory: M,
}

impl<M: PageTableMemory> PageMapper<M> {
    pub fn new(memory: M) -> Self {
        Self { memory }
    }

    pub fn memory(&mut self) -> &mut M {
        &mut self.memory
    }

    /// Maps the page at `vaddr` to the frame at `paddr`.
    ///
    /// `attrs` may carry any entry bits outside the address field; PRESENT
    /// and WRITABLE are always set. Missing intermediate tables are taken
    /// from `frames`, zeroed, and linked in.
    pub fn map(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        attrs: PageTableFlags,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(), VmmError> {
        if vaddr.is_null() || paddr.as_u64() == 0 {
            return Err(VmmError::Null);
        }

        let pml4 = self.root_frame()?;
        let pdpt = self.next_table_or_create(pml4, vaddr.p4_index(), TableLevel::Pml4, frames)?;
        let pd = self.next_table_or_create(pdpt, vaddr.p3_index(), TableLevel::Pdpt, frames)?;
        let pt = self.next_table_or_create(pd, vaddr.p2_index(), TableLevel::Pd, frames)?;

        let leaf = self
            .memory
            .table(pt)
            .ok_or(VmmError::InvalidTable(TableLevel::Pd))?;
        let entry = &mut leaf[vaddr.p1_index()];
        if entry.flags().contains(PageTableFlags::PRESENT) {
            log::warn!("Refusing to remap {:?}, already mapped to {:?}", vaddr, entry.addr());
            return Err(VmmError::AlreadyMapped);
        }

        let flags = PageTableFlags::from_bits_retain(attrs.bits() & ATTRIBUTE_MASK) | LINK_FLAGS;
        entry.set_addr(PhysAddr::new(paddr.as_u64() & PAGE_ADDR_MASK), flags);

        self.memory.invalidate_page(vaddr);
        Ok(())
    }

    /// Clears the PRESENT bit of the leaf entry for `vaddr`.
    ///
    /// The frame stays linked in the entry but is inert; empty tables are
    /// left in place.
    pub fn unmap(&mut self, vaddr: VirtAddr) -> Result<(), VmmError> {
        if vaddr.is_null() {
            return Err(VmmError::Null);
        }

        let pml4 = self.root_frame()?;
        let pdpt = self.next_table(pml4, vaddr.p4_index(), TableLevel::Pml4)?;
        let pd = self.next_table(pdpt, vaddr.p3_index(), TableLevel::Pdpt)?;
        let pt = self.next_table(pd, vaddr.p2_index(), TableLevel::Pd)?;

        let leaf = self
            .memory
            .table(pt)
            .ok_or(VmmError::InvalidTable(TableLevel::Pd))?;
        let entry = &mut leaf[vaddr.p1_index()];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(VmmError::NotMapped);
        }
        entry.set_flags(entry.flags() - PageTableFlags::PRESENT);

        self.memory.invalidate_page(vaddr);
        Ok(())
    }

    /// Physical address `vaddr` currently translates to.
    pub fn translate(&mut self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let (addr, flags) = self.leaf(vaddr)?;
        if !flags.contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(addr + u64::from(vaddr.page_offset()))
    }

    /// Flags of the leaf entry for `vaddr`, present or not.
    pub fn entry_flags(&mut self, vaddr: VirtAddr) -> Option<PageTableFlags> {
        self.leaf(vaddr).map(|(_, flags)| flags)
    }

    fn leaf(&mut self, vaddr: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
        let pml4 = self.root_frame().ok()?;
        let pdpt = self.next_table(pml4, vaddr.p4_index(), TableLevel::Pml4).ok()?;
        let pd = self.next_table(pdpt, vaddr.p3_index(), TableLevel::Pdpt).ok()?;
        let pt = self.next_table(pd, vaddr.p2_index(), TableLevel::Pd).ok()?;

        let entry = &self.memory.table(pt)?[vaddr.p1_index()];
        Some((entry.addr(), entry.flags()))
    }

    fn root_frame(&mut self) -> Result<PhysFrame, VmmError> {
        let root = self
            .memory
            .root()
            .ok_or(VmmError::InvalidTable(TableLevel::Pml4))?;
        match self.memory.table(root) {
            Some(_) => Ok(root),
            None => Err(VmmError::InvalidTable(TableLevel::Pml4)),
        }
    }

    /// Follows entry `index` of the `level` table stored in `table`.
    fn next_table(
        &mut self,
        table: PhysFrame,
        index: PageTableIndex,
        level: TableLevel,
    ) -> Result<PhysFrame, VmmError> {
        let table = self
            .memory
            .table(table)
            .ok_or(VmmError::InvalidTable(level))?;
        let flags = table[index].flags();
        if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE) {
            return Err(VmmError::InvalidTable(level));
        }
        Ok(PhysFrame::containing_address(table[index].addr()))
    }

    fn next_table_or_create(
        &mut self,
        table: PhysFrame,
        index: PageTableIndex,
        level: TableLevel,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<PhysFrame, VmmError> {
        let flags = self
            .memory
            .table(table)
            .ok_or(VmmError::InvalidTable(level))?[index]
            .flags();

        if flags.contains(PageTableFlags::PRESENT) {
            return self.next_table(table, index, level);
        }

        let Some(new_frame) = frames.allocate_frame() else {
            log::warn!("No frame left for a {:?} child table", level);
            return Err(VmmError::NoMemory);
        };

        self.memory
            .table(new_frame)
            .ok_or(VmmError::InvalidTable(level))?
            .zero();

        let parent = self
            .memory
            .table(table)
            .ok_or(VmmError::InvalidTable(level))?;
        parent[index].set_addr(new_frame.start_address(), LINK_FLAGS);

        Ok(new_frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        bitmap_frame_allocator::BitmapFrameAllocator,
        regions::{bitmap_bytes, PhysRegion},
    };
    use alloc::{vec, vec::Vec};

    const ARENA_BASE: u64 = 0x20_0000;

    /// Physical memory made of page-table frames, indexed by frame number.
    struct FrameArena {
        frames: Vec<PageTable>,
        root: Option<PhysFrame>,
        invalidated: Vec<VirtAddr>,
    }

    impl FrameArena {
        fn new(count: usize) -> Self {
            let mut frames = Vec::with_capacity(count);
            frames.resize_with(count, PageTable::new);
            Self {
                frames,
                root: None,
                invalidated: Vec::new(),
            }
        }

        fn region(&self) -> PhysRegion {
            PhysRegion::new(PhysAddr::new(ARENA_BASE), (self.frames.len() * 4096) as u64)
        }
    }

    impl PageTableMemory for &mut FrameArena {
        fn root(&self) -> Option<PhysFrame> {
            self.root
        }

        fn table(&mut self, frame: PhysFrame) -> Option<&mut PageTable> {
            let offset = frame.start_address().as_u64().checked_sub(ARENA_BASE)?;
            self.frames.get_mut((offset / 4096) as usize)
        }

        fn invalidate_page(&mut self, vaddr: VirtAddr) {
            self.invalidated.push(vaddr);
        }
    }

    fn flags() -> PageTableFlags {
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE
    }

    /// Runs `f` with a mapper over a fresh arena whose frame 0 is the root.
    fn with_mapper<R>(
        frames: usize,
        f: impl FnOnce(&mut PageMapper<&mut FrameArena>, &mut BitmapFrameAllocator) -> R,
    ) -> R {
        let mut arena = FrameArena::new(frames);
        let mut bitmap = vec![0u8; bitmap_bytes(frames)];
        let bitmap_region = PhysRegion::new(PhysAddr::new(0x1000), bitmap.len() as u64);
        let mut allocator =
            BitmapFrameAllocator::new(arena.region(), bitmap_region, &mut bitmap).unwrap();

        let root = allocator.allocate_frame().unwrap();
        arena.root = Some(root);

        let mut mapper = PageMapper::new(&mut arena);
        f(&mut mapper, &mut allocator)
    }

    #[test]
    fn map_builds_the_hierarchy() {
        with_mapper(8, |mapper, frames| {
            let vaddr = VirtAddr::new(0x4000_1000);
            let paddr = PhysAddr::new(0x8000_0000);
            mapper.map(vaddr, paddr, flags(), frames).unwrap();

            // root + PDPT + PD + PT
            assert_eq!(frames.used_frames(), 4);
            assert_eq!(mapper.translate(vaddr + 0x123u64), Some(paddr + 0x123u64));

            let root = mapper.memory().root.unwrap();
            let pml4 = mapper.memory().table(root).unwrap();
            let link = &pml4[vaddr.p4_index()];
            assert_eq!(link.flags(), PageTableFlags::PRESENT | PageTableFlags::WRITABLE);

            assert_eq!(mapper.memory().invalidated, [vaddr]);
        });
    }

    #[test]
    fn new_tables_are_zeroed() {
        with_mapper(8, |mapper, frames| {
            // dirty every arena frame first
            for table in mapper.memory().frames.iter_mut() {
                for entry in table.iter_mut() {
                    entry.set_addr(PhysAddr::new(0x5000), PageTableFlags::PRESENT);
                }
            }
            let root = mapper.memory().root.unwrap();
            mapper.memory().table(root).unwrap().zero();

            let vaddr = VirtAddr::new(0x7000);
            mapper.map(vaddr, PhysAddr::new(0x9000), flags(), frames).unwrap();

            let pt_frame = PhysFrame::containing_address(PhysAddr::new(ARENA_BASE + 3 * 4096));
            let pt = mapper.memory().table(pt_frame).unwrap();
            let present = pt
                .iter()
                .filter(|e| e.flags().contains(PageTableFlags::PRESENT))
                .count();
            assert_eq!(present, 1);
        });
    }

    #[test]
    fn existing_tables_are_reused() {
        with_mapper(8, |mapper, frames| {
            mapper.map(VirtAddr::new(0x1000), PhysAddr::new(0x10_0000), flags(), frames).unwrap();
            let used = frames.used_frames();
            mapper.map(VirtAddr::new(0x2000), PhysAddr::new(0x11_0000), flags(), frames).unwrap();
            assert_eq!(frames.used_frames(), used);
        });
    }

    #[test]
    fn double_map_is_refused() {
        with_mapper(8, |mapper, frames| {
            let vaddr = VirtAddr::new(0x1000);
            let first = PhysAddr::new(0x10_0000);
            mapper.map(vaddr, first, flags(), frames).unwrap();

            let result = mapper.map(vaddr, PhysAddr::new(0x20_0000), flags(), frames);
            assert_eq!(result, Err(VmmError::AlreadyMapped));
            assert_eq!(mapper.translate(vaddr), Some(first));
            assert_eq!(mapper.memory().invalidated.len(), 1);
        });
    }

    #[test]
    fn unmap_of_missing_leaf_is_not_mapped() {
        with_mapper(8, |mapper, frames| {
            mapper.map(VirtAddr::new(0x1000), PhysAddr::new(0x10_0000), flags(), frames).unwrap();
            // same page table, different entry
            assert_eq!(mapper.unmap(VirtAddr::new(0x5000)), Err(VmmError::NotMapped));
        });
    }

    #[test]
    fn unmap_reports_the_missing_level() {
        with_mapper(8, |mapper, frames| {
            assert_eq!(
                mapper.unmap(VirtAddr::new(0x1000)),
                Err(VmmError::InvalidTable(TableLevel::Pml4))
            );

            mapper.map(VirtAddr::new(0x1000), PhysAddr::new(0x10_0000), flags(), frames).unwrap();
            // next 1 GiB: same PDPT, no PD
            assert_eq!(
                mapper.unmap(VirtAddr::new(0x4000_0000)),
                Err(VmmError::InvalidTable(TableLevel::Pdpt))
            );
            // next 2 MiB: same PD, no PT
            assert_eq!(
                mapper.unmap(VirtAddr::new(0x20_0000)),
                Err(VmmError::InvalidTable(TableLevel::Pd))
            );
        });
    }

    #[test]
    fn unmap_then_remap() {
        with_mapper(8, |mapper, frames| {
            let vaddr = VirtAddr::new(0x1000);
            let original = PhysAddr::new(0x10_0000);
            mapper.map(vaddr, original, flags(), frames).unwrap();
            mapper.unmap(vaddr).unwrap();

            assert_eq!(mapper.translate(vaddr), None);
            // only PRESENT was cleared
            let left = mapper.entry_flags(vaddr).unwrap();
            assert!(!left.contains(PageTableFlags::PRESENT));
            assert!(left.contains(PageTableFlags::WRITABLE));

            assert_eq!(mapper.unmap(vaddr), Err(VmmError::NotMapped));

            let replacement = PhysAddr::new(0x30_0000);
            mapper.map(vaddr, replacement, flags(), frames).unwrap();
            assert_eq!(mapper.translate(vaddr), Some(replacement));
            assert_eq!(mapper.memory().invalidated, [vaddr, vaddr, vaddr]);
        });
    }

    #[test]
    fn attributes_cannot_touch_the_address_field() {
        with_mapper(8, |mapper, frames| {
            let vaddr = VirtAddr::new(0x1000);
            let paddr = PhysAddr::new(0x10_0000);
            let attrs = PageTableFlags::from_bits_retain(0x0000_00AB_CDE0_0000)
                | PageTableFlags::NO_EXECUTE
                | PageTableFlags::USER_ACCESSIBLE;
            mapper.map(vaddr, paddr, attrs, frames).unwrap();

            assert_eq!(mapper.translate(vaddr), Some(paddr));
            let flags = mapper.entry_flags(vaddr).unwrap();
            assert!(flags.contains(
                PageTableFlags::PRESENT
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::USER_ACCESSIBLE
                    | PageTableFlags::NO_EXECUTE
            ));
        });
    }

    #[test]
    fn unaligned_physical_address_is_truncated_to_its_frame() {
        with_mapper(8, |mapper, frames| {
            let vaddr = VirtAddr::new(0x1000);
            mapper.map(vaddr, PhysAddr::new(0x10_0234), flags(), frames).unwrap();
            assert_eq!(mapper.translate(vaddr), Some(PhysAddr::new(0x10_0000)));
        });
    }

    #[test]
    fn null_addresses_are_rejected() {
        with_mapper(8, |mapper, frames| {
            assert_eq!(
                mapper.map(VirtAddr::new(0), PhysAddr::new(0x1000), flags(), frames),
                Err(VmmError::Null)
            );
            assert_eq!(
                mapper.map(VirtAddr::new(0x1000), PhysAddr::new(0), flags(), frames),
                Err(VmmError::Null)
            );
            assert_eq!(mapper.unmap(VirtAddr::new(0)), Err(VmmError::Null));
        });
    }

    #[test]
    fn exhausted_frames_are_reported() {
        // root plus two tables: the PT cannot be allocated
        with_mapper(3, |mapper, frames| {
            let result = mapper.map(VirtAddr::new(0x1000), PhysAddr::new(0x10_0000), flags(), frames);
            assert_eq!(result, Err(VmmError::NoMemory));
            assert!(mapper.memory().invalidated.is_empty());
        });
    }

    #[test]
    fn missing_root_is_an_invalid_pml4() {
        with_mapper(4, |mapper, frames| {
            mapper.memory().root = None;
            assert_eq!(
                mapper.map(VirtAddr::new(0x1000), PhysAddr::new(0x10_0000), flags(), frames),
                Err(VmmError::InvalidTable(TableLevel::Pml4))
            );
            assert_eq!(
                mapper.unmap(VirtAddr::new(0x1000)),
                Err(VmmError::InvalidTable(TableLevel::Pml4))
            );
        });
    }

    #[test]
    fn huge_page_entries_are_not_followed() {
        with_mapper(8, |mapper, frames| {
            let vaddr = VirtAddr::new(0x4000_0000);
            let root = mapper.memory().root.unwrap();
            let pdpt = frames.allocate_frame().unwrap();
            mapper.memory().table(pdpt).unwrap().zero();
            mapper.memory().table(root).unwrap()[vaddr.p4_index()]
                .set_addr(pdpt.start_address(), LINK_FLAGS);
            mapper.memory().table(pdpt).unwrap()[vaddr.p3_index()].set_addr(
                PhysAddr::new(0x4000_0000),
                LINK_FLAGS | PageTableFlags::HUGE_PAGE,
            );

            assert_eq!(
                mapper.map(vaddr, PhysAddr::new(0x10_0000), flags(), frames),
                Err(VmmError::InvalidTable(TableLevel::Pdpt))
            );
        });
    }
}
