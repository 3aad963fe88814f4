pub mod bitmap_frame_allocator;
pub mod direct_map;
pub mod frame_allocator;
#[cfg(not(test))]
pub mod heap;
pub mod paging;
pub mod regions;
pub mod tlb;

use core::fmt;

use bitmap_frame_allocator::{BitmapFrameAllocator, FrameError};
use direct_map::DirectMap;
use frame_allocator::FRAME_ALLOCATOR;
use paging::{ActivePageTables, PageMapper, VmmError};
use regions::{MemoryRegion, MemorySummary, RegionError};
use spin::{Mutex, Once};
use x86_64::{
    instructions::interrupts::without_interrupts,
    registers::model_specific::{Efer, EferFlags},
    structures::paging::PageTableFlags,
    PhysAddr, VirtAddr,
};

/// Offset of the bootloader's higher-half direct map.
pub static DIRECT_MAP: Once<DirectMap> = Once::new();

/// Mapper over the page tables loaded in CR3.
pub static KERNEL_MAPPER: Mutex<Option<PageMapper<ActivePageTables>>> = Mutex::new(None);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    Region(RegionError),
    Frame(FrameError),
    Vmm(VmmError),
    OutOfFrames,
    NotInitialized,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Region(e) => write!(f, "Memory map: {}", e),
            MemoryError::Frame(e) => write!(f, "Frame allocator: {}", e),
            MemoryError::Vmm(e) => write!(f, "Paging: {}", e),
            MemoryError::OutOfFrames => write!(f, "Out of physical frames"),
            MemoryError::NotInitialized => write!(f, "Memory manager not initialized"),
        }
    }
}

impl From<RegionError> for MemoryError {
    fn from(e: RegionError) -> Self {
        MemoryError::Region(e)
    }
}

impl From<FrameError> for MemoryError {
    fn from(e: FrameError) -> Self {
        MemoryError::Frame(e)
    }
}

impl From<VmmError> for MemoryError {
    fn from(e: VmmError) -> Self {
        MemoryError::Vmm(e)
    }
}

/// Brings up physical and virtual memory management, then the heap.
///
/// Returns the byte totals of the memory map.
pub fn init(regions: &[MemoryRegion], hhdm_offset: u64) -> Result<MemorySummary, MemoryError> {
    let summary = regions::summarize(regions);
    let layout = regions::select_frame_pool(regions)?;
    let direct_map = *DIRECT_MAP.call_once(|| DirectMap::new(hhdm_offset));

    let allocator = unsafe {
        BitmapFrameAllocator::from_direct_map(layout.pool, layout.bitmap, &direct_map)?
    };
    log::info!(
        "Frame pool at {:#x}, {} frames, bitmap at {:#x}",
        layout.pool.base.as_u64(),
        allocator.total_frames(),
        layout.bitmap.base.as_u64()
    );

    without_interrupts(|| {
        *FRAME_ALLOCATOR.lock() = Some(allocator);
        *KERNEL_MAPPER.lock() = Some(PageMapper::new(unsafe { ActivePageTables::new(direct_map) }));
    });

    unsafe {
        // Must be done after enabling long mode + paging
        Efer::update(|flags| {
            flags.insert(EferFlags::NO_EXECUTE_ENABLE);
        });
    }

    #[cfg(not(test))]
    heap::init_heap()?;

    Ok(summary)
}

/// Maps `vaddr` to `paddr` in the active address space.
///
/// Intermediate tables come from the global frame allocator.
pub fn map_page(vaddr: VirtAddr, paddr: PhysAddr, flags: PageTableFlags) -> Result<(), MemoryError> {
    without_interrupts(|| -> Result<(), MemoryError> {
        let mut mapper = KERNEL_MAPPER.lock();
        let mapper = mapper.as_mut().ok_or(MemoryError::NotInitialized)?;
        let mut frames = FRAME_ALLOCATOR.lock();
        let frames = frames.as_mut().ok_or(MemoryError::NotInitialized)?;
        mapper.map(vaddr, paddr, flags, frames)?;
        Ok(())
    })
}

/// Removes the mapping of `vaddr` from the active address space. The frame
/// behind it is left to the caller.
pub fn unmap_page(vaddr: VirtAddr) -> Result<(), MemoryError> {
    without_interrupts(|| -> Result<(), MemoryError> {
        let mut mapper = KERNEL_MAPPER.lock();
        let mapper = mapper.as_mut().ok_or(MemoryError::NotInitialized)?;
        mapper.unmap(vaddr)?;
        Ok(())
    })
}

pub fn translate(vaddr: VirtAddr) -> Option<PhysAddr> {
    without_interrupts(|| KERNEL_MAPPER.lock().as_mut()?.translate(vaddr))
}

/// Direct-map alias of `paddr`, once memory is initialized.
pub fn phys_to_virt(paddr: PhysAddr) -> Option<VirtAddr> {
    DIRECT_MAP.get().map(|map| map.phys_to_virt(paddr))
}
