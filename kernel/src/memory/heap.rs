//! The Kernel Heap
//! Contains the initialization for the kernel heap using the Talc allocator

use talc::{ClaimOnOom, Span, Talc, Talck};
use x86_64::{
    structures::paging::{Page, PageTableFlags, Size4KiB},
    VirtAddr,
};

use crate::{
    constants::memory::{HEAP_SIZE, HEAP_START},
    memory::{frame_allocator::alloc_frame, map_page, MemoryError},
};

#[global_allocator]
static ALLOCATOR: Talck<spin::Mutex<()>, ClaimOnOom> = Talc::new(unsafe {
    ClaimOnOom::new(Span::new(HEAP_START, HEAP_START.wrapping_add(HEAP_SIZE)))
})
.lock();

/// Backs every heap page with a fresh frame
///
/// # Returns
/// An error if a frame could not be allocated or a page could not be mapped
pub fn init_heap() -> Result<(), MemoryError> {
    let page_range = {
        let heap_start = VirtAddr::new(HEAP_START as u64);
        let heap_end = heap_start + HEAP_SIZE as u64 - 1u64;
        let heap_start_page: Page<Size4KiB> = Page::containing_address(heap_start);
        let heap_end_page = Page::containing_address(heap_end);
        Page::range_inclusive(heap_start_page, heap_end_page)
    };

    let flags = PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
    for page in page_range {
        let frame = alloc_frame().ok_or(MemoryError::OutOfFrames)?;
        map_page(page.start_address(), frame.start_address(), flags)?;
    }

    log::info!("Heap mapped at {:p}, {} KiB", HEAP_START, HEAP_SIZE / 1024);
    Ok(())
}
