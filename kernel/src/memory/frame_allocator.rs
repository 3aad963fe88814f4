use spin::Mutex;
use x86_64::{
    structures::paging::{FrameAllocator, PhysFrame},
    PhysAddr,
};

use crate::memory::bitmap_frame_allocator::{BitmapFrameAllocator, FrameError};

/// The one frame allocator of the kernel, installed once the boot memory map is known.
pub static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator<'static>>> = Mutex::new(None);

/// Allocates the lowest free frame from the global allocator.
pub fn alloc_frame() -> Option<PhysFrame> {
    with_frame_allocator(|allocator| allocator.allocate_frame()).flatten()
}

/// Allocates `size` bytes of contiguous frames from the global allocator.
pub fn alloc_contiguous(size: usize) -> Result<PhysAddr, FrameError> {
    with_frame_allocator(|allocator| allocator.allocate(size)).unwrap_or(Err(FrameError::OutOfFrames))
}

/// Returns a frame to the global allocator.
pub fn dealloc_frame(addr: PhysAddr) {
    with_frame_allocator(|allocator| allocator.free(addr));
}

/// Runs `f` on the global allocator, or returns `None` before it is installed.
///
/// Interrupts stay disabled while the lock is held.
pub fn with_frame_allocator<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut BitmapFrameAllocator<'static>) -> R,
{
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut guard = FRAME_ALLOCATOR.lock();
        guard.as_mut().map(f)
    })
}
