use core::fmt;

use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::{
    constants::memory::FRAME_SIZE,
    memory::{
        direct_map::DirectMap,
        regions::{bitmap_bytes, PhysRegion},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// No free frame, or no contiguous run long enough.
    OutOfFrames,
    ZeroSize,
    EmptyRegion,
    Unaligned,
    Overlap,
    BitmapTooSmall,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::OutOfFrames => write!(f, "Out of physical frames"),
            FrameError::ZeroSize => write!(f, "Zero-sized allocation"),
            FrameError::EmptyRegion => write!(f, "Region holds no whole frame"),
            FrameError::Unaligned => write!(f, "Region base is not frame aligned"),
            FrameError::Overlap => write!(f, "Bitmap overlaps the frame pool"),
            FrameError::BitmapTooSmall => write!(f, "Bitmap storage too small for the pool"),
        }
    }
}

/// First-fit bitmap allocator over a single physical region.
///
/// * `region`: the frames handed out
/// * `bitmap_region`: where the bitmap itself lives, disjoint from `region`
/// * `bitmap`: one bit per frame of `region`, 1 = allocated
pub struct BitmapFrameAllocator<'a> {
    region: PhysRegion,
    bitmap_region: PhysRegion,
    bitmap: &'a mut [u8],
    total_frames: usize,
    free_frames: usize,
}

impl<'a> BitmapFrameAllocator<'a> {
    /// Takes ownership of `bitmap` as the metadata for `region` and clears it.
    ///
    /// `bitmap` must be the memory that `bitmap_region` describes; only its
    /// first `ceil(frames / 8)` bytes are used.
    pub fn new(
        region: PhysRegion,
        bitmap_region: PhysRegion,
        bitmap: &'a mut [u8],
    ) -> Result<Self, FrameError> {
        if !region.base.is_aligned(FRAME_SIZE as u64) {
            return Err(FrameError::Unaligned);
        }

        let total_frames = region.frame_count();
        if total_frames == 0 {
            return Err(FrameError::EmptyRegion);
        }

        if region.overlaps(&bitmap_region) {
            return Err(FrameError::Overlap);
        }

        let needed = bitmap_bytes(total_frames);
        if (bitmap_region.length as usize) < needed || bitmap.len() < needed {
            return Err(FrameError::BitmapTooSmall);
        }

        let bitmap = &mut bitmap[..needed];
        bitmap.fill(0);

        Ok(Self {
            region,
            bitmap_region: PhysRegion::new(bitmap_region.base, needed as u64),
            bitmap,
            total_frames,
            free_frames: total_frames,
        })
    }

    /// Builds the allocator with its bitmap reached through the direct map.
    ///
    /// # Safety
    /// `bitmap_region` must be usable RAM, mapped by `direct_map`, that nothing
    /// else references for the rest of the kernel's lifetime.
    pub unsafe fn from_direct_map(
        region: PhysRegion,
        bitmap_region: PhysRegion,
        direct_map: &DirectMap,
    ) -> Result<BitmapFrameAllocator<'static>, FrameError> {
        let len = bitmap_bytes(region.frame_count()).min(bitmap_region.length as usize);
        let ptr = direct_map.phys_to_virt(bitmap_region.base).as_mut_ptr::<u8>();
        let bitmap = core::slice::from_raw_parts_mut(ptr, len);
        BitmapFrameAllocator::new(region, bitmap_region, bitmap)
    }

    pub fn region(&self) -> PhysRegion {
        self.region
    }

    pub fn bitmap_region(&self) -> PhysRegion {
        self.bitmap_region
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_frames
    }

    /// Allocates `size` bytes as one contiguous run of frames, first fit.
    ///
    /// # Returns
    /// The physical address of the first frame in the run
    pub fn allocate(&mut self, size: usize) -> Result<PhysAddr, FrameError> {
        if size == 0 {
            return Err(FrameError::ZeroSize);
        }

        let count = size.div_ceil(FRAME_SIZE);
        if count > self.free_frames {
            return Err(FrameError::OutOfFrames);
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..self.total_frames {
            if self.is_bit_set(index) {
                run_len = 0;
                continue;
            }

            if run_len == 0 {
                run_start = index;
            }
            run_len += 1;

            if run_len == count {
                for frame_index in run_start..run_start + count {
                    self.set_bit(frame_index);
                }
                return Ok(self.frame_address(run_start));
            }
        }

        Err(FrameError::OutOfFrames)
    }

    /// Returns the frame at `addr` to the pool.
    ///
    /// Addresses outside the region, unaligned addresses and frames that are
    /// already free are ignored.
    pub fn free(&mut self, addr: PhysAddr) {
        if !self.region.contains(addr) || !addr.is_aligned(FRAME_SIZE as u64) {
            return;
        }

        if let Some(index) = self.frame_index(addr) {
            self.clear_bit(index);
        }
    }

    /// Check if frame is used. Frames outside the region never are.
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        self.frame_index(frame.start_address())
            .is_some_and(|index| self.is_bit_set(index))
    }

    fn frame_index(&self, addr: PhysAddr) -> Option<usize> {
        let offset = addr.as_u64().checked_sub(self.region.base.as_u64())?;
        let index = (offset / FRAME_SIZE as u64) as usize;
        (index < self.total_frames).then_some(index)
    }

    fn frame_address(&self, index: usize) -> PhysAddr {
        self.region.base + (index * FRAME_SIZE) as u64
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        if frame_index >= self.total_frames || self.is_bit_set(frame_index) {
            return;
        }

        self.bitmap[frame_index / 8] |= 1 << (frame_index % 8);
        self.free_frames -= 1;
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        if frame_index >= self.total_frames || !self.is_bit_set(frame_index) {
            return;
        }

        self.bitmap[frame_index / 8] &= !(1 << (frame_index % 8));
        self.free_frames += 1;
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        if frame_index >= self.total_frames {
            return false;
        }

        (self.bitmap[frame_index / 8] & (1 << (frame_index % 8))) != 0
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator<'_> {
    /// Allocates the lowest free frame
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.free_frames == 0 {
            return None;
        }

        let index = (0..self.total_frames).find(|&i| !self.is_bit_set(i))?;
        self.set_bit(index);
        Some(PhysFrame::containing_address(self.frame_address(index)))
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator<'_> {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free(frame.start_address());
    }
}
