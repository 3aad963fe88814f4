//! Boot memory map handling
//!
//! - Summarizes the memory map handed over by the bootloader
//! - Picks the frame pool (largest usable region) and the region that stores its bitmap

use core::fmt;

use x86_64::PhysAddr;

use crate::constants::memory::FRAME_SIZE;

/// The kind of a memory map entry, as reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    BootloaderReclaimable,
    KernelAndModules,
    Framebuffer,
}

/// One entry of the boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    pub fn is_usable(&self) -> bool {
        self.kind == RegionKind::Usable
    }
}

/// A span of physical memory: `[base, base + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRegion {
    pub base: PhysAddr,
    pub length: u64,
}

impl PhysRegion {
    pub const fn new(base: PhysAddr, length: u64) -> Self {
        Self { base, length }
    }

    /// First address past the region.
    pub fn end(&self) -> u64 {
        self.base.as_u64().saturating_add(self.length)
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.base && addr.as_u64() < self.end()
    }

    pub fn overlaps(&self, other: &PhysRegion) -> bool {
        self.base.as_u64() < other.end() && other.base.as_u64() < self.end()
    }

    /// Number of whole frames in the region.
    pub fn frame_count(&self) -> usize {
        (self.length / FRAME_SIZE as u64) as usize
    }
}

impl From<&MemoryRegion> for PhysRegion {
    fn from(region: &MemoryRegion) -> Self {
        PhysRegion::new(PhysAddr::new(region.base), region.length)
    }
}

/// Byte totals over the whole memory map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySummary {
    pub total: u64,
    pub usable: u64,
    pub reserved: u64,
}

/// Frame pool and bitmap storage chosen for the frame allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    pub pool: PhysRegion,
    pub bitmap: PhysRegion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    NoUsableMemory,
    PoolTooSmall,
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::NoUsableMemory => write!(f, "No usable memory region"),
            RegionError::PoolTooSmall => write!(f, "Usable region too small for a frame pool"),
        }
    }
}

/// Bytes needed to track `frames` frames with one bit each.
pub fn bitmap_bytes(frames: usize) -> usize {
    frames.div_ceil(8)
}

pub fn summarize(regions: &[MemoryRegion]) -> MemorySummary {
    let total: u64 = regions.iter().map(|r| r.length).sum();
    let usable: u64 = regions
        .iter()
        .filter(|r| r.is_usable())
        .map(|r| r.length)
        .sum();

    MemorySummary {
        total,
        usable,
        reserved: total - usable,
    }
}

/// Selects the largest usable region as the frame pool.
///
/// The bitmap goes into the largest remaining usable region that can hold it.
/// When none can, it is carved from the tail of the pool, which shrinks so the
/// two regions never overlap.
pub fn select_frame_pool(regions: &[MemoryRegion]) -> Result<PoolLayout, RegionError> {
    let (pool_index, largest) = regions
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_usable())
        .max_by_key(|(_, r)| r.length)
        .ok_or(RegionError::NoUsableMemory)?;

    let pool = PhysRegion::from(largest);
    let needed = bitmap_bytes(pool.frame_count()) as u64;

    let separate = regions
        .iter()
        .enumerate()
        .filter(|&(i, r)| i != pool_index && r.is_usable() && r.length >= needed)
        .max_by_key(|(_, r)| r.length);

    if let Some((_, region)) = separate {
        return Ok(PoolLayout {
            pool,
            bitmap: PhysRegion::from(region),
        });
    }

    // One frame of bitmap covers 32768 frames, so reserving whole frames at
    // the tail always leaves enough bits for what is left.
    let frame = FRAME_SIZE as u64;
    let bitmap_frames = needed.div_ceil(frame);
    let pool_frames = pool.length / frame;
    if pool_frames <= bitmap_frames {
        return Err(RegionError::PoolTooSmall);
    }

    let shrunk = PhysRegion::new(pool.base, (pool_frames - bitmap_frames) * frame);
    Ok(PoolLayout {
        pool: shrunk,
        bitmap: PhysRegion::new(
            PhysAddr::new(shrunk.end()),
            bitmap_frames * frame,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn usable(base: u64, length: u64) -> MemoryRegion {
        MemoryRegion::new(base, length, RegionKind::Usable)
    }

    #[test]
    fn summary_splits_usable_from_reserved() {
        let regions = [
            usable(0x1000, 0x9_e000),
            MemoryRegion::new(0x9_f000, 0x1000, RegionKind::Reserved),
            usable(0x10_0000, 64 * MIB),
            MemoryRegion::new(0xFD00_0000, 4 * MIB, RegionKind::Framebuffer),
        ];

        let summary = summarize(&regions);
        assert_eq!(summary.total, 0x9_e000 + 0x1000 + 64 * MIB + 4 * MIB);
        assert_eq!(summary.usable, 0x9_e000 + 64 * MIB);
        assert_eq!(summary.reserved, 0x1000 + 4 * MIB);
    }

    #[test]
    fn largest_usable_region_becomes_the_pool() {
        let regions = [
            usable(0x1000, 0x9_e000),
            MemoryRegion::new(0x20_0000, 512 * MIB, RegionKind::Reserved),
            usable(0x10_0000, 64 * MIB),
            usable(0x800_0000, 2 * MIB),
        ];

        let layout = select_frame_pool(&regions).unwrap();
        assert_eq!(layout.pool, PhysRegion::new(PhysAddr::new(0x10_0000), 64 * MIB));
        // 16384 frames need 2048 bytes; both other usable regions fit, the larger wins
        assert_eq!(layout.bitmap, PhysRegion::new(PhysAddr::new(0x800_0000), 2 * MIB));
        assert!(!layout.pool.overlaps(&layout.bitmap));
    }

    #[test]
    fn bitmap_is_carved_from_the_pool_when_nothing_else_fits() {
        let regions = [usable(0x10_0000, 64 * MIB), usable(0x1000, 0x400)];

        let layout = select_frame_pool(&regions).unwrap();
        assert_eq!(layout.bitmap.length, 4096);
        assert_eq!(layout.pool.length, 64 * MIB - 4096);
        assert_eq!(layout.bitmap.base.as_u64(), layout.pool.end());
        assert!(!layout.pool.overlaps(&layout.bitmap));
        assert!(layout.bitmap.length >= bitmap_bytes(layout.pool.frame_count()) as u64);
    }

    #[test]
    fn no_usable_memory_is_an_error() {
        let regions = [MemoryRegion::new(0, MIB, RegionKind::Reserved)];
        assert_eq!(select_frame_pool(&regions), Err(RegionError::NoUsableMemory));
        assert_eq!(select_frame_pool(&[]), Err(RegionError::NoUsableMemory));
    }

    #[test]
    fn single_frame_pool_cannot_hold_its_own_bitmap() {
        let regions = [usable(0x10_0000, 4096)];
        assert_eq!(select_frame_pool(&regions), Err(RegionError::PoolTooSmall));
    }

    #[test]
    fn region_geometry() {
        let region = PhysRegion::new(PhysAddr::new(0x10_0000), MIB);
        assert_eq!(region.end(), 0x20_0000);
        assert_eq!(region.frame_count(), 256);
        assert!(region.contains(PhysAddr::new(0x10_0000)));
        assert!(region.contains(PhysAddr::new(0x1F_FFFF)));
        assert!(!region.contains(PhysAddr::new(0x20_0000)));

        let neighbour = PhysRegion::new(PhysAddr::new(0x20_0000), MIB);
        assert!(!region.overlaps(&neighbour));
        let straddling = PhysRegion::new(PhysAddr::new(0x1F_F000), 0x2000);
        assert!(region.overlaps(&straddling));
    }
}
