pub const FRAME_SIZE: usize = 4096;

/// Kernel heap, in the top PML4 slot below the kernel image at
/// 0xFFFF_FFFF_8000_0000.
pub const HEAP_START: *mut u8 = 0xFFFF_FFFF_0000_0000 as *mut u8;
pub const HEAP_SIZE: usize = 1024 * 1024; // 1 MB

/// Physical address bits of a page table entry.
pub const PAGE_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Entry bits a caller may supply as mapping attributes. Everything else is
/// the frame address.
pub const ATTRIBUTE_MASK: u64 = 0xFFF0_0000_0000_0FFF;
