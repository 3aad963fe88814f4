//! Higher-half direct map (HHDM)
//!
//! All physical memory is reachable at a fixed virtual offset, so frames can be
//! touched without walking page tables.

use x86_64::{PhysAddr, VirtAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Virtual alias of `paddr`. Addresses already inside the direct map are
    /// returned unchanged.
    pub fn phys_to_virt(&self, paddr: PhysAddr) -> VirtAddr {
        let addr = paddr.as_u64();
        if addr >= self.offset {
            return VirtAddr::new_truncate(addr);
        }
        VirtAddr::new_truncate(self.offset + addr)
    }

    /// Physical address behind `vaddr`. Addresses below the offset are taken
    /// to be physical already.
    pub fn virt_to_phys(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let addr = vaddr.as_u64();
        if addr < self.offset {
            return PhysAddr::try_new(addr).ok();
        }
        PhysAddr::try_new(addr - self.offset).ok()
    }
}
