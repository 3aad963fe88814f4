use core::arch::asm;

use x86_64::VirtAddr;

/// Drops the cached translation of the page containing `target_vaddr` on this core.
///
/// Single core only: there is no shootdown to other processors.
pub fn invalidate(target_vaddr: VirtAddr) {
    let vaddr = target_vaddr.as_u64();

    unsafe {
        asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
    }
}
