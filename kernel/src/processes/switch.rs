//! The register swap between two processes.
//!
//! `switch_context(prev, next)` stores the caller's registers into `prev`,
//! with `rip` pointing at a plain `ret`, then falls into
//! `load_context(next)`. `load_context` installs `next`'s address space when
//! it has its own, moves onto `next`'s stack, restores every register and
//! `rflags`, and returns into `next`'s saved `rip`.
//!
//! A process switched out this way reappears inside `switch_context` the
//! next time it is loaded, and returns from it as from a normal call.

use core::{arch::global_asm, mem::offset_of, ptr::NonNull};

use crate::processes::{process::Pid, registers::Registers};

const _: () = {
    assert!(offset_of!(Registers, rax) == 0);
    assert!(offset_of!(Registers, rbx) == 8);
    assert!(offset_of!(Registers, rcx) == 16);
    assert!(offset_of!(Registers, rdx) == 24);
    assert!(offset_of!(Registers, rsi) == 32);
    assert!(offset_of!(Registers, rdi) == 40);
    assert!(offset_of!(Registers, r8) == 48);
    assert!(offset_of!(Registers, r15) == 104);
    assert!(offset_of!(Registers, rbp) == 112);
    assert!(offset_of!(Registers, rsp) == 120);
    assert!(offset_of!(Registers, rip) == 128);
    assert!(offset_of!(Registers, rflags) == 136);
    assert!(offset_of!(Registers, cr3) == 144);
};

global_asm!(
    ".text",
    ".global switch_context",
    "switch_context:",
    "mov [rdi + 0], rax",
    "mov [rdi + 8], rbx",
    "mov [rdi + 16], rcx",
    "mov [rdi + 24], rdx",
    "mov [rdi + 32], rsi",
    "mov [rdi + 40], rdi",
    "mov [rdi + 48], r8",
    "mov [rdi + 56], r9",
    "mov [rdi + 64], r10",
    "mov [rdi + 72], r11",
    "mov [rdi + 80], r12",
    "mov [rdi + 88], r13",
    "mov [rdi + 96], r14",
    "mov [rdi + 104], r15",
    "mov [rdi + 112], rbp",
    // Points at our return address, so resuming at the label below returns
    // straight to the caller.
    "mov [rdi + 120], rsp",
    "lea rax, [rip + .Lswitch_resume]",
    "mov [rdi + 128], rax",
    "pushfq",
    "pop rax",
    "mov [rdi + 136], rax",
    "mov rdi, rsi",
    "jmp load_context",
    ".Lswitch_resume:",
    "ret",
    "",
    ".global load_context",
    "load_context:",
    "mov rax, [rdi + 144]",
    "test rax, rax",
    "jz .Lload_stack",
    "mov rcx, cr3",
    "cmp rax, rcx",
    "je .Lload_stack",
    "mov cr3, rax",
    ".Lload_stack:",
    "mov rsp, [rdi + 120]",
    "push qword ptr [rdi + 128]",
    "push qword ptr [rdi + 136]",
    "mov rax, [rdi + 0]",
    "mov rbx, [rdi + 8]",
    "mov rcx, [rdi + 16]",
    "mov rdx, [rdi + 24]",
    "mov rsi, [rdi + 32]",
    "mov r8, [rdi + 48]",
    "mov r9, [rdi + 56]",
    "mov r10, [rdi + 64]",
    "mov r11, [rdi + 72]",
    "mov r12, [rdi + 80]",
    "mov r13, [rdi + 88]",
    "mov r14, [rdi + 96]",
    "mov r15, [rdi + 104]",
    "mov rbp, [rdi + 112]",
    "mov rdi, [rdi + 40]",
    "popfq",
    "ret",
);

extern "C" {
    fn switch_context(prev: *mut Registers, next: *const Registers);
    fn load_context(next: *const Registers) -> !;
}

/// A switch decided by the scheduler but not yet carried out.
///
/// Both register files live in boxed process descriptors, which stay put
/// while they are in the process table.
#[derive(Debug)]
pub struct Switch {
    prev: Option<NonNull<Registers>>,
    next: NonNull<Registers>,
    pub prev_pid: Option<Pid>,
    pub next_pid: Pid,
}

impl Switch {
    pub(crate) fn new(
        prev: Option<(Pid, NonNull<Registers>)>,
        next: (Pid, NonNull<Registers>),
    ) -> Self {
        Self {
            prev: prev.map(|(_, regs)| regs),
            next: next.1,
            prev_pid: prev.map(|(pid, _)| pid),
            next_pid: next.0,
        }
    }

    /// Swaps to the next process.
    ///
    /// Returns once the previous process is scheduled again. Without a
    /// previous process this never returns.
    ///
    /// # Safety
    /// Interrupts must be disabled, no lock may be held, both descriptors
    /// must still be in the process table, and `next` must hold a valid
    /// stack and entry point.
    pub unsafe fn perform(self) {
        log::trace!("Switching {:?} -> {}", self.prev_pid, self.next_pid);
        match self.prev {
            Some(prev) => switch_context(prev.as_ptr(), self.next.as_ptr()),
            None => load_context(self.next.as_ptr()),
        }
    }
}
