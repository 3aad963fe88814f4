use crate::constants::idt::TIMER_FREQUENCY;

pub mod gdt;
pub mod idt;
pub mod pit;

/// Loads the descriptor tables. Exceptions are handled from here on.
pub fn init() {
    gdt::init();
    idt::init_idt();
}

/// Starts the scheduler tick. Takes effect once interrupts are enabled.
pub fn init_timer() {
    pit::init(TIMER_FREQUENCY);
}
