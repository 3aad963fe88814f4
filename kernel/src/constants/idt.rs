//! Interrupt Descriptor Table and timer configuration.

/// Vector the master PIC delivers IRQ0 (the PIT) on.
pub const TIMER_VECTOR: u8 = 32;

/// First vector of the slave PIC after remapping.
pub const PIC2_OFFSET: u8 = TIMER_VECTOR + 8;

/// Timer interrupt frequency in Hertz.
/// One scheduler tick happens per interrupt.
pub const TIMER_FREQUENCY: u32 = 100;

/// Input frequency of the programmable interval timer.
pub const PIT_FREQUENCY: u32 = 1_193_182;
