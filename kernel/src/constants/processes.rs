/// Capacity of the process table.
pub const MAX_PROCESSES: usize = 1024;

/// Quantum in timer ticks.
pub const DEFAULT_TICK_FREQUENCY: u32 = 10;

/// Length of one timer tick in nanoseconds.
pub const TICK_PERIOD_NS: u64 = 1_000_000_000 / super::idt::TIMER_FREQUENCY as u64;

/// IF set, plus the always-one reserved bit.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Return address planted at the top of every new stack.
pub const STACK_SENTINEL: u64 = 0;

/// Size of each demo worker's stack.
pub const STACK_SIZE: usize = 4 * 4096;
