//! System-wide constants and hardware-specific values.

pub mod gdt;
pub mod idt;
pub mod memory;
pub mod ports;
pub mod processes;
