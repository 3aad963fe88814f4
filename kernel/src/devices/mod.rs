//! Device management.
//!
//! Only the COM1 serial port is driven; it carries every log line.

pub mod serial;
