#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

use x86_64::instructions::hlt;

pub mod constants;
pub mod devices;
pub mod init;
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod processes;

pub use devices::serial;

pub mod prelude {
    pub use crate::debug_print;
    pub use crate::debug_println;
    pub use crate::serial_print;
    pub use crate::serial_println;
}

#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_print!($($arg)*);
    }
}

#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_println!($($arg)*);
    }
}

/// Sleeps between interrupts forever.
pub fn idle_loop() -> ! {
    loop {
        hlt();
    }
}

/// Stops this CPU for good.
pub fn halt_forever() -> ! {
    interrupts::idt::disable();
    loop {
        hlt();
    }
}
