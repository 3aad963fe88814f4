//! Legacy 8259 PIC pair and 8253/8254 PIT channel 0.
//!
//! Only IRQ0 is unmasked, remapped to `TIMER_VECTOR`.

use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::constants::{
    idt::{PIC2_OFFSET, PIT_FREQUENCY, TIMER_VECTOR},
    ports::{
        PIC1_COMMAND, PIC1_DATA, PIC2_COMMAND, PIC2_DATA, PIT_CHANNEL_0, PIT_MODE_COMMAND,
        POST_PORT,
    },
};

const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const PIC_EOI: u8 = 0x20;

/// Everything but IRQ0 masked on the master; all of the slave masked.
const MASTER_MASK: u8 = 0xFE;
const SLAVE_MASK: u8 = 0xFF;

/// Channel 0, lobyte/hibyte access, mode 2 (rate generator).
const PIT_RATE_GENERATOR: u8 = 0x34;

/// Gives the PIC time to settle between init words.
unsafe fn io_wait() {
    Port::<u8>::new(POST_PORT).write(0);
}

struct Pic {
    offset: u8,
    command: Port<u8>,
    data: Port<u8>,
}

struct ChainedPics {
    master: Pic,
    slave: Pic,
}

impl ChainedPics {
    const fn new(master_offset: u8, slave_offset: u8) -> Self {
        Self {
            master: Pic {
                offset: master_offset,
                command: Port::new(PIC1_COMMAND),
                data: Port::new(PIC1_DATA),
            },
            slave: Pic {
                offset: slave_offset,
                command: Port::new(PIC2_COMMAND),
                data: Port::new(PIC2_DATA),
            },
        }
    }

    unsafe fn initialize(&mut self) {
        self.master.command.write(ICW1_INIT);
        io_wait();
        self.slave.command.write(ICW1_INIT);
        io_wait();

        self.master.data.write(self.master.offset);
        io_wait();
        self.slave.data.write(self.slave.offset);
        io_wait();

        // Slave on IRQ2
        self.master.data.write(4);
        io_wait();
        self.slave.data.write(2);
        io_wait();

        self.master.data.write(ICW4_8086);
        io_wait();
        self.slave.data.write(ICW4_8086);
        io_wait();

        self.master.data.write(MASTER_MASK);
        self.slave.data.write(SLAVE_MASK);
    }

    unsafe fn notify_end_of_interrupt(&mut self, vector: u8) {
        if (self.slave.offset..self.slave.offset + 8).contains(&vector) {
            self.slave.command.write(PIC_EOI);
        }
        self.master.command.write(PIC_EOI);
    }
}

struct Pit {
    channel0: Port<u8>,
    mode_cmd: Port<u8>,
}

impl Pit {
    const fn new() -> Self {
        Self {
            channel0: Port::new(PIT_CHANNEL_0),
            mode_cmd: Port::new(PIT_MODE_COMMAND),
        }
    }

    unsafe fn configure_periodic(&mut self, divisor: u16) {
        self.mode_cmd.write(PIT_RATE_GENERATOR);

        // LSB first, then MSB
        self.channel0.write((divisor & 0xFF) as u8);
        self.channel0.write((divisor >> 8) as u8);
    }
}

static PICS: Mutex<ChainedPics> = Mutex::new(ChainedPics::new(TIMER_VECTOR, PIC2_OFFSET));

/// Reload value that makes channel 0 fire `hz` times a second.
///
/// Clamped to what the 16-bit counter can express; 0 stands for 65536.
pub fn pit_divisor(hz: u32) -> u16 {
    let hz = hz.max(1);
    let divisor = (PIT_FREQUENCY + hz / 2) / hz;
    match divisor {
        0 | 1 => 1,
        d if d >= 0x1_0000 => 0,
        d => d as u16,
    }
}

/// Remaps the PICs and starts the timer at `hz`.
pub fn init(hz: u32) {
    let divisor = pit_divisor(hz);
    unsafe {
        PICS.lock().initialize();
        Pit::new().configure_periodic(divisor);
    }
    log::info!("PIT running at {} Hz (divisor {})", hz, divisor);
}

/// Acknowledges the interrupt delivered on `vector`.
pub fn end_of_interrupt(vector: u8) {
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hundred_hertz_divisor() {
        assert_eq!(pit_divisor(100), 11932);
    }

    #[test]
    fn divisor_is_clamped() {
        assert_eq!(pit_divisor(PIT_FREQUENCY), 1);
        assert_eq!(pit_divisor(u32::MAX), 1);
        // Below ~18.2 Hz the counter wraps; 0 programs the slowest rate.
        assert_eq!(pit_divisor(1), 0);
        assert_eq!(pit_divisor(0), 0);
    }
}
