#![no_std]
#![no_main]

use asnu::{
    constants::processes::STACK_SIZE,
    idle_loop, init,
    interrupts::{self, idt},
    memory::{self, frame_allocator::alloc_contiguous},
    processes::{process::ProcessConfig, scheduler},
    serial_println,
};
use x86_64::instructions::hlt;

const WORKERS: u64 = 3;

/// Wakes on every timer tick and reports every 50 of them.
extern "C" fn worker(id: u64) -> ! {
    let mut round: u64 = 0;
    loop {
        round += 1;
        if round % 50 == 0 {
            log::info!(
                "Worker {} (pid {:?}) at round {}",
                id,
                scheduler::current_pid(),
                round
            );
        }
        hlt();
    }
}

fn spawn_worker(id: u64) {
    let stack = alloc_contiguous(STACK_SIZE)
        .ok()
        .and_then(memory::phys_to_virt);
    let Some(stack_base) = stack else {
        log::warn!("No stack for worker {}", id);
        return;
    };

    let entry = (worker as extern "C" fn(u64) -> !) as usize as u64;
    let config = ProcessConfig::kernel(entry, id, stack_base, STACK_SIZE as u64);
    let registered = unsafe { scheduler::create_proc(&config) }.and_then(scheduler::register_proc);
    match registered {
        Ok(pid) => log::info!("Worker {} is process {}", id, pid),
        Err(e) => log::warn!("Worker {} not started: {}", id, e),
    }
}

#[no_mangle]
extern "C" fn kmain() -> ! {
    let boot_pid = init::init();
    log::info!("Boot context is process {}", boot_pid);

    for id in 0..WORKERS {
        spawn_worker(id);
    }

    interrupts::init_timer();
    idt::enable();

    idle_loop();
}

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    asnu::halt_forever();
}
