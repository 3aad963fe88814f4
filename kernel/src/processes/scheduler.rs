//! Round-robin scheduler
//!
//! One core, one bounded table of process descriptors in registration
//! order. The running process keeps the CPU until `tick_frequency` timer
//! ticks have passed, then the next READY or IDLE process after it in the
//! table gets it.

use alloc::{
    alloc::{alloc, Layout},
    boxed::Box,
};
use core::{fmt, ptr::NonNull};

use arrayvec::ArrayVec;
use spin::Mutex;
use x86_64::{instructions::interrupts::without_interrupts, PrivilegeLevel};

use crate::{
    constants::processes::{
        DEFAULT_TICK_FREQUENCY, INITIAL_RFLAGS, MAX_PROCESSES, STACK_SENTINEL, TICK_PERIOD_NS,
    },
    processes::{
        process::{CpuState, Pid, Process, ProcessConfig, ProcessState},
        registers::Registers,
        switch::Switch,
    },
};

/// Smallest stack that fits the sentinel plus the two words pushed while
/// loading a context.
const MIN_STACK_SIZE: u64 = 3 * core::mem::size_of::<u64>() as u64;

/// Stack tops are rounded down to this, so entry points start with the SysV
/// alignment (`rsp + 8` a multiple of 16).
const STACK_ALIGN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// The process table already holds `MAX_PROCESSES` entries.
    TableFull,
    InvalidStack,
    OutOfMemory,
    NoSuchProcess,
    InvalidTransition,
    ZeroQuantum,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::TableFull => write!(f, "Process table full"),
            SchedulerError::InvalidStack => write!(f, "Invalid process stack"),
            SchedulerError::OutOfMemory => write!(f, "No memory for a process descriptor"),
            SchedulerError::NoSuchProcess => write!(f, "No such process"),
            SchedulerError::InvalidTransition => write!(f, "Invalid process state transition"),
            SchedulerError::ZeroQuantum => write!(f, "Quantum must be at least one tick"),
        }
    }
}

pub struct Scheduler {
    table: ArrayVec<Box<Process>, MAX_PROCESSES>,
    current: Option<usize>,
    next_pid: Pid,
    ticks: u64,
    tick_frequency: u32,
    tick_period_ns: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            table: ArrayVec::new_const(),
            current: None,
            next_pid: 1,
            ticks: 0,
            tick_frequency: DEFAULT_TICK_FREQUENCY,
            tick_period_ns: TICK_PERIOD_NS,
        }
    }

    /// Drops every process and starts over with pid 1.
    pub fn reset(&mut self) {
        self.table.clear();
        self.current = None;
        self.next_pid = 1;
        self.ticks = 0;
    }

    /// Builds a NEW process that starts at `config.entry` with
    /// `config.arg` in rdi, on the stack `config` describes.
    ///
    /// The top of the stack is rounded down to 16 bytes; what remains must
    /// still hold the sentinel and the two words pushed on first load.
    ///
    /// # Safety
    /// The stack must be writable memory owned by the new process.
    pub unsafe fn create_proc(
        &mut self,
        config: &ProcessConfig,
    ) -> Result<Box<Process>, SchedulerError> {
        let stack_base = config.stack_base.as_u64();
        let stack_top = stack_base
            .checked_add(config.stack_size)
            .ok_or(SchedulerError::InvalidStack)?
            & !(STACK_ALIGN - 1);
        if stack_top < stack_base.saturating_add(MIN_STACK_SIZE) {
            return Err(SchedulerError::InvalidStack);
        }

        let rsp = stack_top - 8;
        (rsp as *mut u64).write(STACK_SENTINEL);

        let privilege = PrivilegeLevel::from_u16(u16::from(config.privilege & 0b11));
        let regs = Registers {
            rip: config.entry,
            rsp,
            rflags: INITIAL_RFLAGS,
            rdi: config.arg,
            cr3: config.root.map_or(0, |frame| frame.start_address().as_u64()),
            ..Registers::new()
        };
        let cpu = CpuState {
            entry: config.entry,
            kernel_stack: stack_base,
            user_stack: stack_top,
            kernel: privilege == PrivilegeLevel::Ring0,
            regs,
            ..CpuState::default()
        };

        self.allocate_descriptor(privilege, config.heap_base, config.heap_size, cpu)
    }

    /// Descriptor for the code already running on the boot stack.
    ///
    /// Its registers are filled in the first time it is switched out.
    pub fn create_boot_proc(&mut self) -> Result<Box<Process>, SchedulerError> {
        let cpu = CpuState {
            kernel: true,
            ..CpuState::default()
        };
        self.allocate_descriptor(PrivilegeLevel::Ring0, 0, 0, cpu)
    }

    fn allocate_descriptor(
        &mut self,
        privilege: PrivilegeLevel,
        heap_base: u64,
        heap_size: u64,
        cpu: CpuState,
    ) -> Result<Box<Process>, SchedulerError> {
        let process = Process {
            pid: self.next_pid,
            core_id: 0,
            state: ProcessState::New,
            privilege,
            thread_id: 0,
            heap_start: heap_base,
            heap_end: heap_base.saturating_add(heap_size),
            cpu,
        };

        let layout = Layout::new::<Process>();
        let ptr = unsafe { alloc(layout) } as *mut Process;
        if ptr.is_null() {
            log::warn!("Out of memory for the descriptor of pid {}", self.next_pid);
            return Err(SchedulerError::OutOfMemory);
        }

        self.next_pid += 1;
        unsafe {
            ptr.write(process);
            Ok(Box::from_raw(ptr))
        }
    }

    /// Adds `process` to the table as READY.
    ///
    /// The first process registered while nothing runs becomes the current
    /// one, in state RUNNING.
    pub fn register_proc(&mut self, mut process: Box<Process>) -> Result<Pid, SchedulerError> {
        if self.table.is_full() {
            log::warn!("Process table full, pid {} not registered", process.pid);
            return Err(SchedulerError::TableFull);
        }

        let pid = process.pid;
        process.state = ProcessState::Ready;
        process.cpu.time_slice = self.time_slice();
        self.table.push(process);

        if self.current.is_none() {
            let index = self.table.len() - 1;
            self.table[index].state = ProcessState::Running;
            self.current = Some(index);
        }

        log::debug!("Registered process {}", pid);
        Ok(pid)
    }

    pub fn current(&self) -> Option<&Process> {
        self.current.map(|index| &*self.table[index])
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current().map(|process| process.pid)
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.table.iter().find(|p| p.pid == pid).map(|p| &**p)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick_frequency(&self) -> u32 {
        self.tick_frequency
    }

    /// Sets the quantum to `ticks` timer ticks.
    pub fn set_tick_frequency(&mut self, ticks: u32) -> Result<(), SchedulerError> {
        if ticks == 0 {
            return Err(SchedulerError::ZeroQuantum);
        }
        self.tick_frequency = ticks;

        let slice = self.time_slice();
        for process in self.table.iter_mut() {
            process.cpu.time_slice = slice;
        }
        Ok(())
    }

    /// Moves `pid` to `state`. RUNNING is reserved to the scheduler itself.
    pub fn set_state(&mut self, pid: Pid, state: ProcessState) -> Result<(), SchedulerError> {
        let process = self
            .table
            .iter_mut()
            .find(|p| p.pid == pid)
            .ok_or(SchedulerError::NoSuchProcess)?;

        if state == ProcessState::Running || !process.state.can_transition_to(state) {
            return Err(SchedulerError::InvalidTransition);
        }

        log::debug!("Process {}: {:?} -> {:?}", pid, process.state, state);
        process.state = state;
        Ok(())
    }

    /// Slot of the first runnable process after the current one, wrapping
    /// around the table.
    pub fn find_next(&self) -> Option<usize> {
        let len = self.table.len();
        let start = self.current.map_or(0, |index| index + 1);

        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&index| self.table[index].state.is_runnable())
    }

    /// Hands the CPU to the next runnable process.
    ///
    /// Returns `None` when nobody else can run. The previous process goes
    /// back to READY only if it was still RUNNING.
    pub fn prepare_switch(&mut self) -> Option<Switch> {
        let next = self.find_next()?;
        if self.current == Some(next) {
            return None;
        }

        let prev = self.current.map(|index| {
            let process = &mut self.table[index];
            if process.state == ProcessState::Running {
                process.state = ProcessState::Ready;
            }
            (process.pid, NonNull::from(&mut process.cpu.regs))
        });

        let process = &mut self.table[next];
        process.state = ProcessState::Running;
        let next_handle = (process.pid, NonNull::from(&mut process.cpu.regs));
        self.current = Some(next);

        Some(Switch::new(prev, next_handle))
    }

    /// Accounts one timer tick, and switches every `tick_frequency` ticks.
    pub fn tick(&mut self) -> Option<Switch> {
        self.ticks += 1;
        if let Some(index) = self.current {
            self.table[index].cpu.time_used += self.tick_period_ns;
        }

        if self.ticks % u64::from(self.tick_frequency) == 0 {
            self.prepare_switch()
        } else {
            None
        }
    }

    fn time_slice(&self) -> u64 {
        u64::from(self.tick_frequency) * self.tick_period_ns
    }
}

pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Timer entry point.
pub fn tick() {
    without_interrupts(|| {
        let switch = SCHEDULER.lock().tick();
        if let Some(switch) = switch {
            unsafe { switch.perform() };
        }
    });
}

/// Gives up the CPU to the next runnable process, if any.
pub fn context_switch() {
    without_interrupts(|| {
        let switch = SCHEDULER.lock().prepare_switch();
        if let Some(switch) = switch {
            unsafe { switch.perform() };
        }
    });
}

/// # Safety
/// See [`Scheduler::create_proc`].
pub unsafe fn create_proc(config: &ProcessConfig) -> Result<Box<Process>, SchedulerError> {
    without_interrupts(|| SCHEDULER.lock().create_proc(config))
}

pub fn register_proc(process: Box<Process>) -> Result<Pid, SchedulerError> {
    without_interrupts(|| SCHEDULER.lock().register_proc(process))
}

pub fn current_pid() -> Option<Pid> {
    without_interrupts(|| SCHEDULER.lock().current_pid())
}
