use x86_64::{structures::paging::PhysFrame, PrivilegeLevel, VirtAddr};

use crate::processes::registers::Registers;

pub type Pid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Waiting,
    Sleeping,
    Terminated,
    Suspended,
    Idle,
}

impl ProcessState {
    /// Whether a process in `self` may move to `next`.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;

        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (New, Ready) => true,
            (Ready | Idle, Running) => true,
            (Running, Ready | Waiting | Sleeping | Suspended) => true,
            (Waiting | Sleeping | Suspended, Ready) => true,
            _ => false,
        }
    }

    /// Whether the scheduler may pick a process in this state.
    pub fn is_runnable(self) -> bool {
        matches!(self, ProcessState::Ready | ProcessState::Idle)
    }
}

/// Execution state of a process's single thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuState {
    pub id: u32,
    pub entry: u64,
    /// Lowest address of the stack.
    pub kernel_stack: u64,
    /// One past the highest address of the stack.
    pub user_stack: u64,
    pub pages_mapped: u64,
    /// Nanoseconds spent running.
    pub time_used: u64,
    /// Nanoseconds granted per quantum.
    pub time_slice: u64,
    pub kernel: bool,
    pub regs: Registers,
}

#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub core_id: u32,
    pub state: ProcessState,
    pub privilege: PrivilegeLevel,
    pub thread_id: u32,
    pub heap_start: u64,
    pub heap_end: u64,
    pub cpu: CpuState,
}

impl Process {
    pub fn is_kernel(&self) -> bool {
        self.cpu.kernel
    }
}

/// Everything needed to build a new process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessConfig {
    pub entry: u64,
    /// Passed to the entry point in rdi.
    pub arg: u64,
    /// Ring, only the low two bits are kept.
    pub privilege: u8,
    pub stack_base: VirtAddr,
    pub stack_size: u64,
    pub heap_base: u64,
    pub heap_size: u64,
    /// Address space to run in, `None` to stay in the current one.
    pub root: Option<PhysFrame>,
}

impl ProcessConfig {
    /// A kernel thread running `entry(arg)` on the given stack.
    pub fn kernel(entry: u64, arg: u64, stack_base: VirtAddr, stack_size: u64) -> Self {
        Self {
            entry,
            arg,
            privilege: 0,
            stack_base,
            stack_size,
            heap_base: 0,
            heap_size: 0,
            root: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ProcessState::*;

    #[test]
    fn lifecycle_transitions() {
        assert!(New.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Running));
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Ready));
        assert!(Running.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Ready));
        assert!(Sleeping.can_transition_to(Ready));
        assert!(Suspended.can_transition_to(Ready));
    }

    #[test]
    fn terminated_is_final() {
        for state in [New, Ready, Running, Waiting, Sleeping, Terminated, Suspended, Idle] {
            assert!(!Terminated.can_transition_to(state));
        }
        assert!(New.can_transition_to(Terminated));
        assert!(Waiting.can_transition_to(Terminated));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!New.can_transition_to(Running));
        assert!(!Waiting.can_transition_to(Running));
        assert!(!Ready.can_transition_to(Waiting));
        assert!(!Running.can_transition_to(New));
    }
}
