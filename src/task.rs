use crate::perf_counters::CounterSnapshot;
use crate::registers::Registers;
use libc::pid_t;

/// Bookkeeping for one traced thread of execution. Created on trace-setup
/// spawn or on an observed fork/clone/exec event; destroyed on observed
/// exit; never resurrected.
pub struct Task {
    pub tid: pid_t,
    /// Mirror of the task's register file. Consistent with actual host
    /// state immediately after any task-control call returns.
    pub regs: Registers,
    /// Per-task local event counter; increments once per frame recorded or
    /// replayed for this task.
    pub thread_time: u64,
    /// Cumulative counters at the last event, for per-frame deltas.
    pub counters: CounterSnapshot,
    /// Key identifying the task's address space: shared with sibling
    /// threads, exclusive otherwise.
    pub vm_key: pid_t,
    pub exited: bool,
}

impl Task {
    pub fn new(tid: pid_t, vm_key: pid_t) -> Task {
        Task {
            tid,
            regs: Registers::default(),
            thread_time: 0,
            counters: CounterSnapshot::default(),
            vm_key,
            exited: false,
        }
    }
}
