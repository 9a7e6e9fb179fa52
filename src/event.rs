use crate::kernel_metadata::{signal_name, syscall_name};
use libc::pid_t;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;

/// Raw reason codes for events that are not syscalls or signals, used in the
/// machine-parseable dump format. Syscalls dump their (non-negative) number,
/// signals their negated number.
pub const RAW_REASON_SCHED: i64 = -1000;
pub const RAW_REASON_EXIT: i64 = -1001;
pub const RAW_REASON_FORK: i64 = -1002;
pub const RAW_REASON_EXEC: i64 = -1003;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum SyscallState {
    EnteringSyscall,
    ExitingSyscall,
}

impl Display for SyscallState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyscallState::EnteringSyscall => write!(f, "ENTERING_SYSCALL"),
            SyscallState::ExitingSyscall => write!(f, "EXITING_SYSCALL"),
        }
    }
}

/// The reason a trace frame was emitted. Events guide replay: each one names
/// the stop the replayer must force the corresponding task to reach.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum Event {
    /// Task or thread-group exit was observed. Ends the task's participation
    /// in scheduling; not an error.
    Exit,
    /// Scheduler-imposed preemption: the running task exhausted its quantum.
    Sched,
    Signal {
        sig: i32,
    },
    Syscall {
        no: i64,
        state: SyscallState,
    },
    /// A new task appeared via fork/clone.
    Fork {
        child: pid_t,
    },
    /// The task replaced its image via exec.
    Exec,
}

impl Event {
    pub fn is_syscall_event(&self) -> bool {
        matches!(self, Event::Syscall { .. })
    }

    pub fn is_syscall_exit(&self) -> bool {
        matches!(
            self,
            Event::Syscall {
                state: SyscallState::ExitingSyscall,
                ..
            }
        )
    }

    /// The entry/exit phase flag for the raw dump: 1 on syscall entry,
    /// 0 everywhere else.
    pub fn raw_phase(&self) -> u32 {
        match self {
            Event::Syscall {
                state: SyscallState::EnteringSyscall,
                ..
            } => 1,
            _ => 0,
        }
    }

    pub fn raw_reason(&self) -> i64 {
        match *self {
            Event::Exit => RAW_REASON_EXIT,
            Event::Sched => RAW_REASON_SCHED,
            Event::Signal { sig } => -(sig as i64),
            Event::Syscall { no, .. } => no,
            Event::Fork { .. } => RAW_REASON_FORK,
            Event::Exec => RAW_REASON_EXEC,
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Event::Exit => write!(f, "EXIT"),
            Event::Sched => write!(f, "SCHED"),
            Event::Signal { sig } => write!(f, "SIGNAL: {}", signal_name(sig)),
            Event::Syscall { no, state } => {
                write!(f, "SYSCALL: {} (state:{})", syscall_name(no), state)
            }
            Event::Fork { child } => write!(f, "FORK: child {}", child),
            Event::Exec => write!(f, "EXEC"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_reason_encoding() {
        assert_eq!(
            libc::SYS_read,
            Event::Syscall {
                no: libc::SYS_read,
                state: SyscallState::EnteringSyscall
            }
            .raw_reason()
        );
        assert_eq!(-11, Event::Signal { sig: 11 }.raw_reason());
        assert_eq!(RAW_REASON_SCHED, Event::Sched.raw_reason());
    }

    #[test]
    fn phase_flag_only_set_on_entry() {
        let entry = Event::Syscall {
            no: 0,
            state: SyscallState::EnteringSyscall,
        };
        let exit = Event::Syscall {
            no: 0,
            state: SyscallState::ExitingSyscall,
        };
        assert_eq!(1, entry.raw_phase());
        assert_eq!(0, exit.raw_phase());
        assert_eq!(0, Event::Sched.raw_phase());
    }
}
