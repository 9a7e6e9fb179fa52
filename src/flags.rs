use crate::event::{Event, SyscallState};
use crate::ticks::{Ticks, DEFAULT_MAX_EVENTS, DEFAULT_MAX_TICKS};
use crate::trace::trace_frame::FrameTime;
use libc::pid_t;

/// When to generate or check memory checksums: at the end of every syscall,
/// at all events, or starting from a given global timepoint.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Checksum {
    ChecksumSyscall,
    ChecksumAll,
    ChecksumAt(FrameTime),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DumpOn {
    DumpOnSignal(i32),
    DumpOnSyscall(i64),
}

/// How the debugger target process comes into existence during replay.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CreatedHow {
    CreatedFork,
    CreatedExec,
}

/// Immutable session configuration, constructed once from the parsed command
/// line and passed by reference into the recorder, replayer and scheduler.
/// There is deliberately no global accessor.
#[derive(Clone, Debug)]
pub struct Flags {
    pub checksum: Option<Checksum>,
    pub dump_on: Option<DumpOn>,
    pub dump_at: Option<FrameTime>,

    /// Maximum ticks a task may run before a scheduler interrupt.
    pub max_ticks: Ticks,
    /// Maximum events a task may accumulate before being descheduled.
    pub max_events: u64,

    pub use_syscall_buffer: bool,
    /// Block this signal from being delivered to tracees while recording.
    pub ignore_sig: Option<i32>,

    /// Allow tracees to run on any CPU instead of pinning to CPU 0.
    /// Can cause replay divergence: use with caution.
    pub cpu_unbound: bool,

    /// Replay: start a debugger stop on reaching this global time.
    pub goto_event: Option<FrameTime>,
    /// Replay: stop when this process has been created...
    pub target_process: Option<pid_t>,
    /// ...in this way.
    pub process_created_how: Option<CreatedHow>,
}

impl Flags {
    /// Whether --dump-on/--dump-at asks for a memory dump at this frame.
    /// Shared by recorder and replayer so the `_rec`/`_rep` dump pairs are
    /// taken at identical points.
    pub fn wants_memory_dump(&self, ev: &Event, time: FrameTime) -> bool {
        if self.dump_at == Some(time) {
            return true;
        }
        match (self.dump_on, ev) {
            (Some(DumpOn::DumpOnSyscall(no)), Event::Syscall { no: got, state }) => {
                *got == no && *state == SyscallState::ExitingSyscall
            }
            (Some(DumpOn::DumpOnSignal(sig)), Event::Signal { sig: got }) => *got == sig,
            _ => false,
        }
    }
}

impl Default for Flags {
    fn default() -> Flags {
        Flags {
            checksum: None,
            dump_on: None,
            dump_at: None,
            max_ticks: DEFAULT_MAX_TICKS,
            max_events: DEFAULT_MAX_EVENTS,
            use_syscall_buffer: true,
            ignore_sig: None,
            cpu_unbound: false,
            goto_event: None,
            target_process: None,
            process_created_how: None,
        }
    }
}
