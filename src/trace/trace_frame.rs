use crate::checksum::ChecksumRecord;
use crate::event::Event;
use crate::registers::Registers;
use crate::ticks::Ticks;
use libc::pid_t;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};

pub type FrameTime = u64;

/// Header line for the machine-parseable dump format; the per-frame fields
/// appear in exactly this order.
pub const RAW_DUMP_HEADER: &str = "global_time thread_time tid reason entry/exit \
     hw_interrupts page_faults adapted_ticks instructions \
     rax rbx rcx rdx rsi rdi rbp orig_rax rsp rip eflags";

/// Memory written by a recorded syscall, replayed back verbatim.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct MemRecord {
    pub addr: u64,
    pub data: Vec<u8>,
}

/// One scheduling/event step. `global_time` is the trace's primary key:
/// strictly increasing across the stream, and frames must be consumed in
/// that order for correct replay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceFrame {
    pub global_time: FrameTime,
    pub thread_time: u64,
    pub tid: pid_t,
    pub ev: Event,
    pub hw_interrupts: u64,
    pub page_faults: u64,
    /// Cumulative ticks consumed by this task up to this frame.
    pub adapted_ticks: Ticks,
    pub instructions: u64,
    pub recorded_regs: Registers,
    /// True for frame pairs materialized from a drained ring record. The
    /// payload is identical to a trapped call's, but replay has to take the
    /// same path the execution took: a buffered call never trapped, so it
    /// must be injected, not resumed.
    #[serde(default)]
    pub buffered: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checksums: Vec<ChecksumRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recorded_data: Vec<MemRecord>,
}

impl TraceFrame {
    pub fn time(&self) -> FrameTime {
        self.global_time
    }

    pub fn tid(&self) -> pid_t {
        self.tid
    }

    pub fn event(&self) -> &Event {
        &self.ev
    }

    /// Human-readable representation, including a trailing newline.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(
            out,
            "{{\n  global_time:{} tid:{} thread_time:{} event:`{}'{}\n  \
             ticks:{} insns:{} hw_ints:{} faults:{}\n",
            self.global_time,
            self.tid,
            self.thread_time,
            self.ev,
            if self.buffered { " (buffered)" } else { "" },
            self.adapted_ticks,
            self.instructions,
            self.hw_interrupts,
            self.page_faults
        )?;
        self.recorded_regs.write_register_file_compact(out)?;
        write!(out, "\n}}\n")
    }

    /// Machine-parseable single-line representation; field order matches
    /// RAW_DUMP_HEADER.
    pub fn dump_raw(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(
            out,
            "{} {} {} {} {} {} {} {} {} ",
            self.global_time,
            self.thread_time,
            self.tid,
            self.ev.raw_reason(),
            self.ev.raw_phase(),
            self.hw_interrupts,
            self.page_faults,
            self.adapted_ticks,
            self.instructions
        )?;
        self.recorded_regs.write_register_file_raw(out)?;
        write!(out, "\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SyscallState;

    fn frame(time: FrameTime) -> TraceFrame {
        TraceFrame {
            global_time: time,
            thread_time: 3,
            tid: 1234,
            ev: Event::Syscall {
                no: libc::SYS_write,
                state: SyscallState::ExitingSyscall,
            },
            hw_interrupts: 0,
            page_faults: 2,
            adapted_ticks: 999,
            instructions: 12345,
            recorded_regs: Registers::default(),
            buffered: false,
            checksums: Vec::new(),
            recorded_data: Vec::new(),
        }
    }

    #[test]
    fn serde_round_trip() {
        let f = frame(17);
        let json = serde_json::to_string(&f).unwrap();
        let g: TraceFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(f.global_time, g.global_time);
        assert_eq!(f.tid, g.tid);
        assert_eq!(f.ev, g.ev);
        assert_eq!(f.adapted_ticks, g.adapted_ticks);
        assert_eq!(f.recorded_regs, g.recorded_regs);
    }

    #[test]
    fn raw_dump_starts_with_time_and_tid() {
        let f = frame(42);
        let mut out: Vec<u8> = Vec::new();
        f.dump_raw(&mut out).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert!(line.starts_with(&format!("42 3 1234 {} 0 ", libc::SYS_write)));
        assert!(line.ends_with("\n"));
    }
}
