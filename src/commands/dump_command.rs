use super::exit_result::ExitResult;
use crate::{
    commands::{
        retrace_options::{RetraceOptions, RetraceSubCommand},
        RetraceCommand,
    },
    error::Result,
    trace::trace_frame::{FrameTime, RAW_DUMP_HEADER},
    trace::trace_reader::TraceReader,
    util::resolve_trace_dir,
};
use std::io::{stdout, Write};
use std::path::PathBuf;

pub struct DumpCommand {
    raw_dump: bool,
    trace_dir: Option<PathBuf>,
    event_spec: Option<(FrameTime, Option<FrameTime>)>,
}

/// Whether `time` is selected by an event spec: everything when absent, a
/// single event for `N`, an inclusive range for `N-M`.
fn event_selected(spec: Option<(FrameTime, Option<FrameTime>)>, time: FrameTime) -> bool {
    match spec {
        None => true,
        Some((single, None)) => time == single,
        Some((low, Some(high))) => low <= time && time <= high,
    }
}

impl DumpCommand {
    pub fn new(options: &RetraceOptions) -> DumpCommand {
        match options.cmd.clone() {
            RetraceSubCommand::Dump {
                raw_dump,
                trace_dir,
                event_spec,
            } => DumpCommand {
                raw_dump,
                trace_dir,
                event_spec,
            },
            _ => panic!("Unexpected RetraceSubCommand variant. Not a `Dump` variant!"),
        }
    }

    /// The trace is a forward-only stream, so selection is a serial scan:
    /// frames before the spec are skipped, frames after it stop the scan.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        let trace_dir = resolve_trace_dir(self.trace_dir.clone())?;
        let mut reader = TraceReader::new(&trace_dir)?;
        if self.raw_dump {
            writeln!(out, "# {}", RAW_DUMP_HEADER)?;
        }
        let past_spec = |time| match self.event_spec {
            None => false,
            Some((single, None)) => time > single,
            Some((_, Some(high))) => time > high,
        };
        while let Some(frame) = reader.read_frame()? {
            if past_spec(frame.global_time) {
                break;
            }
            if !event_selected(self.event_spec, frame.global_time) {
                continue;
            }
            if self.raw_dump {
                frame.dump_raw(out)?;
            } else {
                frame.dump(out)?;
            }
        }
        Ok(())
    }
}

impl RetraceCommand for DumpCommand {
    fn run(&mut self) -> ExitResult<()> {
        let out = stdout();
        match self.dump(&mut out.lock()) {
            Ok(()) => ExitResult::Ok(()),
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::registers::Registers;
    use crate::trace::trace_frame::TraceFrame;
    use crate::trace::trace_stream::TraceHeader;
    use crate::trace::trace_writer::{CloseStatus, TraceWriter};

    #[test]
    fn spec_selection() {
        assert!(event_selected(None, 1));
        assert!(event_selected(Some((127, None)), 127));
        assert!(!event_selected(Some((127, None)), 128));
        assert!(event_selected(Some((1000, Some(5000))), 1000));
        assert!(event_selected(Some((1000, Some(5000))), 5000));
        assert!(!event_selected(Some((1000, Some(5000))), 999));
        assert!(!event_selected(Some((1000, Some(5000))), 5001));
    }

    #[test]
    fn dump_honors_spec_and_raw_format() {
        let dir = std::env::temp_dir().join(format!("retrace-dump-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let header = TraceHeader {
            exe: "/bin/true".to_owned(),
            args: Vec::new(),
            max_ticks: 500_000,
            max_events: 1_000,
            use_syscall_buffer: false,
        };
        let mut w = TraceWriter::new(&dir, &header).unwrap();
        for _ in 0..5 {
            w.write_frame(TraceFrame {
                global_time: 0,
                thread_time: 1,
                tid: 42,
                ev: Event::Sched,
                hw_interrupts: 0,
                page_faults: 0,
                adapted_ticks: 1,
                instructions: 1,
                recorded_regs: Registers::default(),
                buffered: false,
                checksums: Vec::new(),
                recorded_data: Vec::new(),
            })
            .unwrap();
        }
        w.close(CloseStatus::CloseOk).unwrap();

        let cmd = DumpCommand {
            raw_dump: true,
            trace_dir: Some(dir.clone()),
            event_spec: Some((2, Some(4))),
        };
        let mut out: Vec<u8> = Vec::new();
        cmd.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("# global_time"));
        // Frames 2, 3 and 4 only.
        let frame_lines: Vec<&str> = lines.collect();
        assert_eq!(3, frame_lines.len());
        assert!(frame_lines[0].starts_with("2 "));
        assert!(frame_lines[2].starts_with("4 "));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
