use crate::error::{Result, RetraceError};
use crate::trace::trace_frame::{FrameTime, TraceFrame};
use crate::trace::trace_stream::{TraceHeader, TraceStream, TRACE_VERSION};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

/// Forward-only frame source for one replay or dump session. Verifies the
/// global-time invariant as it goes: each frame's time must be exactly the
/// previous time plus one.
pub struct TraceReader {
    stream: TraceStream,
    header: TraceHeader,
    lines: Lines<BufReader<File>>,
    last_time: FrameTime,
}

impl TraceReader {
    pub fn new(dir: &Path) -> Result<TraceReader> {
        let stream = TraceStream::new(dir);
        if stream.incomplete_path().exists() {
            return Err(RetraceError::MalformedFrame {
                time: 0,
                msg: format!(
                    "`{}' holds an unfinished recording; it cannot be replayed",
                    dir.display()
                ),
            });
        }
        let version: u32 = fs::read_to_string(stream.version_path())
            .map_err(|_| RetraceError::MalformedFrame {
                time: 0,
                msg: format!("`{}' does not contain a trace", dir.display()),
            })?
            .trim()
            .parse()
            .unwrap_or(0);
        if version != TRACE_VERSION {
            return Err(RetraceError::MalformedFrame {
                time: 0,
                msg: format!(
                    "trace version {} unsupported (want {})",
                    version, TRACE_VERSION
                ),
            });
        }
        let header: TraceHeader = serde_json::from_str(&fs::read_to_string(
            stream.header_path(),
        )?)
        .map_err(|e| RetraceError::MalformedFrame {
            time: 0,
            msg: format!("undecodable trace header: {}", e),
        })?;
        let lines = BufReader::new(File::open(stream.frames_path())?).lines();
        Ok(TraceReader {
            stream,
            header,
            lines,
            last_time: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        self.stream.dir()
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    pub fn dump_path(&self, tid: libc::pid_t, time: FrameTime) -> std::path::PathBuf {
        self.stream.dump_path(tid, time, false)
    }

    /// Global time of the last frame returned.
    pub fn time(&self) -> FrameTime {
        self.last_time
    }

    /// Next frame, or None at end of stream.
    pub fn read_frame(&mut self) -> Result<Option<TraceFrame>> {
        let line = match self.lines.next() {
            None => return Ok(None),
            Some(l) => l?,
        };
        let frame: TraceFrame =
            serde_json::from_str(&line).map_err(|e| RetraceError::MalformedFrame {
                time: self.last_time + 1,
                msg: format!("undecodable frame: {}", e),
            })?;
        if frame.global_time != self.last_time + 1 {
            return Err(RetraceError::MalformedFrame {
                time: frame.global_time,
                msg: format!(
                    "global_time out of order: got {}, expected {}",
                    frame.global_time,
                    self.last_time + 1
                ),
            });
        }
        self.last_time = frame.global_time;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::registers::Registers;
    use crate::trace::trace_writer::{CloseStatus, TraceWriter};
    use std::path::PathBuf;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("retrace-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn test_header() -> TraceHeader {
        TraceHeader {
            exe: "/bin/true".to_owned(),
            args: Vec::new(),
            max_ticks: 500_000,
            max_events: 1_000,
            use_syscall_buffer: false,
        }
    }

    fn test_frame(tid: libc::pid_t) -> TraceFrame {
        TraceFrame {
            global_time: 0,
            thread_time: 1,
            tid,
            ev: Event::Sched,
            hw_interrupts: 0,
            page_faults: 0,
            adapted_ticks: 10,
            instructions: 100,
            recorded_regs: Registers::default(),
            buffered: false,
            checksums: Vec::new(),
            recorded_data: Vec::new(),
        }
    }

    #[test]
    fn times_are_strictly_increasing_with_no_gaps() {
        let dir = tmp_dir("monotonic");
        let mut w = TraceWriter::new(&dir, &test_header()).unwrap();
        for _ in 0..5 {
            w.write_frame(test_frame(10)).unwrap();
        }
        w.close(CloseStatus::CloseOk).unwrap();

        let mut r = TraceReader::new(&dir).unwrap();
        let mut expected = 1;
        while let Some(frame) = r.read_frame().unwrap() {
            assert_eq!(expected, frame.global_time);
            expected += 1;
        }
        assert_eq!(6, expected);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unfinished_recording_is_rejected() {
        let dir = tmp_dir("unfinished");
        {
            let mut w = TraceWriter::new(&dir, &test_header()).unwrap();
            w.write_frame(test_frame(10)).unwrap();
            // Dropped without close: incomplete marker stays.
            w.close(CloseStatus::CloseError).unwrap();
        }
        assert!(TraceReader::new(&dir).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn corrupt_frame_reports_time_at_fault() {
        let dir = tmp_dir("corrupt");
        let mut w = TraceWriter::new(&dir, &test_header()).unwrap();
        w.write_frame(test_frame(10)).unwrap();
        w.close(CloseStatus::CloseOk).unwrap();
        // Append garbage behind the writer's back.
        use std::io::Write;
        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(dir.join("frames"))
            .unwrap();
        writeln!(f, "not json").unwrap();
        drop(f);

        let mut r = TraceReader::new(&dir).unwrap();
        assert!(r.read_frame().unwrap().is_some());
        match r.read_frame() {
            Err(RetraceError::MalformedFrame { time, .. }) => assert_eq!(2, time),
            other => panic!("expected malformed frame, got {:?}", other.map(|_| ())),
        }
        fs::remove_dir_all(&dir).unwrap();
    }
}
