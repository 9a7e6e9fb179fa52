use crate::error::{Result, RetraceError};
use crate::trace::trace_frame::{FrameTime, TraceFrame};
use crate::trace::trace_stream::{TraceHeader, TraceStream, TRACE_VERSION};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CloseStatus {
    CloseOk,
    CloseError,
}

/// Append-only frame sink for one recording session. Assigns global times:
/// each frame gets the previous time plus one, so the stream is strictly
/// increasing with no gaps.
pub struct TraceWriter {
    stream: TraceStream,
    out: BufWriter<File>,
    closed: bool,
}

impl TraceWriter {
    /// Creates `dir` (which must not already contain a trace) and marks it
    /// incomplete until close.
    pub fn new(dir: &Path, header: &TraceHeader) -> Result<TraceWriter> {
        fs::create_dir_all(dir)?;
        let stream = TraceStream::new(dir);
        if stream.version_path().exists() || stream.frames_path().exists() {
            return Err(RetraceError::Usage(format!(
                "`{}' already contains a trace",
                dir.display()
            )));
        }
        fs::write(stream.incomplete_path(), format!("{}\n", TRACE_VERSION))?;
        let json = serde_json::to_string(header).map_err(|e| {
            RetraceError::TraceIo(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        fs::write(stream.header_path(), json)?;
        let out = BufWriter::new(File::create(stream.frames_path())?);
        Ok(TraceWriter {
            stream,
            out,
            closed: false,
        })
    }

    pub fn dir(&self) -> &Path {
        self.stream.dir()
    }

    pub fn time(&self) -> FrameTime {
        self.stream.time()
    }

    /// The global time the next frame will be assigned.
    pub fn next_time(&self) -> FrameTime {
        self.stream.time() + 1
    }

    pub fn dump_path(&self, tid: libc::pid_t, time: FrameTime) -> std::path::PathBuf {
        self.stream.dump_path(tid, time, true)
    }

    /// Stamps `frame` with the next global time and appends it.
    pub fn write_frame(&mut self, mut frame: TraceFrame) -> Result<FrameTime> {
        debug_assert!(!self.closed);
        let time = self.stream.tick_time();
        frame.global_time = time;
        let json = serde_json::to_string(&frame).map_err(|e| {
            RetraceError::TraceIo(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        self.out.write_all(json.as_bytes())?;
        self.out.write_all(b"\n")?;
        Ok(time)
    }

    /// Finalize the stream. Only a CloseOk close makes the trace replayable.
    pub fn close(&mut self, status: CloseStatus) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.out.flush()?;
        if let CloseStatus::CloseOk = status {
            fs::rename(self.stream.incomplete_path(), self.stream.version_path())?;
        }
        self.closed = true;
        Ok(())
    }
}
