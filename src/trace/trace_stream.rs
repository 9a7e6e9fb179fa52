use crate::ticks::Ticks;
use crate::trace::trace_frame::FrameTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Frame stream format version. Readers refuse traces from other versions.
pub const TRACE_VERSION: u32 = 1;

pub const FRAMES_FILENAME: &str = "frames";
pub const HEADER_FILENAME: &str = "header";
pub const VERSION_FILENAME: &str = "version";
/// Present while a recording is in flight; renamed to the version file on
/// clean close. A trace directory still carrying this marker is truncated.
pub const INCOMPLETE_FILENAME: &str = "incomplete";

/// Session-level metadata written once per trace. Replay rebuilds its
/// scheduler from the same policy parameters the recorder ran with, so a
/// trace is replayable without re-supplying them on the command line.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TraceHeader {
    pub exe: String,
    pub args: Vec<String>,
    pub max_ticks: Ticks,
    pub max_events: u64,
    pub use_syscall_buffer: bool,
}

/// State common to writing and reading one trace: the backing directory and
/// the global time cursor. The stream exclusively owns its storage for the
/// duration of one session.
pub struct TraceStream {
    dir: PathBuf,
    global_time: FrameTime,
}

impl TraceStream {
    pub fn new(dir: &Path) -> TraceStream {
        TraceStream {
            dir: dir.to_path_buf(),
            global_time: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn time(&self) -> FrameTime {
        self.global_time
    }

    pub fn tick_time(&mut self) -> FrameTime {
        self.global_time += 1;
        self.global_time
    }

    pub fn frames_path(&self) -> PathBuf {
        self.dir.join(FRAMES_FILENAME)
    }

    pub fn header_path(&self) -> PathBuf {
        self.dir.join(HEADER_FILENAME)
    }

    pub fn version_path(&self) -> PathBuf {
        self.dir.join(VERSION_FILENAME)
    }

    pub fn incomplete_path(&self) -> PathBuf {
        self.dir.join(INCOMPLETE_FILENAME)
    }

    /// Name of a memory-dump side file: `<tid>.<time>_rec` for dumps taken
    /// during recording, `_rep` during replay.
    pub fn dump_path(&self, tid: libc::pid_t, time: FrameTime, recording: bool) -> PathBuf {
        self.dir.join(format!(
            "{}.{}_{}",
            tid,
            time,
            if recording { "rec" } else { "rep" }
        ))
    }
}
