use crate::trace::trace_frame::FrameTime;
use libc::pid_t;
use thiserror::Error;

/// Session-level error taxonomy. Divergence, host-interface failure and
/// malformed trace data are fatal to the session; callers report the
/// `global_time`/tid carried here and never retry.
#[derive(Debug, Error)]
pub enum RetraceError {
    #[error("replay diverged from the recording at time {time} (tid {tid}): {msg}")]
    Divergence {
        time: FrameTime,
        tid: pid_t,
        msg: String,
    },

    #[error("malformed trace frame at time {time}: {msg}")]
    MalformedFrame { time: FrameTime, msg: String },

    #[error("task {tid} unexpectedly gone from the host: {errno}")]
    TaskGone { tid: pid_t, errno: nix::Error },

    #[error("host process-control failure on tid {tid}: {errno}")]
    HostInterface { tid: pid_t, errno: nix::Error },

    #[error("syscall-buffer ring overflow with no fallback path (tid {tid})")]
    RingOverflow { tid: pid_t },

    #[error("trace i/o error: {0}")]
    TraceIo(#[from] std::io::Error),

    #[error("os error: {0}")]
    Os(#[from] nix::Error),

    #[error("{0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, RetraceError>;
