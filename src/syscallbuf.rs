//! The syscall-buffering protocol. For syscalls in the safe set, the tracee
//! executes the call directly and appends a compact record to a ring shared
//! with the tracer instead of trapping. The tracer drains the ring at its
//! next natural stop and emits an ordinary entry/exit frame pair for each
//! record, carrying the same payload a trapped execution would have; the
//! pair is marked with its ring provenance so replay follows the path the
//! execution took.
//!
//! The ring is the only structure written by both sides: single producer
//! (tracee), single consumer (tracer), strict drain-before-reuse. It is
//! modeled here as an explicit bounded queue with a drain/acknowledge
//! protocol rather than as a pointer into foreign memory.

use serde::{Deserialize, Serialize};

/// Set this env var to enable syscall buffering in the tracee; absence
/// disables buffering entirely and every syscall traps.
pub const SYSCALLBUF_ENABLED_ENV_VAR: &str = "_RETRACE_USE_SYSCALLBUF";

/// Bump this whenever the record layout or the safe-syscall set changes in a
/// way that affects replay.
pub const SYSCALLBUF_PROTOCOL_VERSION: u16 = 0;

/// Default ring capacity, in records.
pub const SYSCALLBUF_DEFAULT_CAPACITY: usize = 64;

/// One buffered syscall: number, arguments, return value, plus any bytes
/// the call wrote to tracee memory (a timespec, say). At replay the tracee
/// stub consumes the record, writes `out` back to `out_addr` and returns
/// `ret`, so buffered calls with memory outputs replay without trapping.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct SyscallBufRecord {
    pub no: i64,
    pub args: [u64; 6],
    pub ret: i64,
    pub out_addr: u64,
    pub out: Vec<u8>,
}

/// Syscalls safe to buffer: no side effects visible to the tracer that
/// affect determinism before the ring is flushed. Result injection at replay
/// happens through the ring itself.
pub fn may_be_buffered(no: i64) -> bool {
    matches!(
        no,
        libc::SYS_clock_gettime
            | libc::SYS_clock_getres
            | libc::SYS_gettimeofday
            | libc::SYS_time
            | libc::SYS_getpid
            | libc::SYS_gettid
            | libc::SYS_getuid
            | libc::SYS_getgid
            | libc::SYS_geteuid
            | libc::SYS_getppid
    )
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct BufferFull;

/// The bounded SPSC ring. `push` is the producer side, `drain` the consumer
/// side. A full drain must complete before the producer may wrap: push
/// fails once `capacity` records have accumulated since the last drain, and
/// the caller falls back to a trapped syscall (recoverable, not an error).
pub struct SyscallBuf {
    capacity: usize,
    records: Vec<SyscallBufRecord>,
}

impl SyscallBuf {
    pub fn new(capacity: usize) -> SyscallBuf {
        SyscallBuf {
            capacity,
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Producer side (tracee).
    pub fn push(&mut self, record: SyscallBufRecord) -> Result<(), BufferFull> {
        if self.records.len() >= self.capacity {
            return Err(BufferFull);
        }
        self.records.push(record);
        Ok(())
    }

    /// Consumer side (tracer). Empties the ring and acknowledges it for
    /// reuse; record order is the order the tracee executed the calls.
    pub fn drain(&mut self) -> Vec<SyscallBufRecord> {
        std::mem::replace(&mut self.records, Vec::with_capacity(self.capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(no: i64, ret: i64) -> SyscallBufRecord {
        SyscallBufRecord {
            no,
            args: [0; 6],
            ret,
            out_addr: 0,
            out: Vec::new(),
        }
    }

    #[test]
    fn drain_preserves_push_order() {
        let mut buf = SyscallBuf::new(8);
        for i in 0..5 {
            buf.push(record(libc::SYS_gettid, i)).unwrap();
        }
        let drained = buf.drain();
        assert_eq!(5, drained.len());
        for (i, r) in drained.iter().enumerate() {
            assert_eq!(i as i64, r.ret);
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn push_fails_when_full_until_drained() {
        let mut buf = SyscallBuf::new(2);
        buf.push(record(libc::SYS_getpid, 1)).unwrap();
        buf.push(record(libc::SYS_getpid, 2)).unwrap();
        assert_eq!(Err(BufferFull), buf.push(record(libc::SYS_getpid, 3)));
        // Still full; no partial reuse before a drain.
        assert_eq!(Err(BufferFull), buf.push(record(libc::SYS_getpid, 4)));
        buf.drain();
        buf.push(record(libc::SYS_getpid, 5)).unwrap();
    }

    #[test]
    fn safe_set_classification() {
        assert!(may_be_buffered(libc::SYS_clock_gettime));
        assert!(may_be_buffered(libc::SYS_gettid));
        assert!(!may_be_buffered(libc::SYS_read));
        assert!(!may_be_buffered(libc::SYS_execve));
        assert!(!may_be_buffered(libc::SYS_mmap));
    }
}
