//! Divergence detection. During recording, per-mapping digests are stored
//! alongside frames at the configured checkpoints; during replay, freshly
//! computed digests are compared against them. A mismatch means replay
//! failed to reproduce recorded state and is fatal -- never retried.

use crate::error::{Result, RetraceError};
use crate::event::Event;
use crate::flags::Checksum;
use crate::task_control::{MapProt, TaskControl};
use crate::trace::trace_frame::FrameTime;
use crc32fast::Hasher;
use libc::pid_t;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub start: u64,
    pub end: u64,
    pub digest: u32,
}

/// Whether this frame is a checksum checkpoint under `config`.
pub fn checksums_due(config: Option<Checksum>, ev: &Event, time: FrameTime) -> bool {
    match config {
        None => false,
        Some(Checksum::ChecksumSyscall) => ev.is_syscall_exit(),
        Some(Checksum::ChecksumAll) => true,
        Some(Checksum::ChecksumAt(from)) => time >= from,
    }
}

/// Mappings whose content participates in checksums. Shared and device
/// mappings carry host metadata we cannot reproduce; anything else
/// unexpectedly different still counts as divergence.
fn checksummed(m: &crate::task_control::MemoryMapping) -> bool {
    m.prot.contains(MapProt::READ | MapProt::WRITE) && !m.shared
}

const CHUNK: usize = 0x10000;

pub fn compute_for_task<T: TaskControl + ?Sized>(
    tc: &mut T,
    tid: pid_t,
) -> Result<Vec<ChecksumRecord>> {
    let mut out = Vec::new();
    for m in tc.mappings(tid)? {
        if !checksummed(&m) {
            continue;
        }
        let mut hasher = Hasher::new();
        let mut addr = m.start;
        while addr < m.end {
            let len = CHUNK.min(m.end - addr);
            let bytes = tc.read_memory(tid, addr, len)?;
            hasher.update(&bytes);
            addr += len;
        }
        out.push(ChecksumRecord {
            start: m.start as u64,
            end: m.end as u64,
            digest: hasher.finalize(),
        });
    }
    Ok(out)
}

/// Compare recorded checkpoint digests against freshly computed ones.
pub fn compare(
    time: FrameTime,
    tid: pid_t,
    recorded: &[ChecksumRecord],
    live: &[ChecksumRecord],
) -> Result<()> {
    if recorded.len() != live.len() {
        return Err(RetraceError::Divergence {
            time,
            tid,
            msg: format!(
                "checksummed mapping count changed: recorded {}, now {}",
                recorded.len(),
                live.len()
            ),
        });
    }
    for (rec, cur) in recorded.iter().zip(live.iter()) {
        if rec != cur {
            return Err(RetraceError::Divergence {
                time,
                tid,
                msg: format!(
                    "checksum mismatch for {:#x}-{:#x}: recorded {:#010x}, got {:#010x} \
                     ({:#x}-{:#x})",
                    rec.start, rec.end, rec.digest, cur.digest, cur.start, cur.end
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SyscallState;
    use crate::task_control::fake::FakeTaskControl;

    #[test]
    fn compute_is_idempotent_on_unchanged_memory() {
        let mut tc = FakeTaskControl::new(42);
        tc.set_region(42, 0x1000, (0..255u8).collect());
        let a = compute_for_task(&mut tc, 42).unwrap();
        let b = compute_for_task(&mut tc, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(1, a.len());
    }

    #[test]
    fn mutation_changes_digest_and_compare_reports_divergence() {
        let mut tc = FakeTaskControl::new(42);
        tc.set_region(42, 0x1000, vec![0u8; 4096]);
        let before = compute_for_task(&mut tc, 42).unwrap();
        tc.corrupt_region(42, 0, 100, 0xff);
        let after = compute_for_task(&mut tc, 42).unwrap();
        assert_ne!(before, after);

        let err = compare(7, 42, &before, &after).unwrap_err();
        match err {
            RetraceError::Divergence { time, tid, .. } => {
                assert_eq!(7, time);
                assert_eq!(42, tid);
            }
            other => panic!("expected divergence, got {:?}", other),
        }
    }

    #[test]
    fn due_policy() {
        let entry = Event::Syscall {
            no: libc::SYS_read,
            state: SyscallState::EnteringSyscall,
        };
        let exit = Event::Syscall {
            no: libc::SYS_read,
            state: SyscallState::ExitingSyscall,
        };
        assert!(!checksums_due(None, &exit, 1));
        assert!(checksums_due(Some(Checksum::ChecksumSyscall), &exit, 1));
        assert!(!checksums_due(Some(Checksum::ChecksumSyscall), &entry, 1));
        assert!(checksums_due(Some(Checksum::ChecksumAll), &entry, 1));
        assert!(!checksums_due(Some(Checksum::ChecksumAt(10)), &exit, 9));
        assert!(checksums_due(Some(Checksum::ChecksumAt(10)), &exit, 10));
    }
}
