//! The host process-control seam. Recorder, replayer and checksum engine
//! drive tracees exclusively through this trait, so the whole engine can be
//! exercised against a deterministic in-process fake as well as the real
//! ptrace backend.

use crate::error::Result;
use crate::perf_counters::CounterSnapshot;
use crate::registers::Registers;
use crate::syscallbuf::SyscallBufRecord;
use crate::ticks::Ticks;
use libc::pid_t;
use std::ffi::{OsStr, OsString};

/// Why a resumed task stopped.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StopReason {
    SyscallEntry { no: i64 },
    SyscallExit { no: i64 },
    Signal { sig: i32 },
    /// The tick interrupt fired: the task ran through its armed budget.
    SchedulerInterrupt,
    /// A single_step completed one instruction without another event.
    Stepped,
    Fork { child: pid_t },
    Exec,
    Exited { status: i32 },
}

bitflags! {
    pub struct MapProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

/// One entry of a task's mapping table.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MemoryMapping {
    pub start: usize,
    pub end: usize,
    pub prot: MapProt,
    pub shared: bool,
    pub path: Option<String>,
}

impl MemoryMapping {
    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Control over one tracee tree. After any of these calls return, the
/// task's actual host register state matches what get_registers reports.
///
/// Any host call failing with a permission or no-such-process error is
/// fatal to that task's tracing session: the implementation marks the task
/// dead and surfaces `RetraceError::TaskGone`; siblings may continue.
pub trait TaskControl {
    /// Launch the initial tracee; returns its tid.
    fn spawn(&mut self, exe: &OsStr, args: &[OsString]) -> Result<pid_t>;

    fn get_registers(&mut self, tid: pid_t) -> Result<Registers>;
    fn set_registers(&mut self, tid: pid_t, regs: &Registers) -> Result<()>;

    fn read_memory(&mut self, tid: pid_t, addr: usize, len: usize) -> Result<Vec<u8>>;
    fn write_memory(&mut self, tid: pid_t, addr: usize, bytes: &[u8]) -> Result<()>;

    /// Run the task until the next event materializes. This is the only
    /// blocking wait in the engine besides debugger interaction.
    fn resume_until_event(&mut self, tid: pid_t) -> Result<StopReason>;
    fn single_step(&mut self, tid: pid_t) -> Result<StopReason>;

    fn read_counters(&mut self, tid: pid_t) -> Result<CounterSnapshot>;

    /// Arrange a SchedulerInterrupt stop after `period` more ticks.
    fn arm_tick_interrupt(&mut self, tid: pid_t, period: Ticks) -> Result<()>;

    fn mappings(&mut self, tid: pid_t) -> Result<Vec<MemoryMapping>>;

    /// Consumer side of the syscall-buffer ring: empty it, preserving the
    /// order the tracee appended records.
    fn drain_syscallbuf(&mut self, tid: pid_t) -> Vec<SyscallBufRecord>;

    /// Replay side: preload the ring with recorded results so the tracee
    /// consumes them instead of executing the buffered calls.
    fn inject_syscallbuf(&mut self, tid: pid_t, records: &[SyscallBufRecord]) -> Result<()>;

    /// At a syscall-entry stop, arrange for the pending syscall to not
    /// execute for real; the replayer then injects the recorded results.
    fn cancel_syscall(&mut self, tid: pid_t) -> Result<()>;

    /// Drop a signal observed at the last stop instead of delivering it on
    /// the next resume. Used for --ignore-signal.
    fn discard_pending_signal(&mut self, _tid: pid_t) {}
}

/// Write every private readable mapping of `tid` to `path`, one text header
/// line per region followed by its raw bytes. Shared with the recorder
/// (`<tid>.<time>_rec`) and the replayer (`_rep`) so the two sides of a
/// --dump-on comparison have identical shape.
pub fn dump_process_memory<T: TaskControl + ?Sized>(
    tc: &mut T,
    tid: pid_t,
    path: &std::path::Path,
) -> Result<()> {
    use std::io::Write;
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    for m in tc.mappings(tid)? {
        if m.shared || !m.prot.contains(MapProt::READ) {
            continue;
        }
        let bytes = match tc.read_memory(tid, m.start, m.len()) {
            Ok(b) => b,
            // Some kernel-owned regions refuse /proc/tid/mem reads.
            Err(_) => continue,
        };
        writeln!(
            out,
            "{:x}-{:x} {} {}",
            m.start,
            m.end,
            m.len(),
            m.path.as_deref().unwrap_or("")
        )?;
        out.write_all(&bytes)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
pub mod fake {
    //! A scripted TaskControl: each task follows a fixed sequence of stops
    //! with deterministic tick deltas, register states, memory and buffered
    //! syscall records. Running the same script through record and then
    //! replay is the backbone of the session tests.

    use super::*;
    use crate::error::RetraceError;
    use crate::syscallbuf::{SyscallBuf, SYSCALLBUF_DEFAULT_CAPACITY};
    use std::collections::{HashMap, VecDeque};

    #[derive(Clone)]
    pub struct FakeStop {
        pub reason: StopReason,
        pub ticks_delta: Ticks,
        /// Register state at this stop, if it changes.
        pub regs: Option<Registers>,
        /// Records the tracee appended to the ring before this stop.
        pub buffered: Vec<SyscallBufRecord>,
    }

    impl FakeStop {
        pub fn new(reason: StopReason, ticks_delta: Ticks) -> FakeStop {
            FakeStop {
                reason,
                ticks_delta,
                regs: None,
                buffered: Vec::new(),
            }
        }

        pub fn with_regs(mut self, regs: Registers) -> FakeStop {
            self.regs = Some(regs);
            self
        }

        pub fn with_buffered(mut self, records: Vec<SyscallBufRecord>) -> FakeStop {
            self.buffered = records;
            self
        }
    }

    #[derive(Clone)]
    struct FakeRegion {
        start: usize,
        bytes: Vec<u8>,
    }

    #[derive(Clone)]
    struct FakeTask {
        script: VecDeque<FakeStop>,
        regs: Registers,
        counters: CounterSnapshot,
        regions: Vec<FakeRegion>,
        exited: bool,
    }

    pub struct FakeTaskControl {
        tasks: HashMap<pid_t, FakeTask>,
        rings: HashMap<pid_t, SyscallBuf>,
        pub injected: HashMap<pid_t, Vec<SyscallBufRecord>>,
        spawn_tid: pid_t,
    }

    impl FakeTaskControl {
        pub fn new(spawn_tid: pid_t) -> FakeTaskControl {
            let mut tc = FakeTaskControl {
                tasks: HashMap::new(),
                rings: HashMap::new(),
                injected: HashMap::new(),
                spawn_tid,
            };
            tc.add_task(spawn_tid);
            tc
        }

        pub fn add_task(&mut self, tid: pid_t) {
            self.tasks.insert(
                tid,
                FakeTask {
                    script: VecDeque::new(),
                    regs: Registers::default(),
                    counters: CounterSnapshot::default(),
                    regions: Vec::new(),
                    exited: false,
                },
            );
            self.rings
                .insert(tid, SyscallBuf::new(SYSCALLBUF_DEFAULT_CAPACITY));
        }

        pub fn push_stop(&mut self, tid: pid_t, stop: FakeStop) {
            self.tasks.get_mut(&tid).unwrap().script.push_back(stop);
        }

        pub fn set_region(&mut self, tid: pid_t, start: usize, bytes: Vec<u8>) {
            self.tasks
                .get_mut(&tid)
                .unwrap()
                .regions
                .push(FakeRegion { start, bytes });
        }

        /// Out-of-band mutation, for provoking checksum divergence.
        pub fn corrupt_region(&mut self, tid: pid_t, index: usize, offset: usize, val: u8) {
            self.tasks.get_mut(&tid).unwrap().regions[index].bytes[offset] = val;
        }

        fn task(&mut self, tid: pid_t) -> Result<&mut FakeTask> {
            self.tasks.get_mut(&tid).ok_or(RetraceError::TaskGone {
                tid,
                errno: nix::Error::Sys(nix::errno::Errno::ESRCH),
            })
        }
    }

    impl TaskControl for FakeTaskControl {
        fn spawn(&mut self, _exe: &OsStr, _args: &[OsString]) -> Result<pid_t> {
            Ok(self.spawn_tid)
        }

        fn get_registers(&mut self, tid: pid_t) -> Result<Registers> {
            Ok(self.task(tid)?.regs)
        }

        fn set_registers(&mut self, tid: pid_t, regs: &Registers) -> Result<()> {
            self.task(tid)?.regs = *regs;
            Ok(())
        }

        fn read_memory(&mut self, tid: pid_t, addr: usize, len: usize) -> Result<Vec<u8>> {
            let task = self.task(tid)?;
            for r in &task.regions {
                if addr >= r.start && addr + len <= r.start + r.bytes.len() {
                    let off = addr - r.start;
                    return Ok(r.bytes[off..off + len].to_vec());
                }
            }
            Err(RetraceError::HostInterface {
                tid,
                errno: nix::Error::Sys(nix::errno::Errno::EFAULT),
            })
        }

        fn write_memory(&mut self, tid: pid_t, addr: usize, bytes: &[u8]) -> Result<()> {
            let task = self.task(tid)?;
            for r in &mut task.regions {
                if addr >= r.start && addr + bytes.len() <= r.start + r.bytes.len() {
                    let off = addr - r.start;
                    r.bytes[off..off + bytes.len()].copy_from_slice(bytes);
                    return Ok(());
                }
            }
            Err(RetraceError::HostInterface {
                tid,
                errno: nix::Error::Sys(nix::errno::Errno::EFAULT),
            })
        }

        fn resume_until_event(&mut self, tid: pid_t) -> Result<StopReason> {
            let stop = match self.task(tid)?.script.pop_front() {
                Some(s) => s,
                None => panic!("fake task {} resumed past the end of its script", tid),
            };
            for rec in &stop.buffered {
                self.rings
                    .get_mut(&tid)
                    .unwrap()
                    .push(rec.clone())
                    .expect("script pushed into a full ring; script a trap fallback instead");
            }
            let task = self.task(tid)?;
            task.counters.ticks += stop.ticks_delta;
            task.counters.instructions += stop.ticks_delta * 10;
            if let Some(regs) = stop.regs {
                task.regs = regs;
            }
            if let StopReason::Exited { .. } = stop.reason {
                task.exited = true;
            }
            Ok(stop.reason)
        }

        fn single_step(&mut self, tid: pid_t) -> Result<StopReason> {
            let task = self.task(tid)?;
            task.counters.ticks += 1;
            task.counters.instructions += 1;
            Ok(StopReason::Stepped)
        }

        fn read_counters(&mut self, tid: pid_t) -> Result<CounterSnapshot> {
            Ok(self.task(tid)?.counters)
        }

        fn arm_tick_interrupt(&mut self, _tid: pid_t, _period: Ticks) -> Result<()> {
            Ok(())
        }

        fn mappings(&mut self, tid: pid_t) -> Result<Vec<MemoryMapping>> {
            let task = self.task(tid)?;
            Ok(task
                .regions
                .iter()
                .map(|r| MemoryMapping {
                    start: r.start,
                    end: r.start + r.bytes.len(),
                    prot: MapProt::READ | MapProt::WRITE,
                    shared: false,
                    path: None,
                })
                .collect())
        }

        fn drain_syscallbuf(&mut self, tid: pid_t) -> Vec<SyscallBufRecord> {
            self.rings
                .get_mut(&tid)
                .map(|r| r.drain())
                .unwrap_or_default()
        }

        fn inject_syscallbuf(&mut self, tid: pid_t, records: &[SyscallBufRecord]) -> Result<()> {
            self.injected
                .entry(tid)
                .or_insert_with(Vec::new)
                .extend_from_slice(records);
            Ok(())
        }

        fn cancel_syscall(&mut self, _tid: pid_t) -> Result<()> {
            Ok(())
        }
    }
}
