//! The recording session. Drives tracees through the TaskControl seam one
//! scheduler decision at a time and appends one trace frame per observed
//! event. Everything a replayer needs to reproduce the execution -- the
//! schedule, register snapshots, counter values, nondeterministic syscall
//! outputs -- lands in the frame stream; nothing is kept on the side.

use crate::checksum;
use crate::error::Result;
use crate::event::{Event, SyscallState};
use crate::flags::Flags;
use crate::kernel_metadata::signal_name;
use crate::perf_counters::CounterSnapshot;
use crate::registers::Registers;
use crate::scheduler::Scheduler;
use crate::syscallbuf::SyscallBufRecord;
use crate::task::Task;
use crate::task_control::{dump_process_memory, StopReason, TaskControl};
use crate::trace::trace_frame::{FrameTime, MemRecord, TraceFrame};
use crate::trace::trace_stream::TraceHeader;
use crate::trace::trace_writer::{CloseStatus, TraceWriter};
use libc::pid_t;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::Path;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RecordResult {
    /// Some tracee is still live; step again.
    StepContinue,
    /// Every tracee has exited and its exit frame is in the trace.
    StepExited,
}

pub struct RecordSession<T: TaskControl> {
    tc: T,
    flags: Flags,
    scheduler: Scheduler,
    tasks: HashMap<pid_t, Task>,
    trace: TraceWriter,
}

impl<T: TaskControl> RecordSession<T> {
    pub fn create(
        mut tc: T,
        flags: &Flags,
        trace_dir: &Path,
        exe: &OsStr,
        args: &[OsString],
    ) -> Result<RecordSession<T>> {
        let header = TraceHeader {
            exe: exe.to_string_lossy().into_owned(),
            args: args
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
            max_ticks: flags.max_ticks,
            max_events: flags.max_events,
            use_syscall_buffer: flags.use_syscall_buffer,
        };
        let trace = TraceWriter::new(trace_dir, &header)?;
        let tid = tc.spawn(exe, args)?;
        log!(
            crate::log::LogInfo,
            "recording {:?} as tid {} into `{}'",
            exe,
            tid,
            trace_dir.display()
        );
        let mut scheduler = Scheduler::new(flags.max_ticks, flags.max_events);
        scheduler.on_task_created(tid);
        let mut tasks = HashMap::new();
        tasks.insert(tid, Task::new(tid, tid));
        Ok(RecordSession {
            tc,
            flags: flags.clone(),
            scheduler,
            tasks,
            trace,
        })
    }

    pub fn trace_dir(&self) -> &Path {
        self.trace.dir()
    }

    pub fn time(&self) -> FrameTime {
        self.trace.time()
    }

    /// Run the next scheduled task up to its next event and record it.
    pub fn record_step(&mut self) -> Result<RecordResult> {
        let tid = match self.scheduler.next_task() {
            None => return Ok(RecordResult::StepExited),
            Some(t) => t,
        };
        self.tc.arm_tick_interrupt(tid, self.scheduler.remaining_ticks())?;
        let stop = self.tc.resume_until_event(tid)?;

        // Buffered calls executed before this stop materialized; their
        // frames precede the stop's frame so stream order is execution
        // order.
        for rec in self.tc.drain_syscallbuf(tid) {
            self.emit_buffered(tid, &rec)?;
        }

        if let StopReason::Exited { status } = stop {
            log!(
                crate::log::LogDebug,
                "tid {} exited with status {}",
                tid,
                status
            );
            let (regs, counters) = {
                let task = &self.tasks[&tid];
                (task.regs, task.counters)
            };
            self.emit_frame(tid, Event::Exit, regs, counters, Vec::new(), false)?;
            self.tasks.get_mut(&tid).unwrap().exited = true;
            self.scheduler.on_task_exited(tid);
            return Ok(RecordResult::StepContinue);
        }

        let counters = self.tc.read_counters(tid)?;
        let regs = self.tc.get_registers(tid)?;
        let ticks_delta = {
            let task = self.tasks.get_mut(&tid).unwrap();
            let delta = counters.ticks - task.counters.ticks;
            task.regs = regs;
            task.counters = counters;
            delta
        };

        let ev = match stop {
            StopReason::SyscallEntry { no } => Event::Syscall {
                no,
                state: SyscallState::EnteringSyscall,
            },
            StopReason::SyscallExit { no } => Event::Syscall {
                no,
                state: SyscallState::ExitingSyscall,
            },
            StopReason::Signal { sig } if Some(sig) == self.flags.ignore_sig => {
                // Dropped entirely: no frame, so replay never sees it.
                log!(
                    crate::log::LogDebug,
                    "dropping ignored {} for tid {}",
                    signal_name(sig),
                    tid
                );
                self.tc.discard_pending_signal(tid);
                if self.scheduler.note_event(ticks_delta) {
                    self.emit_sched_frame(tid, regs, counters)?;
                }
                return Ok(RecordResult::StepContinue);
            }
            StopReason::Signal { sig } => Event::Signal { sig },
            StopReason::SchedulerInterrupt => Event::Sched,
            StopReason::Fork { child } => {
                self.tasks.insert(child, Task::new(child, child));
                self.scheduler.on_task_created(child);
                Event::Fork { child }
            }
            StopReason::Exec => Event::Exec,
            StopReason::Stepped => return Ok(RecordResult::StepContinue),
            StopReason::Exited { .. } => unreachable!("handled above"),
        };

        let recorded_data = match ev {
            Event::Syscall {
                no,
                state: SyscallState::ExitingSyscall,
            } => self.capture_syscall_outputs(tid, no, &regs)?,
            _ => Vec::new(),
        };

        let expired = self.scheduler.note_event(ticks_delta);
        self.emit_frame(tid, ev, regs, counters, recorded_data, false)?;
        if let Event::Sched = ev {
            self.scheduler.expire_slice();
        } else if expired {
            // The event budget tripped between tick interrupts; a synthetic
            // SCHED frame makes the rotation point explicit in the trace.
            self.emit_sched_frame(tid, regs, counters)?;
        }
        Ok(RecordResult::StepContinue)
    }

    /// Record until every task has exited, then finalize the trace.
    pub fn record_until_exit(&mut self) -> Result<()> {
        while let RecordResult::StepContinue = self.record_step()? {}
        self.trace.close(CloseStatus::CloseOk)
    }

    pub fn close(&mut self, status: CloseStatus) -> Result<()> {
        self.trace.close(status)
    }

    fn emit_sched_frame(
        &mut self,
        tid: pid_t,
        regs: Registers,
        counters: CounterSnapshot,
    ) -> Result<()> {
        self.emit_frame(tid, Event::Sched, regs, counters, Vec::new(), false)?;
        self.scheduler.expire_slice();
        Ok(())
    }

    /// Materialize one drained ring record as an entry/exit frame pair. The
    /// payload matches what a trapped execution of the same call would have
    /// recorded; the frames are marked buffered so replay injects the pair
    /// through the ring instead of resuming for it.
    fn emit_buffered(&mut self, tid: pid_t, rec: &SyscallBufRecord) -> Result<()> {
        let (base, counters) = {
            let task = &self.tasks[&tid];
            (task.regs, task.counters)
        };
        let mut entry_regs = base;
        entry_regs.orig_rax = rec.no as u64;
        entry_regs.set_syscall_args(rec.args);
        // Kernel convention at syscall entry.
        entry_regs.set_syscall_result(-(libc::ENOSYS as i64));
        let mut exit_regs = entry_regs;
        exit_regs.set_syscall_result(rec.ret);
        let recorded_data = if rec.out.is_empty() {
            Vec::new()
        } else {
            vec![MemRecord {
                addr: rec.out_addr,
                data: rec.out.clone(),
            }]
        };
        self.emit_frame(
            tid,
            Event::Syscall {
                no: rec.no,
                state: SyscallState::EnteringSyscall,
            },
            entry_regs,
            counters,
            Vec::new(),
            true,
        )?;
        self.emit_frame(
            tid,
            Event::Syscall {
                no: rec.no,
                state: SyscallState::ExitingSyscall,
            },
            exit_regs,
            counters,
            recorded_data,
            true,
        )?;
        Ok(())
    }

    /// Nondeterministic syscall outputs that must be restored verbatim at
    /// replay instead of re-executing the call.
    fn capture_syscall_outputs(
        &mut self,
        tid: pid_t,
        no: i64,
        regs: &Registers,
    ) -> Result<Vec<MemRecord>> {
        let ret = regs.syscall_result();
        let args = regs.syscall_args();
        let mut ranges: Vec<(u64, usize)> = Vec::new();
        match no {
            libc::SYS_read if ret > 0 => ranges.push((args[1], ret as usize)),
            libc::SYS_getrandom if ret > 0 => ranges.push((args[0], ret as usize)),
            // timespec and timeval are two 64-bit words on x86-64.
            libc::SYS_clock_gettime if ret == 0 => ranges.push((args[1], 16)),
            libc::SYS_gettimeofday if ret == 0 => ranges.push((args[0], 16)),
            libc::SYS_time if ret >= 0 => ranges.push((args[0], 8)),
            _ => {}
        }
        let mut out = Vec::new();
        for (addr, len) in ranges {
            if addr == 0 || len == 0 {
                continue;
            }
            let data = self.tc.read_memory(tid, addr as usize, len)?;
            out.push(MemRecord { addr, data });
        }
        Ok(out)
    }

    fn emit_frame(
        &mut self,
        tid: pid_t,
        ev: Event,
        regs: Registers,
        counters: CounterSnapshot,
        recorded_data: Vec<MemRecord>,
        buffered: bool,
    ) -> Result<FrameTime> {
        let thread_time = {
            let task = self.tasks.get_mut(&tid).unwrap();
            task.thread_time += 1;
            task.thread_time
        };
        // Exit frames describe a task that no longer has inspectable
        // memory; buffered frames are never checkpoints.
        let checksums = if !buffered
            && !matches!(ev, Event::Exit)
            && checksum::checksums_due(self.flags.checksum, &ev, self.trace.next_time())
        {
            checksum::compute_for_task(&mut self.tc, tid)?
        } else {
            Vec::new()
        };
        let time = self.trace.write_frame(TraceFrame {
            global_time: 0,
            thread_time,
            tid,
            ev,
            hw_interrupts: counters.hw_interrupts,
            page_faults: counters.page_faults,
            adapted_ticks: counters.ticks,
            instructions: counters.instructions,
            recorded_regs: regs,
            buffered,
            checksums,
            recorded_data,
        })?;
        self.maybe_dump_memory(tid, &ev, time)?;
        Ok(time)
    }

    fn maybe_dump_memory(&mut self, tid: pid_t, ev: &Event, time: FrameTime) -> Result<()> {
        if !self.flags.wants_memory_dump(ev, time) || matches!(ev, Event::Exit) {
            return Ok(());
        }
        let path = self.trace.dump_path(tid, time);
        log!(
            crate::log::LogInfo,
            "dumping tid {} memory at time {} to {:?}",
            tid,
            time,
            path
        );
        dump_process_memory(&mut self.tc, tid, &path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_control::fake::{FakeStop, FakeTaskControl};
    use crate::trace::trace_reader::TraceReader;
    use std::path::PathBuf;

    const TID: pid_t = 1000;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("retrace-rec-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn record_all(tc: FakeTaskControl, flags: &Flags, dir: &Path) -> Vec<TraceFrame> {
        let mut session = RecordSession::create(
            tc,
            flags,
            dir,
            OsStr::new("/bin/true"),
            &[],
        )
        .unwrap();
        session.record_until_exit().unwrap();
        let mut reader = TraceReader::new(dir).unwrap();
        let mut frames = Vec::new();
        while let Some(f) = reader.read_frame().unwrap() {
            frames.push(f);
        }
        frames
    }

    fn syscall_entry(no: i64, ticks: u64) -> FakeStop {
        FakeStop::new(StopReason::SyscallEntry { no }, ticks)
    }

    fn syscall_exit(no: i64, ticks: u64) -> FakeStop {
        FakeStop::new(StopReason::SyscallExit { no }, ticks)
    }

    fn exited() -> FakeStop {
        FakeStop::new(StopReason::Exited { status: 0 }, 0)
    }

    #[test]
    fn frames_mirror_the_stop_sequence() {
        let mut tc = FakeTaskControl::new(TID);
        tc.push_stop(TID, syscall_entry(libc::SYS_write, 5));
        tc.push_stop(TID, syscall_exit(libc::SYS_write, 2));
        tc.push_stop(TID, FakeStop::new(StopReason::Signal { sig: libc::SIGUSR1 }, 3));
        tc.push_stop(TID, exited());

        let dir = tmp_dir("mirror");
        let frames = record_all(tc, &Flags::default(), &dir);
        assert_eq!(4, frames.len());
        assert!(matches!(
            frames[0].ev,
            Event::Syscall {
                no: libc::SYS_write,
                state: SyscallState::EnteringSyscall
            }
        ));
        assert!(frames[1].ev.is_syscall_exit());
        assert!(matches!(frames[2].ev, Event::Signal { sig } if sig == libc::SIGUSR1));
        assert!(matches!(frames[3].ev, Event::Exit));
        // thread_time counts per-task frames; global_time counts all.
        assert_eq!(
            vec![1, 2, 3, 4],
            frames.iter().map(|f| f.thread_time).collect::<Vec<_>>()
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn event_budget_inserts_synthetic_sched_frame() {
        let mut tc = FakeTaskControl::new(TID);
        for _ in 0..3 {
            tc.push_stop(TID, syscall_entry(libc::SYS_getcwd, 1));
            tc.push_stop(TID, syscall_exit(libc::SYS_getcwd, 1));
        }
        tc.push_stop(TID, exited());

        let mut flags = Flags::default();
        flags.max_events = 4;
        let dir = tmp_dir("budget");
        let frames = record_all(tc, &flags, &dir);
        // A SCHED frame right after the fourth event, then the rest.
        assert!(matches!(frames[4].ev, Event::Sched));
        assert_eq!(
            1,
            frames
                .iter()
                .filter(|f| matches!(f.ev, Event::Sched))
                .count()
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn ignored_signal_leaves_no_frame() {
        let mut tc = FakeTaskControl::new(TID);
        tc.push_stop(TID, FakeStop::new(StopReason::Signal { sig: libc::SIGPWR }, 1));
        tc.push_stop(TID, syscall_entry(libc::SYS_exit_group, 1));
        tc.push_stop(TID, exited());

        let mut flags = Flags::default();
        flags.ignore_sig = Some(libc::SIGPWR);
        let dir = tmp_dir("ignored");
        let frames = record_all(tc, &flags, &dir);
        assert!(frames
            .iter()
            .all(|f| !matches!(f.ev, Event::Signal { .. })));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn buffered_records_become_ordinary_frame_pairs() {
        let mut tc = FakeTaskControl::new(TID);
        let rec = SyscallBufRecord {
            no: libc::SYS_gettid,
            args: [0; 6],
            ret: TID as i64,
            out_addr: 0,
            out: Vec::new(),
        };
        tc.push_stop(
            TID,
            syscall_entry(libc::SYS_write, 4).with_buffered(vec![rec]),
        );
        tc.push_stop(TID, syscall_exit(libc::SYS_write, 1));
        tc.push_stop(TID, exited());

        let dir = tmp_dir("buffered");
        let frames = record_all(tc, &Flags::default(), &dir);
        // gettid pair first (it executed first), then the trapped write.
        assert!(matches!(
            frames[0].ev,
            Event::Syscall {
                no: libc::SYS_gettid,
                state: SyscallState::EnteringSyscall
            }
        ));
        assert!(matches!(
            frames[1].ev,
            Event::Syscall {
                no: libc::SYS_gettid,
                state: SyscallState::ExitingSyscall
            }
        ));
        assert_eq!(TID as i64, frames[1].recorded_regs.syscall_result());
        // The pair carries its ring provenance; the trapped write does not.
        assert!(frames[0].buffered && frames[1].buffered);
        assert!(!frames[2].buffered);
        assert!(matches!(
            frames[2].ev,
            Event::Syscall {
                no: libc::SYS_write,
                ..
            }
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn fork_schedules_the_child() {
        const CHILD: pid_t = 1001;
        let mut tc = FakeTaskControl::new(TID);
        tc.add_task(CHILD);
        tc.push_stop(TID, FakeStop::new(StopReason::Fork { child: CHILD }, 2));
        tc.push_stop(TID, exited());
        tc.push_stop(CHILD, exited());

        let dir = tmp_dir("fork");
        let frames = record_all(tc, &Flags::default(), &dir);
        assert!(matches!(frames[0].ev, Event::Fork { child: CHILD }));
        // Both exit frames present; the child outlives the parent here.
        assert_eq!(
            2,
            frames
                .iter()
                .filter(|f| matches!(f.ev, Event::Exit))
                .count()
        );
        assert!(frames.iter().any(|f| f.tid == CHILD));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn syscall_checksums_are_attached_to_exit_frames() {
        let mut tc = FakeTaskControl::new(TID);
        tc.set_region(TID, 0x1000, vec![7u8; 4096]);
        tc.push_stop(TID, syscall_entry(libc::SYS_write, 1));
        tc.push_stop(TID, syscall_exit(libc::SYS_write, 1));
        tc.push_stop(TID, exited());

        let mut flags = Flags::default();
        flags.checksum = Some(crate::flags::Checksum::ChecksumSyscall);
        let dir = tmp_dir("checksum");
        let frames = record_all(tc, &flags, &dir);
        assert!(frames[0].checksums.is_empty());
        assert_eq!(1, frames[1].checksums.len());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
