//! The replay session. Consumes the recorded frame stream in order and
//! forces a fresh tracee tree through exactly the recorded event sequence:
//! syscall results are injected rather than re-executed where they were
//! nondeterministic, preemptions land on the recorded tick counts, and the
//! scheduler is the same policy object the recorder ran. Any observable
//! difference from the recording is divergence and ends the session.

use crate::checksum;
use crate::error::{Result, RetraceError};
use crate::event::{Event, SyscallState};
use crate::flags::{CreatedHow, Flags};
use crate::kernel_metadata::{signal_name, syscall_name};
use crate::registers::Registers;
use crate::scheduler::Scheduler;
use crate::syscallbuf::{may_be_buffered, SyscallBuf, SyscallBufRecord, SYSCALLBUF_DEFAULT_CAPACITY};
use crate::task::Task;
use crate::task_control::{dump_process_memory, StopReason, TaskControl};
use crate::trace::trace_frame::{FrameTime, TraceFrame};
use crate::trace::trace_reader::TraceReader;
use libc::pid_t;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::Path;

/// What made the replayer hand control to a debugger front end.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StopTrigger {
    /// --goto: the requested global time was reached.
    AtTime,
    /// --onfork: the target process was created by fork.
    OnFork,
    /// --onprocess: the target process performed its exec.
    OnExec,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReplayStatus {
    StepContinue,
    /// Replay is paused with the tracee tree live; the caller owns the
    /// session until it resumes or detaches.
    DebuggerStop {
        tid: pid_t,
        time: FrameTime,
        trigger: StopTrigger,
    },
    ReplayFinished,
}

pub struct ReplaySession<T: TaskControl> {
    tc: T,
    flags: Flags,
    scheduler: Scheduler,
    trace: TraceReader,
    /// Task mirrors, keyed by recorded tid. The schedule replays in the
    /// recorded tid space; only the TaskControl boundary sees actual tids.
    tasks: HashMap<pid_t, Task>,
    /// Recorded tid -> actual tid of the re-spawned tree.
    tid_map: HashMap<pid_t, pid_t>,
    /// Per-task replica of the recording-side ring. Frames record whether a
    /// call went through the ring; the replica mirrors the ring's occupancy
    /// between trapped stops so a trace claiming more buffered calls than
    /// the ring holds is rejected instead of injected.
    replicas: HashMap<pid_t, SyscallBuf>,
    /// Ring records awaiting injection at the task's next trapped stop.
    pending_inject: HashMap<pid_t, Vec<SyscallBufRecord>>,
    actual_root: pid_t,
    use_syscall_buffer: bool,
    /// Frames whose recorded checksums were recomputed and matched.
    verified_checksum_frames: u64,
}

impl<T: TaskControl> ReplaySession<T> {
    pub fn create(mut tc: T, flags: &Flags, trace_dir: &Path) -> Result<ReplaySession<T>> {
        let trace = TraceReader::new(trace_dir)?;
        let header = trace.header().clone();
        let exe = OsString::from(&header.exe);
        let args: Vec<OsString> = header.args.iter().map(OsString::from).collect();
        let actual_root = tc.spawn(OsStr::new(&exe), &args)?;
        log!(
            crate::log::LogInfo,
            "replaying `{}' ({:?}) as tid {}",
            trace_dir.display(),
            exe,
            actual_root
        );
        Ok(ReplaySession {
            tc,
            flags: flags.clone(),
            scheduler: Scheduler::new(header.max_ticks, header.max_events),
            trace,
            tasks: HashMap::new(),
            tid_map: HashMap::new(),
            replicas: HashMap::new(),
            pending_inject: HashMap::new(),
            actual_root,
            use_syscall_buffer: header.use_syscall_buffer,
            verified_checksum_frames: 0,
        })
    }

    pub fn time(&self) -> FrameTime {
        self.trace.time()
    }

    pub fn task_control(&self) -> &T {
        &self.tc
    }

    /// How many frames had recorded checksums that were recomputed and
    /// matched. Zero after a full replay means the trace was recorded
    /// without checksumming.
    pub fn checksums_verified(&self) -> u64 {
        self.verified_checksum_frames
    }

    /// Replay one recorded frame (or a buffered entry/exit pair).
    pub fn replay_step(&mut self) -> Result<ReplayStatus> {
        let frame = match self.trace.read_frame()? {
            None => return Ok(ReplayStatus::ReplayFinished),
            Some(f) => f,
        };
        // The root task binding is only known once the first frame names
        // the recorded side of it.
        if self.tasks.is_empty() {
            self.register_task(frame.tid, self.actual_root);
        }
        self.step_frame(frame)
    }

    /// Run until a debugger stop or end of trace.
    pub fn continue_replay(&mut self) -> Result<ReplayStatus> {
        loop {
            match self.replay_step()? {
                ReplayStatus::StepContinue => continue,
                status => return Ok(status),
            }
        }
    }

    /// Debugger inspection: register file of a replayed task, by recorded
    /// tid. Served from the mirror, which stays valid after task exit.
    pub fn registers(&self, rec_tid: pid_t) -> Result<Registers> {
        self.tasks
            .get(&rec_tid)
            .map(|t| t.regs)
            .ok_or(RetraceError::TaskGone {
                tid: rec_tid,
                errno: nix::Error::Sys(nix::errno::Errno::ESRCH),
            })
    }

    pub fn read_memory(&mut self, rec_tid: pid_t, addr: usize, len: usize) -> Result<Vec<u8>> {
        let act = self.actual_tid(rec_tid)?;
        self.tc.read_memory(act, addr, len)
    }

    fn register_task(&mut self, rec_tid: pid_t, actual: pid_t) {
        self.tasks.insert(rec_tid, Task::new(rec_tid, rec_tid));
        self.tid_map.insert(rec_tid, actual);
        self.replicas
            .insert(rec_tid, SyscallBuf::new(SYSCALLBUF_DEFAULT_CAPACITY));
        self.scheduler.on_task_created(rec_tid);
    }

    fn actual_tid(&self, rec_tid: pid_t) -> Result<pid_t> {
        self.tid_map
            .get(&rec_tid)
            .copied()
            .ok_or(RetraceError::TaskGone {
                tid: rec_tid,
                errno: nix::Error::Sys(nix::errno::Errno::ESRCH),
            })
    }

    fn divergence(&self, time: FrameTime, tid: pid_t, msg: String) -> RetraceError {
        RetraceError::Divergence { time, tid, msg }
    }

    fn step_frame(&mut self, frame: TraceFrame) -> Result<ReplayStatus> {
        let rec_tid = frame.tid;
        let time = frame.global_time;

        match self.scheduler.next_task() {
            Some(t) if t == rec_tid => {}
            got => {
                return Err(self.divergence(
                    time,
                    rec_tid,
                    format!("schedule mismatch: chose {:?}, trace has {}", got, rec_tid),
                ))
            }
        }

        // A buffered call never trapped during recording, so it must not
        // trap now: reconstruct the ring record from the frame pair and
        // queue it for injection instead of resuming the tracee. A call that
        // fell back to a trap at record time replays as a trap, whatever the
        // ring's state here; the frame says which path the execution took.
        if frame.buffered {
            match frame.ev {
                Event::Syscall {
                    no,
                    state: SyscallState::EnteringSyscall,
                } if self.use_syscall_buffer && may_be_buffered(no) => {
                    return self.step_buffered_pair(frame, no);
                }
                ev => {
                    return Err(RetraceError::MalformedFrame {
                        time,
                        msg: format!("`{}' is recorded as buffered but cannot have been", ev),
                    })
                }
            }
        }

        // Trapped stop: the recording tracee's ring was drained here, so
        // anything queued goes into the live ring now.
        if let Some(pending) = self.pending_inject.remove(&rec_tid) {
            let act = self.actual_tid(rec_tid)?;
            self.tc.inject_syscallbuf(act, &pending)?;
            self.replicas.get_mut(&rec_tid).expect("live task has a ring").drain();
        }

        let act = self.actual_tid(rec_tid)?;
        match frame.ev {
            Event::Syscall {
                no,
                state: SyscallState::EnteringSyscall,
            } => {
                match self.tc.resume_until_event(act)? {
                    StopReason::SyscallEntry { no: got } if got == no => {}
                    other => {
                        return Err(self.divergence(
                            time,
                            rec_tid,
                            format!(
                                "expected entry to {}, got {:?}",
                                syscall_name(no),
                                other
                            ),
                        ))
                    }
                }
                // The call must not execute for real; its recorded effects
                // are restored at the exit frame.
                self.tc.cancel_syscall(act)?;
                self.tc.set_registers(act, &frame.recorded_regs)?;
            }
            Event::Syscall {
                state: SyscallState::ExitingSyscall,
                ..
            } => {
                match self.tc.resume_until_event(act)? {
                    StopReason::SyscallExit { .. } => {}
                    other => {
                        return Err(self.divergence(
                            time,
                            rec_tid,
                            format!("expected syscall exit, got {:?}", other),
                        ))
                    }
                }
                self.tc.set_registers(act, &frame.recorded_regs)?;
                for mr in &frame.recorded_data {
                    self.tc.write_memory(act, mr.addr as usize, &mr.data)?;
                }
            }
            Event::Signal { sig } => {
                match self.tc.resume_until_event(act)? {
                    StopReason::Signal { sig: got } if got == sig => {}
                    other => {
                        return Err(self.divergence(
                            time,
                            rec_tid,
                            format!("expected {}, got {:?}", signal_name(sig), other),
                        ))
                    }
                }
                self.tc.set_registers(act, &frame.recorded_regs)?;
            }
            Event::Sched => self.force_tick_target(act, rec_tid, &frame)?,
            Event::Fork { child } => {
                match self.tc.resume_until_event(act)? {
                    StopReason::Fork { child: actual_child } => {
                        self.register_task(child, actual_child);
                    }
                    other => {
                        return Err(self.divergence(
                            time,
                            rec_tid,
                            format!("expected fork of {}, got {:?}", child, other),
                        ))
                    }
                }
                self.tc.set_registers(act, &frame.recorded_regs)?;
            }
            Event::Exec => {
                match self.tc.resume_until_event(act)? {
                    StopReason::Exec => {}
                    other => {
                        return Err(self.divergence(
                            time,
                            rec_tid,
                            format!("expected exec, got {:?}", other),
                        ))
                    }
                }
                self.tc.set_registers(act, &frame.recorded_regs)?;
            }
            Event::Exit => {
                match self.tc.resume_until_event(act)? {
                    StopReason::Exited { .. } => {}
                    other => {
                        return Err(self.divergence(
                            time,
                            rec_tid,
                            format!("expected exit, got {:?}", other),
                        ))
                    }
                }
                self.scheduler.on_task_exited(rec_tid);
            }
        }

        let ticks_delta = self.sync_task_mirror(&frame);
        match frame.ev {
            Event::Exit => {
                self.tasks.get_mut(&rec_tid).unwrap().exited = true;
            }
            Event::Sched => self.scheduler.expire_slice(),
            _ => {
                self.scheduler.note_event(ticks_delta);
            }
        }

        self.verify_checksums(&frame)?;
        self.maybe_dump_memory(&frame)?;
        Ok(self.post_frame_status(&frame))
    }

    /// A recorded buffered call: consume its exit frame too, rebuild the
    /// ring record and queue it. The tracee stub consumes the injected ring
    /// at replay, so no host stop happens for this pair.
    fn step_buffered_pair(&mut self, entry: TraceFrame, no: i64) -> Result<ReplayStatus> {
        let rec_tid = entry.tid;
        let exit = self.trace.read_frame()?.ok_or(RetraceError::MalformedFrame {
            time: entry.global_time,
            msg: format!(
                "trace ends inside a buffered {} (entry without exit)",
                syscall_name(no)
            ),
        })?;
        let exit_ok = exit.tid == rec_tid
            && exit.buffered
            && matches!(
                exit.ev,
                Event::Syscall {
                    no: got,
                    state: SyscallState::ExitingSyscall,
                } if got == no
            );
        if !exit_ok {
            return Err(RetraceError::MalformedFrame {
                time: exit.global_time,
                msg: format!(
                    "buffered {} entry not followed by its exit",
                    syscall_name(no)
                ),
            });
        }
        let (out_addr, out) = match exit.recorded_data.first() {
            Some(mr) => (mr.addr, mr.data.clone()),
            None => (0, Vec::new()),
        };
        let record = SyscallBufRecord {
            no,
            args: entry.recorded_regs.syscall_args(),
            ret: exit.recorded_regs.syscall_result(),
            out_addr,
            out,
        };
        self.replicas
            .get_mut(&rec_tid)
            .expect("live task has a ring")
            .push(record.clone())
            .map_err(|_| RetraceError::RingOverflow { tid: rec_tid })?;
        self.pending_inject
            .entry(rec_tid)
            .or_insert_with(Vec::new)
            .push(record);

        // Buffered pairs never counted as scheduler events during
        // recording, so they do not here either.
        let task = self.tasks.get_mut(&rec_tid).unwrap();
        task.thread_time += 2;
        task.regs = exit.recorded_regs;
        task.counters.ticks = exit.adapted_ticks;

        if let status @ ReplayStatus::DebuggerStop { .. } = self.post_frame_status(&entry) {
            return Ok(status);
        }
        Ok(self.post_frame_status(&exit))
    }

    /// Run `act` forward to exactly the recorded tick count of a SCHED
    /// frame. The tick interrupt has skid, so the last stretch is walked
    /// one instruction at a time.
    fn force_tick_target(&mut self, act: pid_t, rec_tid: pid_t, frame: &TraceFrame) -> Result<()> {
        let time = frame.global_time;
        let target = frame.adapted_ticks;
        let current = self.tc.read_counters(act)?.ticks;
        if current > target {
            return Err(self.divergence(
                time,
                rec_tid,
                format!(
                    "already past the preemption point: {} ticks, recorded {}",
                    current, target
                ),
            ));
        }
        if current < target {
            self.tc.arm_tick_interrupt(act, target - current)?;
            match self.tc.resume_until_event(act)? {
                StopReason::SchedulerInterrupt => {}
                other => {
                    return Err(self.divergence(
                        time,
                        rec_tid,
                        format!("expected tick interrupt, got {:?}", other),
                    ))
                }
            }
            let mut now = self.tc.read_counters(act)?.ticks;
            while now < target {
                self.tc.single_step(act)?;
                now = self.tc.read_counters(act)?.ticks;
            }
            if now > target {
                return Err(self.divergence(
                    time,
                    rec_tid,
                    format!("overshot the preemption point: {} ticks, recorded {}", now, target),
                ));
            }
        }
        self.tc.set_registers(act, &frame.recorded_regs)?;
        Ok(())
    }

    /// Bring the mirror in line with the frame; returns the tick delta the
    /// frame represents for scheduler accounting.
    fn sync_task_mirror(&mut self, frame: &TraceFrame) -> u64 {
        let task = self.tasks.get_mut(&frame.tid).unwrap();
        task.thread_time += 1;
        task.regs = frame.recorded_regs;
        let delta = frame.adapted_ticks.saturating_sub(task.counters.ticks);
        task.counters.ticks = frame.adapted_ticks;
        task.counters.instructions = frame.instructions;
        task.counters.page_faults = frame.page_faults;
        task.counters.hw_interrupts = frame.hw_interrupts;
        delta
    }

    fn verify_checksums(&mut self, frame: &TraceFrame) -> Result<()> {
        if frame.checksums.is_empty() {
            return Ok(());
        }
        let act = self.actual_tid(frame.tid)?;
        let live = checksum::compute_for_task(&mut self.tc, act)?;
        checksum::compare(frame.global_time, frame.tid, &frame.checksums, &live)?;
        self.verified_checksum_frames += 1;
        Ok(())
    }

    fn maybe_dump_memory(&mut self, frame: &TraceFrame) -> Result<()> {
        if !self.flags.wants_memory_dump(&frame.ev, frame.global_time)
            || matches!(frame.ev, Event::Exit)
        {
            return Ok(());
        }
        let act = self.actual_tid(frame.tid)?;
        let path = self.trace.dump_path(frame.tid, frame.global_time);
        log!(
            crate::log::LogInfo,
            "dumping tid {} memory at time {} to {:?}",
            frame.tid,
            frame.global_time,
            path
        );
        dump_process_memory(&mut self.tc, act, &path)
    }

    fn post_frame_status(&self, frame: &TraceFrame) -> ReplayStatus {
        if self.flags.goto_event == Some(frame.global_time) {
            return ReplayStatus::DebuggerStop {
                tid: frame.tid,
                time: frame.global_time,
                trigger: StopTrigger::AtTime,
            };
        }
        match (
            self.flags.target_process,
            self.flags.process_created_how,
            frame.ev,
        ) {
            (Some(p), Some(CreatedHow::CreatedFork), Event::Fork { child }) if child == p => {
                ReplayStatus::DebuggerStop {
                    tid: p,
                    time: frame.global_time,
                    trigger: StopTrigger::OnFork,
                }
            }
            (Some(p), Some(CreatedHow::CreatedExec), Event::Exec) if frame.tid == p => {
                ReplayStatus::DebuggerStop {
                    tid: p,
                    time: frame.global_time,
                    trigger: StopTrigger::OnExec,
                }
            }
            _ => ReplayStatus::StepContinue,
        }
    }
}
