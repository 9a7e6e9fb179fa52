//! The real TaskControl: drives tracees with ptrace, reads memory through
//! /proc/<tid>/mem, takes mapping tables from /proc/<tid>/maps, and gets
//! tick interrupts from the per-task performance counters.

use crate::error::{Result, RetraceError};
use crate::perf_counters::{CounterSnapshot, PerfCounters, TIME_SLICE_SIGNAL};
use crate::registers::Registers;
use crate::syscallbuf::{SyscallBuf, SyscallBufRecord, SYSCALLBUF_DEFAULT_CAPACITY};
use crate::task_control::{MapProt, MemoryMapping, StopReason, TaskControl};
use crate::ticks::Ticks;
use libc::pid_t;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::ptrace::Options;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;

struct PtraceTask {
    counters: PerfCounters,
    mem: Option<File>,
    in_syscall: bool,
    pending_sig: Option<Signal>,
    ring: SyscallBuf,
}

pub struct PtraceTaskControl {
    tasks: HashMap<pid_t, PtraceTask>,
}

/// ESRCH and EPERM mean the host took the task away from us; that is fatal
/// to this task's session but siblings may continue.
fn host_error(tid: pid_t, e: nix::Error) -> RetraceError {
    match e.as_errno() {
        Some(Errno::ESRCH) | Some(Errno::EPERM) => RetraceError::TaskGone { tid, errno: e },
        _ => RetraceError::HostInterface { tid, errno: e },
    }
}

fn io_host_error(tid: pid_t, e: std::io::Error) -> RetraceError {
    let errno = Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO));
    host_error(tid, nix::Error::Sys(errno))
}

impl PtraceTaskControl {
    pub fn new() -> PtraceTaskControl {
        PtraceTaskControl {
            tasks: HashMap::new(),
        }
    }

    fn register_task(&mut self, tid: pid_t) -> Result<()> {
        let mut counters = PerfCounters::new(tid)?;
        counters.start();
        self.tasks.insert(
            tid,
            PtraceTask {
                counters,
                mem: None,
                in_syscall: false,
                pending_sig: None,
                ring: SyscallBuf::new(SYSCALLBUF_DEFAULT_CAPACITY),
            },
        );
        Ok(())
    }

    fn task(&mut self, tid: pid_t) -> Result<&mut PtraceTask> {
        self.tasks.get_mut(&tid).ok_or(RetraceError::TaskGone {
            tid,
            errno: nix::Error::Sys(Errno::ESRCH),
        })
    }

    fn mem_file(&mut self, tid: pid_t) -> Result<&File> {
        let task = self.task(tid)?;
        if task.mem.is_none() {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .open(format!("/proc/{}/mem", tid))
                .map_err(|e| io_host_error(tid, e))?;
            task.mem = Some(f);
        }
        Ok(self.tasks.get(&tid).unwrap().mem.as_ref().unwrap())
    }

    fn wait_and_classify(&mut self, tid: pid_t, stepping: bool) -> Result<StopReason> {
        let pid = Pid::from_raw(tid);
        let status = waitpid(pid, None).map_err(|e| host_error(tid, e))?;
        let reason = match status {
            WaitStatus::Exited(_, code) => StopReason::Exited { status: code },
            WaitStatus::Signaled(_, sig, _) => StopReason::Exited {
                status: 128 + sig as i32,
            },
            WaitStatus::PtraceSyscall(_) => {
                let regs = self.get_registers(tid)?;
                let no = regs.original_syscallno();
                let task = self.task(tid)?;
                task.in_syscall = !task.in_syscall;
                if task.in_syscall {
                    StopReason::SyscallEntry { no }
                } else {
                    StopReason::SyscallExit { no }
                }
            }
            WaitStatus::PtraceEvent(_, _, event) => match event {
                libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                    let child =
                        ptrace::getevent(pid).map_err(|e| host_error(tid, e))? as pid_t;
                    // Sync with the child's initial stop before anyone
                    // resumes it.
                    waitpid(Pid::from_raw(child), None)
                        .map_err(|e| host_error(child, e))?;
                    self.register_task(child)?;
                    StopReason::Fork { child }
                }
                libc::PTRACE_EVENT_EXEC => StopReason::Exec,
                other => {
                    log!(
                        crate::log::LogWarn,
                        "Unhandled ptrace event {} on tid {}",
                        other,
                        tid
                    );
                    StopReason::SchedulerInterrupt
                }
            },
            WaitStatus::Stopped(_, sig) => {
                if sig as i32 == TIME_SLICE_SIGNAL {
                    StopReason::SchedulerInterrupt
                } else if stepping && sig == Signal::SIGTRAP {
                    StopReason::Stepped
                } else {
                    // Deliver on the next resume unless discarded.
                    self.task(tid)?.pending_sig = Some(sig);
                    StopReason::Signal { sig: sig as i32 }
                }
            }
            WaitStatus::StillAlive | WaitStatus::Continued(_) => StopReason::Stepped,
        };
        if let StopReason::Exited { .. } = reason {
            self.tasks.remove(&tid);
        }
        Ok(reason)
    }
}

impl TaskControl for PtraceTaskControl {
    fn spawn(&mut self, exe: &OsStr, args: &[OsString]) -> Result<pid_t> {
        let exe_c = CString::new(exe.as_bytes()).map_err(|_| {
            RetraceError::Usage(format!("exe path {:?} contains a NUL byte", exe))
        })?;
        let mut argv: Vec<CString> = vec![exe_c.clone()];
        for a in args {
            argv.push(CString::new(a.as_bytes()).map_err(|_| {
                RetraceError::Usage(format!("argument {:?} contains a NUL byte", a))
            })?);
        }
        match unsafe { fork() }? {
            ForkResult::Child => {
                if ptrace::traceme().is_err() {
                    std::process::exit(126);
                }
                let _ = execvp(&exe_c, &argv);
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                let tid = child.as_raw();
                // The child stops with SIGTRAP once exec succeeds.
                waitpid(child, None).map_err(|e| host_error(tid, e))?;
                ptrace::setoptions(
                    child,
                    Options::PTRACE_O_TRACESYSGOOD
                        | Options::PTRACE_O_TRACEFORK
                        | Options::PTRACE_O_TRACEVFORK
                        | Options::PTRACE_O_TRACECLONE
                        | Options::PTRACE_O_TRACEEXEC,
                )
                .map_err(|e| host_error(tid, e))?;
                self.register_task(tid)?;
                Ok(tid)
            }
        }
    }

    fn get_registers(&mut self, tid: pid_t) -> Result<Registers> {
        let regs =
            ptrace::getregs(Pid::from_raw(tid)).map_err(|e| host_error(tid, e))?;
        Ok(Registers::from(regs))
    }

    fn set_registers(&mut self, tid: pid_t, regs: &Registers) -> Result<()> {
        let pid = Pid::from_raw(tid);
        let mut raw = ptrace::getregs(pid).map_err(|e| host_error(tid, e))?;
        regs.apply_to(&mut raw);
        ptrace::setregs(pid, raw).map_err(|e| host_error(tid, e))
    }

    fn read_memory(&mut self, tid: pid_t, addr: usize, len: usize) -> Result<Vec<u8>> {
        let f = self.mem_file(tid)?;
        let mut buf = vec![0u8; len];
        f.read_exact_at(&mut buf, addr as u64)
            .map_err(|e| io_host_error(tid, e))?;
        Ok(buf)
    }

    fn write_memory(&mut self, tid: pid_t, addr: usize, bytes: &[u8]) -> Result<()> {
        let f = self.mem_file(tid)?;
        f.write_all_at(bytes, addr as u64)
            .map_err(|e| io_host_error(tid, e))
    }

    fn resume_until_event(&mut self, tid: pid_t) -> Result<StopReason> {
        let sig = self.task(tid)?.pending_sig.take();
        ptrace::syscall(Pid::from_raw(tid), sig).map_err(|e| host_error(tid, e))?;
        self.wait_and_classify(tid, false)
    }

    fn single_step(&mut self, tid: pid_t) -> Result<StopReason> {
        let sig = self.task(tid)?.pending_sig.take();
        ptrace::step(Pid::from_raw(tid), sig).map_err(|e| host_error(tid, e))?;
        self.wait_and_classify(tid, true)
    }

    fn read_counters(&mut self, tid: pid_t) -> Result<CounterSnapshot> {
        Ok(self.task(tid)?.counters.read())
    }

    fn arm_tick_interrupt(&mut self, tid: pid_t, period: Ticks) -> Result<()> {
        self.task(tid)?.counters.arm_tick_interrupt(period);
        Ok(())
    }

    fn mappings(&mut self, tid: pid_t) -> Result<Vec<MemoryMapping>> {
        let maps = fs::read_to_string(format!("/proc/{}/maps", tid))
            .map_err(|e| io_host_error(tid, e))?;
        Ok(parse_maps(&maps))
    }

    fn drain_syscallbuf(&mut self, tid: pid_t) -> Vec<SyscallBufRecord> {
        // The preload library is the producer; without it the ring simply
        // stays empty and every syscall traps.
        self.tasks
            .get_mut(&tid)
            .map(|t| t.ring.drain())
            .unwrap_or_default()
    }

    fn inject_syscallbuf(&mut self, tid: pid_t, records: &[SyscallBufRecord]) -> Result<()> {
        let task = self.task(tid)?;
        for rec in records {
            if task.ring.push(rec.clone()).is_err() {
                return Err(RetraceError::RingOverflow { tid });
            }
        }
        Ok(())
    }

    fn cancel_syscall(&mut self, tid: pid_t) -> Result<()> {
        let pid = Pid::from_raw(tid);
        let mut raw = ptrace::getregs(pid).map_err(|e| host_error(tid, e))?;
        // An impossible syscall number: the kernel returns ENOSYS without
        // doing anything, and the replayer then overwrites the result.
        raw.orig_rax = -1i64 as u64;
        ptrace::setregs(pid, raw).map_err(|e| host_error(tid, e))
    }

    fn discard_pending_signal(&mut self, tid: pid_t) {
        if let Some(task) = self.tasks.get_mut(&tid) {
            task.pending_sig = None;
        }
    }
}

fn parse_maps(maps: &str) -> Vec<MemoryMapping> {
    let mut out = Vec::new();
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let range = match fields.next() {
            Some(r) => r,
            None => continue,
        };
        let perms = fields.next().unwrap_or("");
        let mut bounds = range.splitn(2, '-');
        let start = usize::from_str_radix(bounds.next().unwrap_or("0"), 16).unwrap_or(0);
        let end = usize::from_str_radix(bounds.next().unwrap_or("0"), 16).unwrap_or(0);
        if end <= start {
            continue;
        }
        let mut prot = MapProt::empty();
        if perms.contains('r') {
            prot |= MapProt::READ;
        }
        if perms.contains('w') {
            prot |= MapProt::WRITE;
        }
        if perms.contains('x') {
            prot |= MapProt::EXEC;
        }
        let shared = perms.contains('s');
        // offset, dev, inode
        let path = fields.nth(3).map(|p| p.to_owned());
        out.push(MemoryMapping {
            start,
            end,
            prot,
            shared,
            path,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_maps_extracts_ranges_and_permissions() {
        let maps = "559f8000-55a01000 r-xp 00000000 fd:01 131 /usr/bin/cat\n\
                    7ffc1000-7ffc3000 rw-p 00000000 00:00 0 [stack]\n\
                    7f1234000-7f1235000 rw-s 00000000 00:05 42 /dev/shm/x\n";
        let m = parse_maps(maps);
        assert_eq!(3, m.len());
        assert_eq!(0x559f8000, m[0].start);
        assert!(m[0].prot.contains(MapProt::READ | MapProt::EXEC));
        assert!(!m[0].shared);
        assert_eq!(Some("/usr/bin/cat".to_owned()), m[0].path);
        assert!(m[1].prot.contains(MapProt::WRITE));
        assert!(m[2].shared);
    }
}
