use super::exit_result::ExitResult;
use crate::{
    commands::{
        retrace_options::{RetraceOptions, RetraceSubCommand},
        RetraceCommand,
    },
    error::Result,
    flags::{CreatedHow, Flags},
    ptrace_control::PtraceTaskControl,
    replayer::{ReplaySession, ReplayStatus, StopTrigger},
    util::{bind_to_cpu0, resolve_trace_dir},
};
use std::io::{stdout, Write};
use std::path::PathBuf;

pub struct ReplayCommand {
    flags: Flags,
    autopilot: bool,
    trace_dir: Option<PathBuf>,
}

impl ReplayCommand {
    pub fn new(options: &RetraceOptions) -> ReplayCommand {
        match options.cmd.clone() {
            RetraceSubCommand::Replay {
                autopilot,
                onfork,
                goto_event,
                onprocess,
                cpu_unbound,
                trace_dir,
            } => {
                let mut flags = Flags::default();
                flags.checksum = options.checksum;
                flags.dump_on = options.dump_on;
                flags.dump_at = options.dump_at;
                flags.cpu_unbound = cpu_unbound;
                flags.goto_event = goto_event;
                if let Some(pid) = onfork {
                    flags.target_process = Some(pid);
                    flags.process_created_how = Some(CreatedHow::CreatedFork);
                } else if let Some(pid) = onprocess {
                    flags.target_process = Some(pid);
                    flags.process_created_how = Some(CreatedHow::CreatedExec);
                }
                ReplayCommand {
                    flags,
                    autopilot,
                    trace_dir,
                }
            }
            _ => panic!("Unexpected RetraceSubCommand variant. Not a `Replay` variant!"),
        }
    }

    fn replay(&self) -> Result<()> {
        let trace_dir = resolve_trace_dir(self.trace_dir.clone())?;
        if !self.flags.cpu_unbound {
            bind_to_cpu0()?;
        }
        let tc = PtraceTaskControl::new();
        let mut session = ReplaySession::create(tc, &self.flags, &trace_dir)?;
        loop {
            match session.continue_replay()? {
                ReplayStatus::ReplayFinished => {
                    if self.flags.checksum.is_some() && session.checksums_verified() == 0 {
                        log!(
                            crate::log::LogWarn,
                            "checksum verification was requested, but `{}' carries no recorded \
                             checksums; re-record with --checksum to verify",
                            trace_dir.display()
                        );
                    }
                    log!(
                        crate::log::LogInfo,
                        "replay of `{}' finished at time {} with no divergence \
                         ({} checksum frames verified)",
                        trace_dir.display(),
                        session.time(),
                        session.checksums_verified()
                    );
                    return Ok(());
                }
                ReplayStatus::DebuggerStop { tid, time, trigger } => {
                    // Debugger serving lives in a separate front end; here a
                    // stop reports tracee state and resumes.
                    if !self.autopilot {
                        self.report_stop(&session, tid, time, trigger)?;
                    }
                    continue;
                }
                ReplayStatus::StepContinue => unreachable!("continue_replay never yields this"),
            }
        }
    }

    fn report_stop(
        &self,
        session: &ReplaySession<PtraceTaskControl>,
        tid: libc::pid_t,
        time: u64,
        trigger: StopTrigger,
    ) -> Result<()> {
        let what = match trigger {
            StopTrigger::AtTime => "--goto time reached",
            StopTrigger::OnFork => "target process forked",
            StopTrigger::OnExec => "target process exec()-ed",
        };
        let out = stdout();
        let mut f = out.lock();
        writeln!(f, "=== stop at time {} (tid {}): {}", time, tid, what)?;
        session.registers(tid)?.write_register_file_compact(&mut f)?;
        writeln!(f)?;
        Ok(())
    }
}

impl RetraceCommand for ReplayCommand {
    fn run(&mut self) -> ExitResult<()> {
        match self.replay() {
            Ok(()) => ExitResult::Ok(()),
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}
