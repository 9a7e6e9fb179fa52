use super::exit_result::ExitResult;
use crate::{
    commands::{
        retrace_options::{RetraceOptions, RetraceSubCommand},
        RetraceCommand,
    },
    error::Result,
    flags::Flags,
    ptrace_control::PtraceTaskControl,
    recorder::RecordSession,
    syscallbuf::SYSCALLBUF_ENABLED_ENV_VAR,
    trace::trace_writer::CloseStatus,
    util::{bind_to_cpu0, default_trace_base, new_trace_dir, update_latest_trace_link},
};
use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
};

pub struct RecordCommand {
    flags: Flags,
    exe: OsString,
    args: Vec<OsString>,
}

impl RecordCommand {
    pub fn new(options: &RetraceOptions) -> RecordCommand {
        match options.cmd.clone() {
            RetraceSubCommand::Record {
                max_ticks,
                max_events,
                ignore_signal,
                no_syscall_buffer,
                cpu_unbound,
                exe,
                args,
            } => {
                let mut flags = Flags::default();
                flags.checksum = options.checksum;
                flags.dump_on = options.dump_on;
                flags.dump_at = options.dump_at;
                if let Some(t) = max_ticks {
                    flags.max_ticks = t;
                }
                if let Some(e) = max_events {
                    flags.max_events = e;
                }
                flags.ignore_sig = ignore_signal;
                flags.use_syscall_buffer = !no_syscall_buffer;
                flags.cpu_unbound = cpu_unbound;
                RecordCommand { flags, exe, args }
            }
            _ => panic!("Unexpected RetraceSubCommand variant. Not a `Record` variant!"),
        }
    }

    fn record(&self) -> Result<PathBuf> {
        if self.flags.cpu_unbound {
            log!(
                crate::log::LogWarn,
                "tracees will run unpinned; the recording may not replay on this machine"
            );
        } else {
            bind_to_cpu0()?;
        }
        // The preload library checks this at tracee startup.
        if self.flags.use_syscall_buffer {
            env::set_var(SYSCALLBUF_ENABLED_ENV_VAR, "1");
        } else {
            env::remove_var(SYSCALLBUF_ENABLED_ENV_VAR);
        }

        let base = default_trace_base();
        let trace_dir = new_trace_dir(&base, Path::new(&self.exe));
        let tc = PtraceTaskControl::new();
        let mut session =
            RecordSession::create(tc, &self.flags, &trace_dir, &self.exe, &self.args)?;
        if let Err(e) = session.record_until_exit() {
            // An unfinished trace stays marked incomplete and can never be
            // replayed; leave it on disk for postmortem.
            let _ = session.close(CloseStatus::CloseError);
            return Err(e);
        }
        update_latest_trace_link(&base, &trace_dir);
        Ok(trace_dir)
    }
}

impl RetraceCommand for RecordCommand {
    fn run(&mut self) -> ExitResult<()> {
        match self.record() {
            Ok(trace_dir) => {
                println!("{}", trace_dir.display());
                ExitResult::Ok(())
            }
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}
