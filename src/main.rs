#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
mod log;
mod checksum;
mod commands;
mod error;
mod event;
mod flags;
mod kernel_metadata;
mod perf_counters;
mod perf_event;
mod ptrace_control;
mod recorder;
mod registers;
mod replayer;
mod scheduler;
mod scoped_fd;
mod syscallbuf;
mod task;
mod task_control;
mod ticks;
mod trace;
mod util;

use crate::commands::{
    dump_command::DumpCommand,
    exit_result::ExitResult,
    record_command::RecordCommand,
    replay_command::ReplayCommand,
    retrace_options::{RetraceOptions, RetraceSubCommand},
    RetraceCommand,
};
use nix::sys::utsname::uname;
use std::fs;
use structopt::StructOpt;

pub fn assert_prerequisites(use_syscall_buffer: bool) {
    let unm = uname();
    let release = unm.release();
    let parts: Vec<&str> = release.split('.').collect();
    if parts.len() < 2 {
        fatal!("Could not parse kernel version string. Got: `{}`", release);
    }

    let maybe_major = parts[0].parse::<u32>();
    let maybe_minor = parts[1].parse::<u32>();
    if maybe_major.is_err() || maybe_minor.is_err() {
        fatal!("Could not parse kernel version string. Got: `{}`", release);
    }

    let (major, minor) = (maybe_major.unwrap(), maybe_minor.unwrap());
    if (major, minor) < (3, 4) {
        fatal!("Kernel doesn't support necessary ptrace functionality; need 3.4.0 or better.");
    }

    if use_syscall_buffer && (major, minor) < (3, 5) {
        fatal!(
            "Your kernel does not support syscall filtering; please use the -n option while \
             recording"
        );
    }

    // Tick counting needs a usable perf_event_open; a paranoid setting above
    // 1 blocks it for unprivileged users.
    if let Ok(paranoid) = fs::read_to_string("/proc/sys/kernel/perf_event_paranoid") {
        if paranoid.trim().parse::<i32>().unwrap_or(0) > 1 {
            log!(
                crate::log::LogWarn,
                "/proc/sys/kernel/perf_event_paranoid is {}; tick counters may be unavailable \
                 without CAP_PERFMON",
                paranoid.trim()
            );
        }
    }
}

fn main() -> ExitResult<()> {
    let options = RetraceOptions::from_args();

    match &options.cmd {
        RetraceSubCommand::Record {
            no_syscall_buffer, ..
        } => {
            assert_prerequisites(!no_syscall_buffer);
            RecordCommand::new(&options).run()
        }
        RetraceSubCommand::Replay { .. } => {
            assert_prerequisites(false);
            ReplayCommand::new(&options).run()
        }
        RetraceSubCommand::Dump { .. } => DumpCommand::new(&options).run(),
    }
}
