use crate::{
    flags::{Checksum, DumpOn},
    ticks::Ticks,
    trace::trace_frame::FrameTime,
};
use libc::pid_t;
use std::{error::Error, ffi::OsString, num::ParseIntError, path::PathBuf};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "retrace",
    about = "Record process execution deterministically, then replay it exactly",
    after_help = "Use RETRACE_LOG to control logging; e.g. RETRACE_LOG=all:warn,scheduler:debug"
)]
#[structopt(global_settings =
&[AppSettings::AllowNegativeNumbers, AppSettings::UnifiedHelpMessage])]
pub struct RetraceOptions {
    #[structopt(short = "T", long, help = "Dump memory at global time point <dump-at>.")]
    pub dump_at: Option<FrameTime>,

    #[structopt(
    short = "D",
    long,
    parse(try_from_str = parse_dump_on),
    help = "Where <dump-on> := <syscall-no> | -<signal-no>. Dump memory at the exit of the \
            given syscall, or at deliveries of the given signal.",
    )]
    pub dump_on: Option<DumpOn>,

    #[structopt(
    short = "C",
    long,
    parse(try_from_str = parse_checksum),
    help = "Where <checksum> := `on-syscalls` | `on-all-events` | <from-time>\n\n\
                Compute and store (during recording) or read and verify (during replay) checksums \
                of each of a tracee's memory mappings either at the end of all syscalls \
                (`on-syscalls`), at all events (`on-all-events`), or starting from a global \
                timepoint <from-time> (which is a positive integer).",
    )]
    pub checksum: Option<Checksum>,

    #[structopt(subcommand)]
    pub cmd: RetraceSubCommand,
}

fn parse_checksum(checksum_s: &str) -> Result<Checksum, Box<dyn Error>> {
    if checksum_s == "on-syscalls" {
        Ok(Checksum::ChecksumSyscall)
    } else if checksum_s == "on-all-events" {
        Ok(Checksum::ChecksumAll)
    } else if checksum_s.chars().all(|c| !c.is_ascii_digit()) {
        Err(Box::new(clap::Error::with_description(
            "Only `on-syscalls` or `on-all-events` or an unsigned integer is valid here",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(Checksum::ChecksumAt(checksum_s.parse::<FrameTime>()?))
    }
}

fn parse_dump_on(dump_on_s: &str) -> Result<DumpOn, Box<dyn Error>> {
    if dump_on_s.chars().all(|c| c.is_ascii_digit() || c == '-') {
        let signal_or_syscall = dump_on_s.parse::<i64>()?;
        if signal_or_syscall < 0 {
            Ok(DumpOn::DumpOnSignal(-signal_or_syscall as i32))
        } else {
            Ok(DumpOn::DumpOnSyscall(signal_or_syscall))
        }
    } else {
        Err(Box::new(clap::Error::with_description(
            "Only a syscall number or a negated signal number is valid here",
            clap::ErrorKind::InvalidValue,
        )))
    }
}

#[derive(StructOpt, Debug, Clone)]
pub enum RetraceSubCommand {
    /// Record the execution of <exe> and its children into a trace directory.
    #[structopt(name = "record")]
    Record {
        /// Maximum number of CPU ticks (retired conditional branches) to
        /// allow a task to run before interrupting it
        #[structopt(short = "c", long = "num-cpu-ticks", parse(try_from_str = parse_nonzero_u64))]
        max_ticks: Option<Ticks>,

        /// Maximum number of trace events to allow a task to reach before
        /// descheduling it
        #[structopt(short = "e", long = "num-events", parse(try_from_str = parse_nonzero_u64))]
        max_events: Option<u64>,

        /// Block <ignore-signal> from being delivered to tracees. Probably
        /// only useful for unit tests
        #[structopt(short = "i", long = "ignore-signal", parse(try_from_str = parse_signal))]
        ignore_signal: Option<i32>,

        /// Disable the syscall buffer preload library even if it would
        /// otherwise be used
        #[structopt(short = "n", long = "no-syscall-buffer")]
        no_syscall_buffer: bool,

        /// Allow tracees to run on any CPU. Default is to pin them to CPU 0.
        /// Note that this may cause a diverge from the recording in some cases
        #[structopt(short = "u", long = "cpu-unbound")]
        cpu_unbound: bool,

        /// The executable to record
        exe: OsString,

        /// Arguments passed to the recorded executable
        args: Vec<OsString>,
    },

    /// Replay a previously recorded trace.
    #[structopt(name = "replay")]
    Replay {
        /// Replay without stopping for debugger connections
        #[structopt(short = "a", long = "autopilot")]
        autopilot: bool,

        /// Where <onfork> := <pid>. Pause for a debugger when <pid> has been
        /// fork()-ed
        #[structopt(short = "f", long = "onfork", parse(try_from_str = parse_pid))]
        onfork: Option<pid_t>,

        /// Where <goto-event> := <event-num>. Pause for a debugger on
        /// reaching <event-num> in the trace
        #[structopt(short = "g", long = "goto", parse(try_from_str = parse_goto_event))]
        goto_event: Option<FrameTime>,

        /// Where <onprocess> := <pid>. Pause for a debugger when <pid> has
        /// been exec()-ed
        #[structopt(short = "p", long = "onprocess", parse(try_from_str = parse_pid))]
        onprocess: Option<pid_t>,

        /// Allow replay to run on any CPU. Default is to pin to CPU 0, as
        /// during recording. Note that this may cause a diverge from the
        /// recording in some cases
        #[structopt(short = "u", long = "cpu-unbound")]
        cpu_unbound: bool,

        /// Which directory is the trace data in? If omitted the latest trace dir is used
        trace_dir: Option<PathBuf>,
    },

    /// Dump data from the recorded trace
    #[structopt(name = "dump")]
    Dump {
        /// Dump trace frames in a more easily machine-parseable
        /// format instead of the default human-readable format
        #[structopt(short = "r", long = "raw")]
        raw_dump: bool,

        /// Which directory is the trace data in? If omitted the latest trace dir is used
        trace_dir: Option<PathBuf>,

        /// Event specs can be either an event number like `127`, or a range
        /// like `1000-5000`. By default, all events are dumped
        #[structopt(parse(try_from_str = parse_range))]
        event_spec: Option<(FrameTime, Option<FrameTime>)>,
    },
}

fn parse_range(range_or_single: &str) -> Result<(FrameTime, Option<FrameTime>), ParseIntError> {
    let args: Vec<&str> = range_or_single.splitn(2, '-').collect();
    let low = args[0].parse::<FrameTime>()?;
    let mut high: Option<FrameTime> = None;
    if args.len() == 2 {
        high = Some(args[1].parse::<FrameTime>()?);
    }
    Ok((low, high))
}

fn parse_pid(maybe_pid: &str) -> Result<pid_t, Box<dyn Error>> {
    let pid = maybe_pid.trim().parse::<pid_t>()?;
    if pid < 1 {
        Err(Box::new(clap::Error::with_description(
            "pid cannot be 0 or negative",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(pid)
    }
}

fn parse_signal(maybe_signal: &str) -> Result<i32, Box<dyn Error>> {
    let sig = maybe_signal.trim().parse::<i32>()?;
    if !(1..libc::SIGRTMAX()).contains(&sig) {
        Err(Box::new(clap::Error::with_description(
            "Not a valid signal number",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(sig)
    }
}

fn parse_goto_event(maybe_goto_event: &str) -> Result<FrameTime, Box<dyn Error>> {
    let goto_event = maybe_goto_event.trim().parse::<FrameTime>()?;
    if goto_event == 0 {
        Err(Box::new(clap::Error::with_description(
            "Please provide a number greater than 0",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(goto_event)
    }
}

fn parse_nonzero_u64(maybe_n: &str) -> Result<u64, Box<dyn Error>> {
    let n = maybe_n.trim().parse::<u64>()?;
    if n == 0 {
        Err(Box::new(clap::Error::with_description(
            "Please provide a number greater than 0",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_forms() {
        assert_eq!(Checksum::ChecksumSyscall, parse_checksum("on-syscalls").unwrap());
        assert_eq!(Checksum::ChecksumAll, parse_checksum("on-all-events").unwrap());
        assert_eq!(Checksum::ChecksumAt(1234), parse_checksum("1234").unwrap());
        assert!(parse_checksum("sometimes").is_err());
    }

    #[test]
    fn dump_on_signs() {
        assert_eq!(DumpOn::DumpOnSyscall(1), parse_dump_on("1").unwrap());
        assert_eq!(DumpOn::DumpOnSignal(11), parse_dump_on("-11").unwrap());
        assert!(parse_dump_on("SIGSEGV").is_err());
    }

    #[test]
    fn range_single_and_pair() {
        assert_eq!((127, None), parse_range("127").unwrap());
        assert_eq!((1000, Some(5000)), parse_range("1000-5000").unwrap());
        assert!(parse_range("x-y").is_err());
    }
}
