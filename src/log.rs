use backtrace::Backtrace;
use std::{
    collections::HashMap,
    env,
    env::var_os,
    fs::{File, OpenOptions},
    io::{self, Write},
    sync::{Mutex, MutexGuard},
};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    default_level: LogLevel,
    /// Possibly a file, otherwise stderr.
    log_file: Box<dyn Write + Send>,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let f: Box<dyn Write + Send> = match var_os("RETRACE_LOG_FILE") {
            Some(filename) => Box::new(File::create(&filename).unwrap_or_else(|e| {
                panic!(
                    "Could not create log file `{:?}' from RETRACE_LOG_FILE: {:?}",
                    filename, e
                )
            })),
            None => match var_os("RETRACE_APPEND_LOG_FILE") {
                Some(filename) => Box::new(
                    OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(&filename)
                        .unwrap_or_else(|e| {
                            panic!(
                                "Could not append to log file `{:?}' from \
                                 RETRACE_APPEND_LOG_FILE: {:?}",
                                filename, e
                            )
                        }),
                ),
                None => Box::new(io::stderr()),
            },
        };

        let mut default_level = LogWarn;
        let mut level_map: HashMap<String, LogLevel> = HashMap::new();
        // e.g. RETRACE_LOG=all:warn,scheduler:debug
        if let Ok(spec) = env::var("RETRACE_LOG") {
            for part in spec.split(',') {
                let mut it = part.splitn(2, ':');
                let name = it.next().unwrap_or("").trim();
                let level = level_from_name(it.next().unwrap_or("").trim());
                if name.is_empty() {
                    continue;
                }
                if name == "all" {
                    default_level = level;
                } else {
                    level_map.insert(name.to_owned(), level);
                }
            }
        }

        Mutex::new(LogGlobals {
            level_map,
            default_level,
            log_file: f,
        })
    };
}

fn level_from_name(name: &str) -> LogLevel {
    match name {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

fn level_to_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

fn lock_globals() -> MutexGuard<'static, LogGlobals> {
    match LOG_GLOBALS.lock() {
        Ok(g) => g,
        Err(e) => panic!("Could not obtain lock on the log: {:?}", e),
    }
}

/// The name used for level lookup is the last component of the module path.
fn enabled(globals: &LogGlobals, level: LogLevel, module_path: &str) -> bool {
    let name = module_path.rsplit("::").next().unwrap_or(module_path);
    let cutoff = globals
        .level_map
        .get(name)
        .copied()
        .unwrap_or(globals.default_level);
    level <= cutoff
}

pub fn write_log(
    level: LogLevel,
    file: &str,
    line: u32,
    module_path: &str,
    args: std::fmt::Arguments,
) {
    let mut globals = lock_globals();
    if !enabled(&globals, level, module_path) {
        return;
    }
    // Swallow write errors; there is nowhere better to report them.
    write!(
        globals.log_file,
        "[{} {}:{}] {}\n",
        level_to_name(level),
        file,
        line,
        args
    )
    .unwrap_or(());
    if level <= LogError {
        globals.log_file.flush().unwrap_or(());
    }
}

pub fn flush_log_buffer() {
    let mut globals = lock_globals();
    globals.log_file.flush().unwrap_or(());
}

/// Dump a backtrace to the log if RETRACE_BACKTRACE is set, then exit.
/// Only the fatal! macro ends up here; core code propagates Results instead.
pub fn notifying_abort(bt: Backtrace) -> ! {
    if env::var_os("RETRACE_BACKTRACE").is_some() {
        let mut globals = lock_globals();
        write!(globals.log_file, "{:?}\n", bt).unwrap_or(());
    }
    flush_log_buffer();
    std::process::exit(1);
}

macro_rules! log {
    ($level:expr, $($args:tt)+) => {
        crate::log::write_log(
            $level,
            file!(),
            line!(),
            module_path!(),
            format_args!($($args)+),
        )
    };
}

macro_rules! fatal {
    ($($args:tt)+) => {{
        crate::log::write_log(
            crate::log::LogLevel::LogFatal,
            file!(),
            line!(),
            module_path!(),
            format_args!($($args)+),
        );
        crate::log::notifying_abort(backtrace::Backtrace::new());
    }};
}
