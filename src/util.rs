use crate::error::{Result, RetraceError};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Where traces live unless the user says otherwise:
/// $RETRACE_TRACE_DIR, else $HOME/.local/share/retrace, else /tmp/retrace.
pub fn default_trace_base() -> PathBuf {
    if let Some(dir) = env::var_os("RETRACE_TRACE_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".local/share/retrace");
    }
    PathBuf::from("/tmp/retrace")
}

/// A fresh directory name for a new recording of `exe`.
pub fn new_trace_dir(base: &Path, exe: &Path) -> PathBuf {
    let name = exe
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "trace".to_owned());
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    base.join(format!("{}-{}-{}", name, std::process::id(), stamp))
}

pub fn latest_trace_link(base: &Path) -> PathBuf {
    base.join("latest-trace")
}

/// Point `latest-trace` at a finished recording.
pub fn update_latest_trace_link(base: &Path, trace_dir: &Path) {
    let link = latest_trace_link(base);
    let _ = fs::remove_file(&link);
    if let Err(e) = std::os::unix::fs::symlink(trace_dir, &link) {
        log!(
            crate::log::LogWarn,
            "Could not update {:?}: {:?}",
            link,
            e
        );
    }
}

/// The trace dir named on the command line, or the most recent recording.
pub fn resolve_trace_dir(maybe_dir: Option<PathBuf>) -> Result<PathBuf> {
    match maybe_dir {
        Some(dir) => Ok(dir),
        None => {
            let link = latest_trace_link(&default_trace_base());
            fs::read_link(&link).map_err(|_| {
                RetraceError::Usage(format!(
                    "no trace directory given and `{}' does not exist",
                    link.display()
                ))
            })
        }
    }
}

/// Pin tracees (and us) to CPU 0, both in recording and replay. A tracee
/// can observe which core it runs on, so letting the host migrate it
/// between record and replay can cause divergence.
pub fn bind_to_cpu0() -> Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;
    let mut mask = CpuSet::new();
    mask.set(0)?;
    sched_setaffinity(Pid::from_raw(0), &mask)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_trace_dir_uses_exe_basename() {
        let dir = new_trace_dir(Path::new("/base"), Path::new("/usr/bin/ls"));
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("ls-"));
        assert!(dir.starts_with("/base"));
    }

    #[test]
    fn page_size_is_a_power_of_two() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert_eq!(0, ps & (ps - 1));
    }
}
