/*!
 * Stderr Side Channel
 *
 * A parent whose children write into bypass pipes publishes the path of
 * its own stderr in `PIPE_BYPASS_STDERR_<pid>`. A child whose fd 2 was
 * redirected into a pipe reopens that path on its first stderr write so
 * diagnostics still reach a terminal or log.
 */

use crate::core::errors::BypassResult;
use crate::core::limits::STDERR_CHANNEL_PREFIX;
use crate::core::types::Pid;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const STDERR_FD: i32 = 2;

static RECOVERED: AtomicBool = AtomicBool::new(false);

/// Environment variable naming `pid`'s stderr
pub fn channel_var(pid: Pid) -> String {
    format!("{}{:08X}", STDERR_CHANNEL_PREFIX, pid)
}

/// Publish this process's stderr path for children spawned after the call
pub fn propagate() -> BypassResult<PathBuf> {
    let pid = std::process::id();
    let path = std::fs::read_link("/proc/self/fd/2")
        .ok()
        .filter(|p| p.is_absolute() && p.exists())
        .unwrap_or_else(|| PathBuf::from(format!("/proc/{}/fd/2", pid)));

    std::env::set_var(channel_var(pid), &path);
    debug!(path = %path.display(), "Stderr path published");
    Ok(path)
}

/// Redirect fd 2 to the stderr published by `parent`
///
/// Only the first call in a process does anything. Returns true if fd 2
/// was redirected.
pub fn recover_once(parent: Pid) -> BypassResult<bool> {
    if RECOVERED.swap(true, Ordering::AcqRel) {
        return Ok(false);
    }
    let Ok(path) = std::env::var(channel_var(parent)) else {
        return Ok(false);
    };

    let target = OpenOptions::new().append(true).open(&path)?;
    nix::unistd::dup2(target.as_raw_fd(), STDERR_FD).map_err(std::io::Error::from)?;
    info!(parent, path = %path, "Stderr recovered from parent");
    Ok(true)
}

/// Parent of the calling process
pub fn parent_pid() -> Pid {
    nix::unistd::getppid().as_raw() as Pid
}
