/*!
 * Collaborator Interface
 *
 * Free functions over a process-wide registry, shaped for an I/O
 * interception layer: init a descriptor, stall per direction, then read
 * and write through the returned handle.
 */

use crate::bypass::{Registry, Session, SessionStats, StallFlags};
use crate::core::config::BypassConfig;
use crate::core::errors::{BypassError, BypassResult};
use crate::core::types::{Direction, Pid};
use crate::ipc::memstream::{rundown_all, MemStream, ReadOutcome};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Handle returned by `bypass_init`
pub type BypassHandle = Arc<Session>;

static REGISTRY: OnceLock<Arc<Registry>> = OnceLock::new();

/// The process-wide registry, configured from the environment on first use
pub fn registry() -> &'static Arc<Registry> {
    REGISTRY.get_or_init(|| {
        let config = BypassConfig::from_env().unwrap_or_else(|e| {
            warn!(error = %e, "Invalid bypass configuration, using defaults");
            BypassConfig::default()
        });
        Arc::new(Registry::new(config))
    })
}

/// Handle and initial flags for `fd`; no handle means use the descriptor
/// directly
pub fn bypass_init(fd: RawFd) -> (Option<BypassHandle>, StallFlags) {
    match registry().init(fd) {
        Some(handle) => (Some(handle), StallFlags::STARTING),
        None => (None, StallFlags::empty()),
    }
}

/// Run the startup stall for `op` ("r" or "w")
pub fn bypass_startup_stall(
    flags: StallFlags,
    handle: &Session,
    op: &str,
    native_flags: i32,
) -> BypassResult<StallFlags> {
    let direction = Direction::from_op(op).ok_or_else(|| BypassError::InvalidOperation(op.to_string()))?;
    Ok(handle.startup_stall(flags, direction, native_flags))
}

pub fn bypass_read(handle: &Session, buf: &mut [u8], min_bytes: usize) -> BypassResult<ReadOutcome> {
    handle.read(buf, min_bytes)
}

pub fn bypass_write(handle: &Session, buf: &[u8]) -> BypassResult<usize> {
    handle.write(buf)
}

pub fn bypass_shutdown(handle: &Session) {
    registry().shutdown(handle);
}

pub fn bypass_current_streams(handle: &Session) -> (Option<Arc<MemStream>>, Option<Arc<MemStream>>) {
    handle.current_streams()
}

pub fn bypass_statistics(handle: &Session) -> SessionStats {
    handle.statistics()
}

pub fn bypass_stderr_propagate() -> BypassResult<PathBuf> {
    crate::bypass::stderr::propagate()
}

pub fn bypass_stderr_recover(parent: Pid) -> BypassResult<bool> {
    crate::bypass::stderr::recover_once(parent)
}

/// Close every session of the process-wide registry and run down every
/// stream still open in this process; returns streams run down
pub fn shutdown_all() -> usize {
    if let Some(registry) = REGISTRY.get() {
        registry.shutdown_all();
    }
    rundown_all()
}

/// Calls `shutdown_all` when dropped
///
/// Hold one in `main` so peers are never left parked on this process.
#[derive(Debug, Default)]
#[must_use = "the rundown runs when the guard is dropped"]
pub struct RundownGuard;

impl RundownGuard {
    pub fn new() -> Self {
        Self
    }
}

impl Drop for RundownGuard {
    fn drop(&mut self) {
        shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_file_gets_no_handle() {
        let file = tempfile::tempfile().unwrap();
        let (handle, flags) = bypass_init(std::os::fd::AsRawFd::as_raw_fd(&file));
        assert!(handle.is_none());
        assert!(flags.is_empty());
    }

    #[test]
    fn test_unknown_stall_operation_is_rejected() {
        let (r, _w) = nix::unistd::pipe().unwrap();
        let (handle, flags) = bypass_init(std::os::fd::AsRawFd::as_raw_fd(&r));
        let handle = handle.unwrap();
        assert!(matches!(
            bypass_startup_stall(flags, &handle, "rw", 0),
            Err(BypassError::InvalidOperation(_))
        ));
        bypass_shutdown(&handle);
    }
}
