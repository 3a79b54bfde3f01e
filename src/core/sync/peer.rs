/*!
 * Peer Liveness
 *
 * Probes and wakes for the process on the other end of a shared object.
 * A probe sends signal 0; `ESRCH` means the process is gone. `EPERM`
 * still proves existence.
 */

use super::futex::futex_signal;
use super::traits::WakeResult;
use crate::core::types::Pid;
use std::sync::atomic::AtomicU32;

/// Check whether `pid` names a live process
#[cfg(unix)]
pub fn process_alive(pid: Pid) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid as NixPid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(NixPid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_alive(pid: Pid) -> bool {
    pid != 0
}

/// Wake `pid` parked on `word`
///
/// A zero pid means no peer has attached yet; the word is still bumped so a
/// late arrival never sleeps on a stale sequence.
pub fn wake_process(pid: Pid, word: &AtomicU32) -> WakeResult {
    let result = futex_signal(word);
    if pid != 0 && !process_alive(pid) {
        return WakeResult::PeerGone;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_zero_pid_is_not_alive() {
        assert!(!process_alive(0));
    }

    #[test]
    fn test_reaped_child_is_gone() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!process_alive(pid));

        let word = AtomicU32::new(0);
        assert_eq!(wake_process(pid, &word), WakeResult::PeerGone);
    }
}
