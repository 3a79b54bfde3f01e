/*!
 * Cross-Process Futex
 *
 * Wait/wake on 32-bit words that live in shared memory. The futex calls are
 * issued without FUTEX_PRIVATE_FLAG so waiters in other processes mapping
 * the same object are reached.
 *
 * # Design
 *
 * Every wake word is a sequence counter. A waiter loads the counter before
 * checking its condition and then sleeps only while the counter still holds
 * that value, so a wake issued in between is never lost. Platforms without
 * futexes sleep for a bounded slice instead and rely on the caller's
 * re-check loop.
 */

use super::traits::WakeResult;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Sleep slice used where no futex is available
#[cfg(not(target_os = "linux"))]
const FALLBACK_SLICE: Duration = Duration::from_millis(1);

/// Block while `*word == expected`, until woken or `timeout` expires
///
/// Returns `Ok(true)` when woken, `Ok(false)` on timeout, value mismatch or
/// interruption. Callers always re-check their condition.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> std::io::Result<bool> {
    let timespec = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let timespec_ptr = match &timespec {
        Some(ts) => ts as *const libc::timespec,
        None => std::ptr::null(),
    };

    let result = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            timespec_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if result == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::ETIMEDOUT) | Some(libc::EINTR) => Ok(false),
        _ => Err(err),
    }
}

/// Wake up to `count` waiters blocked on `word`
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, count: u32) -> std::io::Result<u32> {
    let result = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if result >= 0 {
        Ok(result as u32)
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> std::io::Result<bool> {
    if word.load(Ordering::Acquire) != expected {
        return Ok(false);
    }
    std::thread::sleep(timeout.map_or(FALLBACK_SLICE, |t| t.min(FALLBACK_SLICE)));
    Ok(false)
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32, _count: u32) -> std::io::Result<u32> {
    Ok(0)
}

/// Bump the sequence in `word` and wake every waiter
pub fn futex_signal(word: &AtomicU32) -> WakeResult {
    word.fetch_add(1, Ordering::Release);
    match futex_wake(word, u32::MAX) {
        Ok(0) | Err(_) => WakeResult::NoWaiters,
        Ok(n) => WakeResult::Woken(n as usize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_value_mismatch_returns() {
        let word = AtomicU32::new(7);
        let start = Instant::now();
        let woken = futex_wait(&word, 0, Some(Duration::from_secs(5))).unwrap();
        assert!(!woken);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let woken = futex_wait(&word, 0, Some(Duration::from_millis(30))).unwrap();
        assert!(!woken);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_signal_bumps_sequence() {
        let word = AtomicU32::new(3);
        assert_eq!(futex_signal(&word), WakeResult::NoWaiters);
        assert_eq!(word.load(Ordering::Acquire), 4);
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = word.clone();
            thread::spawn(move || {
                let seen = word.load(Ordering::Acquire);
                let deadline = Instant::now() + Duration::from_secs(5);
                while word.load(Ordering::Acquire) == seen && Instant::now() < deadline {
                    futex_wait(&word, seen, Some(Duration::from_millis(100))).unwrap();
                }
                word.load(Ordering::Acquire) != seen
            })
        };

        thread::sleep(Duration::from_millis(50));
        futex_signal(&word);
        assert!(waiter.join().unwrap());
    }
}
