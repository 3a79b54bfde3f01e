/*!
 * Shared Spin-Then-Block Lock
 *
 * A two-word mutex that lives inside shared memory and excludes threads of
 * any process mapping it. Acquire spins briefly, then parks on a futex.
 * A lock whose recorded owner has died is taken over.
 */

use crate::core::sync::config::SpinPolicy;
use crate::core::sync::futex::{futex_wait, futex_wake};
use crate::core::sync::peer::process_alive;
use crate::core::types::Pid;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Lock words embedded in a shared header
#[repr(C)]
#[derive(Debug)]
pub struct SharedLock {
    state: AtomicU32,
    owner: AtomicU32,
}

impl SharedLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            owner: AtomicU32::new(0),
        }
    }

    /// Force the lock open; only valid while no other party can hold it
    pub fn reset(&self) {
        self.owner.store(0, Ordering::Relaxed);
        self.state.store(UNLOCKED, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Pid recorded by the current holder, zero when free
    #[inline]
    pub fn owner(&self) -> Pid {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn try_lock(&self, pid: Pid) -> Option<SharedLockGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| self.guard(pid))
    }

    /// Acquire, spinning up to `policy.spin_limit` times before blocking
    pub fn lock(&self, policy: &SpinPolicy, pid: Pid) -> SharedLockGuard<'_> {
        for _ in 0..policy.spin_limit {
            if let Some(guard) = self.try_lock(pid) {
                return guard;
            }
            std::hint::spin_loop();
        }

        let mut previous = self.state.swap(CONTENDED, Ordering::Acquire);
        while previous != UNLOCKED {
            let _ = futex_wait(&self.state, CONTENDED, Some(policy.stall));

            let owner = self.owner.load(Ordering::Relaxed);
            if owner != 0 && owner != pid && !process_alive(owner) {
                warn!(owner, "Shared lock owner died, taking over");
                self.owner.store(0, Ordering::Relaxed);
                self.state.store(UNLOCKED, Ordering::Release);
            }
            previous = self.state.swap(CONTENDED, Ordering::Acquire);
        }
        self.guard(pid)
    }

    fn guard(&self, pid: Pid) -> SharedLockGuard<'_> {
        self.owner.store(pid, Ordering::Relaxed);
        SharedLockGuard { lock: self }
    }

    fn unlock(&self) {
        self.owner.store(0, Ordering::Relaxed);
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            let _ = futex_wake(&self.state, 1);
        }
    }
}

impl Default for SharedLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII holder of a `SharedLock`
#[must_use = "the lock is released when the guard is dropped"]
pub struct SharedLockGuard<'a> {
    lock: &'a SharedLock,
}

impl Drop for SharedLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
