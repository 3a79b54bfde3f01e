/*!
 * Negotiation Lock Resource
 *
 * A small named shared object per device that carries the value block.
 * Exclusive mode is an `flock(LOCK_EX)` on the object; dropping back to
 * concurrent mode writes the decoded value block back and unlocks. Each
 * slot has a futex word in the object header so a parked peer can be woken
 * after its slot changes.
 */

use super::types::{LockError, LockMode};
use super::valblk::{Slot, SlotFlags, ValueBlock};
use crate::core::limits::{LOCK_MAGIC, VALBLK_SIZE, VALBLK_SLOTS};
use crate::core::sync::{futex_signal, futex_wait, process_alive};
use crate::core::types::PeerIdentity;
use crate::ipc::shm::{SharedBlock, SharedSegment};
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const LOCK_VERSION: u32 = 1;
const VALUE_OFFSET: usize = 16;
const LOCK_OBJECT_SIZE: usize = VALUE_OFFSET + VALBLK_SIZE;

#[repr(C)]
struct LockHeader {
    magic: AtomicU32,
    version: AtomicU32,
    wake: [AtomicU32; VALBLK_SLOTS],
}

const _: () = assert!(std::mem::size_of::<LockHeader>() == VALUE_OFFSET);

enum Hold {
    Released(File),
    Exclusive(Flock<File>),
}

/// One process's claim on a device's negotiation lock
pub struct NegotiationLock {
    resource: String,
    identity: PeerIdentity,
    segment: SharedSegment,
    hold: Option<Hold>,
    mode: LockMode,
    slot: usize,
    value: ValueBlock,
    pending_wake: bool,
    poll: Duration,
}

impl NegotiationLock {
    /// Open or create the lock and claim a slot
    ///
    /// A slot already carrying `identity` is reused; otherwise the first
    /// empty slot wins, then a slot whose owner died, then one whose owner
    /// shut down. Returns in concurrent mode with the claim written back.
    pub fn create(resource: &str, identity: PeerIdentity, poll: Duration) -> Result<Self, LockError> {
        let segment = SharedSegment::create_or_map(resource, LOCK_OBJECT_SIZE)?;
        let file = segment.file().try_clone().map_err(|e| LockError::Flock {
            resource: resource.to_string(),
            source: nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)),
        })?;

        let mut lock = Self {
            resource: resource.to_string(),
            identity,
            segment,
            hold: Some(Hold::Released(file)),
            mode: LockMode::Null,
            slot: 0,
            value: ValueBlock::default(),
            pending_wake: false,
            poll,
        };

        lock.raise()?;
        if let Err(e) = lock.init_header().and_then(|_| lock.claim_slot()) {
            let _ = lock.lower();
            return Err(e);
        }
        lock.wake_peer_if_waiting();
        lock.lower()?;

        debug!(resource, slot = lock.slot, pid = identity.pid, "Negotiation lock claimed");
        Ok(lock)
    }

    fn header(&self) -> &LockHeader {
        // SAFETY: the mapping is at least LOCK_OBJECT_SIZE bytes and page aligned
        unsafe { &*(self.segment.as_ptr() as *const LockHeader) }
    }

    fn init_header(&mut self) -> Result<(), LockError> {
        let header = self.header();
        match header.magic.load(Ordering::Acquire) {
            0 => {
                header.version.store(LOCK_VERSION, Ordering::Relaxed);
                header.magic.store(LOCK_MAGIC, Ordering::Release);
                self.value = ValueBlock::default();
                Ok(())
            }
            LOCK_MAGIC if header.version.load(Ordering::Relaxed) == LOCK_VERSION => Ok(()),
            _ => Err(LockError::Corrupt(self.resource.clone())),
        }
    }

    fn claim_slot(&mut self) -> Result<(), LockError> {
        let me = self.identity;
        let slots = self.value.slots;
        let index = (0..VALBLK_SLOTS)
            .find(|&i| slots[i].owned_by(me))
            .or_else(|| (0..VALBLK_SLOTS).find(|&i| slots[i].is_empty()))
            .or_else(|| (0..VALBLK_SLOTS).find(|&i| !process_alive(slots[i].pid)))
            .or_else(|| (0..VALBLK_SLOTS).find(|&i| slots[i].is_shutdown()))
            .ok_or_else(|| LockError::NoFreeSlot(self.resource.clone()))?;

        self.slot = index;
        self.value.slots[index] = Slot::claimed_by(me);
        Ok(())
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn slot_index(&self) -> usize {
        self.slot
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }

    /// Take the exclusive hold and load a fresh value block
    pub fn raise(&mut self) -> Result<(), LockError> {
        match self.hold.take() {
            Some(Hold::Released(file)) => match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(locked) => {
                    self.hold = Some(Hold::Exclusive(locked));
                    self.mode = LockMode::ProtectedWrite;
                    self.load_value();
                    Ok(())
                }
                Err((file, source)) => {
                    self.hold = Some(Hold::Released(file));
                    Err(LockError::Flock {
                        resource: self.resource.clone(),
                        source,
                    })
                }
            },
            Some(held @ Hold::Exclusive(_)) => {
                self.hold = Some(held);
                Ok(())
            }
            None => Err(LockError::Released(self.resource.clone())),
        }
    }

    /// Write the value block back, drop to concurrent mode, then deliver
    /// any wake queued while exclusive
    pub fn lower(&mut self) -> Result<(), LockError> {
        match self.hold.take() {
            Some(Hold::Exclusive(locked)) => {
                self.store_value();
                match locked.unlock() {
                    Ok(file) => self.hold = Some(Hold::Released(file)),
                    Err((locked, source)) => {
                        self.hold = Some(Hold::Exclusive(locked));
                        return Err(LockError::Flock {
                            resource: self.resource.clone(),
                            source,
                        });
                    }
                }
                self.mode = LockMode::Concurrent;
                if std::mem::take(&mut self.pending_wake) {
                    futex_signal(&self.header().wake[ValueBlock::other(self.slot)]);
                }
                Ok(())
            }
            Some(released @ Hold::Released(_)) => {
                self.hold = Some(released);
                Ok(())
            }
            None => Err(LockError::Released(self.resource.clone())),
        }
    }

    fn ensure_exclusive(&self) -> Result<(), LockError> {
        if self.mode != LockMode::ProtectedWrite {
            return Err(LockError::NotHeld(self.resource.clone()));
        }
        Ok(())
    }

    fn load_value(&mut self) {
        let mut raw = [0u8; VALBLK_SIZE];
        // SAFETY: in bounds of the mapping; writers are excluded by the flock
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.segment.as_ptr().add(VALUE_OFFSET),
                raw.as_mut_ptr(),
                VALBLK_SIZE,
            )
        };
        self.value = ValueBlock::decode(&raw);
    }

    fn store_value(&self) {
        let raw = self.value.encode();
        // SAFETY: as in load_value
        unsafe {
            std::ptr::copy_nonoverlapping(
                raw.as_ptr(),
                self.segment.as_ptr().add(VALUE_OFFSET),
                VALBLK_SIZE,
            )
        };
    }

    /// Snapshot of the value block as of the last exclusive hold
    pub fn value(&self) -> &ValueBlock {
        &self.value
    }

    pub fn mine(&self) -> &Slot {
        &self.value.slots[self.slot]
    }

    pub fn mine_mut(&mut self) -> &mut Slot {
        &mut self.value.slots[self.slot]
    }

    pub fn peer(&self) -> &Slot {
        &self.value.slots[ValueBlock::other(self.slot)]
    }

    pub fn peer_mut(&mut self) -> &mut Slot {
        &mut self.value.slots[ValueBlock::other(self.slot)]
    }

    /// True if the other slot holds a live process other than us
    ///
    /// A slot left by a dead process is cleared.
    pub fn peer_present(&mut self) -> bool {
        let peer = *self.peer();
        if peer.is_empty() || peer.owned_by(self.identity) {
            return false;
        }
        if !process_alive(peer.pid) {
            debug!(resource = %self.resource, pid = peer.pid, "Clearing slot of dead peer");
            *self.peer_mut() = Slot::default();
            return false;
        }
        true
    }

    /// Queue a wake for a peer that asked for one
    ///
    /// The wake is delivered by the next `lower`, after the value block is
    /// visible.
    pub fn wake_peer_if_waiting(&mut self) {
        let peer = self.peer_mut();
        if !peer.is_empty() && peer.flags.contains(SlotFlags::WAKE_REQUEST) {
            peer.flags.remove(SlotFlags::WAKE_REQUEST);
            self.pending_wake = true;
        }
    }

    /// Park until the peer clears our wake request or `timeout` elapses
    ///
    /// Also returns early if the peer goes away or shuts down. Must be
    /// called exclusive; returns exclusive. Returns false on timeout.
    pub fn wait_for_peer(&mut self, timeout: Duration) -> Result<bool, LockError> {
        self.park_until(timeout, |lock| {
            !lock.mine().flags.contains(SlotFlags::WAKE_REQUEST)
                || !lock.peer_present()
                || lock.peer().is_shutdown()
        })
    }

    /// Park until a peer claims the other slot or `timeout` elapses
    ///
    /// Must be called exclusive; returns exclusive. Returns true if a peer
    /// is present.
    pub fn stall_for_peer(&mut self, timeout: Duration) -> Result<bool, LockError> {
        if self.peer_present() {
            return Ok(true);
        }
        self.park_until(timeout, |lock| lock.peer_present())
    }

    fn park_until<F>(&mut self, timeout: Duration, mut done: F) -> Result<bool, LockError>
    where
        F: FnMut(&mut Self) -> bool,
    {
        self.ensure_exclusive()?;
        self.mine_mut().flags.insert(SlotFlags::WAKE_REQUEST);
        let deadline = Instant::now() + timeout;

        let satisfied = loop {
            let seen = self.header().wake[self.slot].load(Ordering::Acquire);
            self.lower()?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                let _ = futex_wait(&self.header().wake[self.slot], seen, Some(remaining.min(self.poll)));
            }

            self.raise()?;
            if done(self) {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
        };

        self.mine_mut().flags.remove(SlotFlags::WAKE_REQUEST);
        Ok(satisfied)
    }

    /// Mark our slot shut down, wake the peer and give up the lock
    ///
    /// The resource name is removed when no live peer remains.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.hold.is_none() {
            return Ok(());
        }
        self.raise()?;

        let mine = self.mine_mut();
        mine.flags.insert(SlotFlags::SHUTDOWN);
        mine.flags.remove(SlotFlags::CONNECT_REQUEST | SlotFlags::WAKE_REQUEST);
        self.wake_peer_if_waiting();

        let last = !self.peer_present();
        if last {
            SharedSegment::remove(&self.resource)?;
        }
        self.lower()?;
        self.hold = None;
        self.mode = LockMode::Null;
        debug!(resource = %self.resource, last, "Negotiation lock released");
        Ok(())
    }
}

impl Drop for NegotiationLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(resource = %self.resource, error = %e, "Failed to release negotiation lock");
        }
    }
}

impl std::fmt::Debug for NegotiationLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationLock")
            .field("resource", &self.resource)
            .field("mode", &self.mode)
            .field("slot", &self.slot)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn resource(tag: &str) -> String {
        format!("PBTEST_{}_{}", tag, uuid::Uuid::new_v4().simple())
    }

    fn identity(instance: u32) -> PeerIdentity {
        PeerIdentity::new(std::process::id(), instance)
    }

    #[test]
    fn test_two_peers_claim_distinct_slots() {
        let name = resource("claim");
        let a = NegotiationLock::create(&name, identity(1), Duration::from_millis(10)).unwrap();
        let mut b = NegotiationLock::create(&name, identity(2), Duration::from_millis(10)).unwrap();

        assert_eq!(a.mode(), LockMode::Concurrent);
        assert_ne!(a.slot_index(), b.slot_index());

        b.raise().unwrap();
        assert!(b.peer_present());
        assert_eq!(b.peer().instance, 1);
        b.lower().unwrap();
    }

    #[test]
    fn test_third_live_peer_is_refused() {
        let name = resource("third");
        let _a = NegotiationLock::create(&name, identity(1), Duration::from_millis(10)).unwrap();
        let _b = NegotiationLock::create(&name, identity(2), Duration::from_millis(10)).unwrap();
        let c = NegotiationLock::create(&name, identity(3), Duration::from_millis(10));
        assert!(matches!(c, Err(LockError::NoFreeSlot(_))));
    }

    #[test]
    fn test_release_marks_shutdown_and_frees_for_reuse() {
        let name = resource("release");
        let a = NegotiationLock::create(&name, identity(1), Duration::from_millis(10)).unwrap();
        let mut b = NegotiationLock::create(&name, identity(2), Duration::from_millis(10)).unwrap();
        drop(a);

        b.raise().unwrap();
        assert!(b.peer().is_shutdown());
        b.lower().unwrap();

        // The departed slot can be reclaimed
        let c = NegotiationLock::create(&name, identity(3), Duration::from_millis(10)).unwrap();
        assert_ne!(c.slot_index(), b.slot_index());
    }

    #[test]
    fn test_stall_times_out_without_peer() {
        let name = resource("stall");
        let mut a = NegotiationLock::create(&name, identity(1), Duration::from_millis(10)).unwrap();
        a.raise().unwrap();
        let start = Instant::now();
        assert!(!a.stall_for_peer(Duration::from_millis(60)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!a.mine().flags.contains(SlotFlags::WAKE_REQUEST));
        a.lower().unwrap();
    }

    #[test]
    fn test_stall_ends_when_peer_claims() {
        let name = resource("arrive");
        let mut a = NegotiationLock::create(&name, identity(1), Duration::from_millis(500)).unwrap();

        let late = {
            let name = name.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                NegotiationLock::create(&name, identity(2), Duration::from_millis(10)).unwrap()
            })
        };

        a.raise().unwrap();
        let start = Instant::now();
        assert!(a.stall_for_peer(Duration::from_secs(5)).unwrap());
        assert!(start.elapsed() < Duration::from_secs(2));
        a.lower().unwrap();
        drop(late.join().unwrap());
    }
}
