/*!
 * Session Registry
 *
 * Per-process table of bypass sessions keyed by descriptor, and of
 * nexuses keyed by device name. Every peer identity advertised in a
 * negotiation lock belongs to one registry.
 */

use super::device;
use super::nexus::Nexus;
use super::session::Session;
use crate::core::config::BypassConfig;
use crate::core::errors::{BypassError, BypassResult};
use crate::core::types::PeerIdentity;
use crate::ipc::lock::NegotiationLock;
use crate::ipc::shm::resource_name;
use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// First key handed to sessions that have no descriptor
const FIRST_DETACHED_KEY: RawFd = -2;

pub struct Registry {
    config: Arc<BypassConfig>,
    identity: PeerIdentity,
    sessions: DashMap<RawFd, Arc<Session>, RandomState>,
    nexuses: DashMap<String, Arc<Nexus>, RandomState>,
    next_detached: AtomicI32,
}

impl Registry {
    pub fn new(config: BypassConfig) -> Self {
        Self::with_identity(config, PeerIdentity::current())
    }

    pub fn with_identity(config: BypassConfig, identity: PeerIdentity) -> Self {
        info!(pid = identity.pid, instance = identity.instance, enabled = config.enabled, "Bypass registry created");
        Self {
            config: Arc::new(config),
            identity,
            sessions: DashMap::with_hasher(RandomState::new()),
            nexuses: DashMap::with_hasher(RandomState::new()),
            next_detached: AtomicI32::new(FIRST_DETACHED_KEY),
        }
    }

    /// Registry configured from `PIPE_BYPASS_*` environment variables
    pub fn from_env() -> BypassResult<Self> {
        Ok(Self::new(BypassConfig::from_env()?))
    }

    pub fn config(&self) -> &BypassConfig {
        &self.config
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }

    /// Session for `fd` if the descriptor is a bypass candidate
    ///
    /// Returns `None` for ineligible descriptors and whenever the lock for
    /// the device cannot be had; the caller then uses the descriptor
    /// directly.
    pub fn init(&self, fd: RawFd) -> Option<Arc<Session>> {
        if !self.config.enabled {
            return None;
        }
        if let Some(existing) = self.session(fd) {
            return Some(existing);
        }
        let device = device::classify(fd)?;
        match self.attach(&device, Some(fd)) {
            Ok(session) => Some(session),
            Err(e) => {
                debug!(fd, device = %device, error = %e, "Bypass unavailable for descriptor");
                None
            }
        }
    }

    /// Session on an explicitly named device
    ///
    /// Without a descriptor the session can only move data once a stream
    /// is established.
    pub fn attach(&self, device: &str, fd: Option<RawFd>) -> BypassResult<Arc<Session>> {
        if !self.config.enabled {
            return Err(BypassError::Config("bypass is disabled".into()));
        }
        let nexus = self.nexus_for(device)?;
        let key = match fd {
            Some(fd) => fd,
            None => self.next_detached.fetch_sub(1, Ordering::Relaxed),
        };

        let session = Arc::new(Session::new(key, fd, nexus, Arc::clone(&self.config)));
        if let Some(replaced) = self.sessions.insert(key, Arc::clone(&session)) {
            debug!(key, "Replacing stale session for descriptor");
            self.detach(&replaced);
        }
        debug!(key, device, "Session attached");
        Ok(session)
    }

    fn nexus_for(&self, device: &str) -> BypassResult<Arc<Nexus>> {
        match self.nexuses.entry(device.to_string()) {
            Entry::Occupied(entry) => {
                entry.get().acquire();
                Ok(Arc::clone(entry.get()))
            }
            Entry::Vacant(entry) => {
                let resource = resource_name(&self.config.resource_prefix, device)?;
                let lock = NegotiationLock::create(&resource, self.identity, self.config.peer_check_interval())?;
                let nexus = Arc::new(Nexus::new(device.to_string(), lock));
                entry.insert(Arc::clone(&nexus));
                Ok(nexus)
            }
        }
    }

    pub fn session(&self, fd: RawFd) -> Option<Arc<Session>> {
        self.sessions.get(&fd).map(|entry| Arc::clone(entry.value()))
    }

    pub fn nexus(&self, device: &str) -> Option<Arc<Nexus>> {
        self.nexuses.get(device).map(|entry| Arc::clone(entry.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn nexus_count(&self) -> usize {
        self.nexuses.len()
    }

    /// Close a session and release its nexus reference
    pub fn shutdown(&self, session: &Session) {
        let removed = self
            .sessions
            .remove_if(&session.key(), |_, current| std::ptr::eq(current.as_ref(), session));
        if removed.is_some() {
            self.detach(session);
        }
    }

    fn detach(&self, session: &Session) {
        if session.is_closed() {
            return;
        }
        session.close();

        let device = session.device();
        if let Some((_, nexus)) = self.nexuses.remove_if(device, |_, nexus| nexus.release() == 0) {
            nexus.teardown();
        }
    }

    /// Close every session and tear down every nexus; returns sessions closed
    pub fn shutdown_all(&self) -> usize {
        let keys: Vec<RawFd> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut count = 0;
        for key in keys {
            if let Some((_, session)) = self.sessions.remove(&key) {
                self.detach(&session);
                count += 1;
            }
        }

        let devices: Vec<String> = self.nexuses.iter().map(|entry| entry.key().clone()).collect();
        for device in devices {
            if let Some((_, nexus)) = self.nexuses.remove(&device) {
                nexus.teardown();
            }
        }
        if count > 0 {
            info!(count, "Bypass sessions shut down");
        }
        count
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("identity", &self.identity)
            .field("sessions", &self.sessions.len())
            .field("nexuses", &self.nexuses.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::fd::AsRawFd;

    fn quick_config() -> BypassConfig {
        BypassConfig {
            startup_stall_ms: 20,
            negotiation_timeout_ms: 200,
            peer_check_interval_ms: 10,
            ..Default::default()
        }
    }

    fn device(tag: &str) -> String {
        format!("REG{}{}", tag, &uuid::Uuid::new_v4().simple().to_string()[..12])
    }

    #[test]
    fn test_sessions_on_one_device_share_a_nexus() {
        let registry = Registry::new(quick_config());
        let name = device("share");
        let a = registry.attach(&name, None).unwrap();
        let b = registry.attach(&name, None).unwrap();

        assert_ne!(a.key(), b.key());
        assert!(Arc::ptr_eq(a.nexus(), b.nexus()));
        assert_eq!(a.nexus().ref_count(), 2);
        assert_eq!(registry.nexus_count(), 1);

        registry.shutdown(&a);
        assert_eq!(b.nexus().ref_count(), 1);
        assert_eq!(registry.nexus_count(), 1);

        registry.shutdown(&b);
        assert_eq!(registry.nexus_count(), 0);
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_init_rejects_regular_file() {
        let registry = Registry::new(quick_config());
        let file = tempfile::tempfile().unwrap();
        assert!(registry.init(file.as_raw_fd()).is_none());
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_init_is_idempotent_per_descriptor() {
        let registry = Registry::new(quick_config());
        let (r, _w) = nix::unistd::pipe().unwrap();
        let first = registry.init(r.as_raw_fd()).unwrap();
        let second = registry.init(r.as_raw_fd()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        registry.shutdown(&first);
    }

    #[test]
    fn test_disabled_registry_never_attaches() {
        let registry = Registry::new(BypassConfig {
            enabled: false,
            ..quick_config()
        });
        let (r, _w) = nix::unistd::pipe().unwrap();
        assert!(registry.init(r.as_raw_fd()).is_none());
        assert!(registry.attach("ANY", None).is_err());
    }

    #[test]
    fn test_invalid_device_name_is_rejected() {
        let registry = Registry::new(quick_config());
        assert!(matches!(registry.attach("bad/name", None), Err(BypassError::InvalidName(_))));
        assert!(matches!(registry.attach("___", None), Err(BypassError::InvalidName(_))));
    }

    #[test]
    fn test_shutdown_all_closes_sessions() {
        let registry = Registry::new(quick_config());
        let a = registry.attach(&device("all"), None).unwrap();
        let b = registry.attach(&device("all"), None).unwrap();
        assert_eq!(registry.shutdown_all(), 2);
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(registry.nexus_count(), 0);
    }
}
