/*!
 * Nexus
 *
 * Per-device state shared by every session of a registry that refers to
 * the same pipe: the negotiation lock and at most one stream per
 * direction. Sessions hold references; the registry tears the nexus down
 * when the last one is released.
 */

use super::negotiate;
use super::types::{FallbackReason, Verdict};
use crate::core::config::BypassConfig;
use crate::core::types::{Direction, StreamId};
use crate::ipc::lock::NegotiationLock;
use crate::ipc::memstream::MemStream;
use crate::monitoring::span_negotiation;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) struct NexusInner {
    pub lock: Option<NegotiationLock>,
    pub rstream: Option<Arc<MemStream>>,
    pub wstream: Option<Arc<MemStream>>,
}

impl NexusInner {
    pub fn stream(&self, direction: Direction) -> Option<&Arc<MemStream>> {
        match direction {
            Direction::Read => self.rstream.as_ref(),
            Direction::Write => self.wstream.as_ref(),
        }
    }

    pub fn stream_slot(&mut self, direction: Direction) -> &mut Option<Arc<MemStream>> {
        match direction {
            Direction::Read => &mut self.rstream,
            Direction::Write => &mut self.wstream,
        }
    }
}

pub struct Nexus {
    device: String,
    resource: String,
    refs: AtomicUsize,
    inner: Mutex<NexusInner>,
}

impl Nexus {
    pub(crate) fn new(device: String, lock: NegotiationLock) -> Self {
        let resource = lock.resource().to_string();
        Self {
            device,
            resource,
            refs: AtomicUsize::new(1),
            inner: Mutex::new(NexusInner {
                lock: Some(lock),
                rstream: None,
                wstream: None,
            }),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; returns the count left
    pub(crate) fn release(&self) -> usize {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        prev.saturating_sub(1)
    }

    /// Stream established for `direction`, if any
    pub fn stream(&self, direction: Direction) -> Option<Arc<MemStream>> {
        self.inner.lock().stream(direction).cloned()
    }

    /// Stream id in our slot as of the last negotiation
    pub fn stream_id(&self) -> Option<StreamId> {
        self.inner.lock().lock.as_ref().map(|lock| lock.mine().stream_id)
    }

    /// True once our slot records a shutdown or the lock is gone
    pub fn is_shut_down(&self) -> bool {
        self.inner
            .lock()
            .lock
            .as_ref()
            .map_or(true, |lock| lock.mine().is_shutdown())
    }

    /// Run the startup stall for one direction
    ///
    /// A stream another session already established is adopted. Anything
    /// short of an established stream becomes a fallback verdict.
    pub fn stall(&self, direction: Direction, config: &BypassConfig) -> Verdict {
        let span = span_negotiation(&self.resource, direction);
        let _entered = span.enter();

        let mut inner = self.inner.lock();
        if let Some(stream) = inner.stream(direction) {
            debug!(device = %self.device, %direction, "Adopting established stream");
            return Verdict::Established(Arc::clone(stream));
        }

        let verdict = match negotiate::stall(&mut inner, direction, config) {
            Ok(verdict) => verdict,
            Err(e) => {
                debug!(device = %self.device, %direction, error = %e, "Negotiation failed");
                Verdict::Fallback(FallbackReason::Failed)
            }
        };

        match &verdict {
            Verdict::Established(stream) => {
                *inner.stream_slot(direction) = Some(Arc::clone(stream));
                if let Some(lock) = inner.lock.as_ref() {
                    span.record_stream_id(lock.mine().stream_id);
                }
                info!(
                    device = %self.device,
                    %direction,
                    capacity = stream.capacity(),
                    "Bypass stream established"
                );
            }
            Verdict::Fallback(reason) => {
                debug!(device = %self.device, %direction, ?reason, "Using native path");
            }
        }
        span.record_verdict(&verdict);
        verdict
    }

    /// Close both streams and release the lock
    pub(crate) fn teardown(&self) {
        let mut inner = self.inner.lock();
        for stream in [inner.rstream.take(), inner.wstream.take()].into_iter().flatten() {
            if let Err(e) = stream.close() {
                warn!(device = %self.device, error = %e, "Failed to close bypass stream");
            }
        }
        if let Some(mut lock) = inner.lock.take() {
            if let Err(e) = lock.release() {
                warn!(device = %self.device, error = %e, "Failed to release negotiation lock");
            }
        }
        debug!(device = %self.device, "Nexus torn down");
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        if self.inner.get_mut().lock.is_some() {
            self.teardown();
        }
    }
}

impl std::fmt::Debug for Nexus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nexus")
            .field("device", &self.device)
            .field("resource", &self.resource)
            .field("refs", &self.ref_count())
            .finish()
    }
}
