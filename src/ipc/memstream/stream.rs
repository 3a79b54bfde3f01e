/*!
 * Memory Stream
 *
 * One end of a single-writer/single-reader byte stream over a shared block.
 * Transfers run under the header's spin-then-block lock; parking and
 * waking use futex words in the header, and any wake of the peer happens
 * after the lock is released.
 */

use super::commbuf::CommbufHeader;
use super::rundown::tracker;
use super::types::*;
use crate::core::config::BypassConfig;
use crate::core::limits::{COMMBUF_HEADER_SIZE, COMMBUF_MIN_BLOCK, DEFAULT_PEER_CHECK_INTERVAL};
use crate::core::sync::{futex_wait, process_alive, wake_process, SpinConfig, SpinPolicy};
use crate::core::types::Pid;
use crate::ipc::shm::SharedBlock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tuning applied when a stream handle is created
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub spin: SpinConfig,
    /// Parked waits wake at this interval to probe the peer
    pub peer_check_interval: Duration,
    pub attributes: StreamAttributes,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            spin: SpinConfig::default(),
            peer_check_interval: DEFAULT_PEER_CHECK_INTERVAL,
            attributes: StreamAttributes::empty(),
        }
    }
}

impl StreamOptions {
    pub fn from_config(config: &BypassConfig) -> Self {
        Self {
            spin: config.spin.clone(),
            peer_check_interval: config.peer_check_interval(),
            attributes: StreamAttributes::empty(),
        }
    }

    pub fn nonblocking(mut self, nonblocking: bool) -> Self {
        self.attributes.set(StreamAttributes::NONBLOCK, nonblocking);
        self
    }
}

/// Handle on one end of a shared ring buffer
pub struct MemStream {
    block: Arc<dyn SharedBlock>,
    role: StreamRole,
    pid: Pid,
    policy: SpinPolicy,
    segment_limit: usize,
    peer_check: Duration,
    attributes: AtomicU32,
    closed: AtomicBool,
    stats: StreamStats,
    id: u64,
}

impl MemStream {
    /// Attach to `block` as `role`, initializing the header if fresh
    pub fn create(
        block: Arc<dyn SharedBlock>,
        role: StreamRole,
        options: &StreamOptions,
    ) -> Result<Arc<Self>, StreamError> {
        let pid = std::process::id();
        if block.len() < COMMBUF_MIN_BLOCK {
            return Err(StreamError::BlockTooSmall {
                size: block.len(),
                min: COMMBUF_MIN_BLOCK,
            });
        }
        // SAFETY: SharedBlock guarantees an aligned, live region larger
        // than the header
        let header = unsafe { CommbufHeader::from_ptr(block.as_ptr()) };
        let initialized = header.init_or_attach(block.len(), role, pid)?;
        let data_limit = header.data_limit();

        let tracker = tracker();
        let stream = Arc::new(Self {
            block,
            role,
            pid,
            policy: options.spin.policy(),
            segment_limit: options.spin.segment_limit.min(data_limit / 2).max(1),
            peer_check: options.peer_check_interval,
            attributes: AtomicU32::new(options.attributes.bits()),
            closed: AtomicBool::new(false),
            stats: StreamStats::default(),
            id: tracker.next_id(),
        });
        tracker.register(&stream);

        debug!(
            role = ?role,
            sequence = header.sequence(),
            data_limit,
            initialized,
            "Memory stream attached"
        );
        Ok(stream)
    }

    #[inline]
    fn header(&self) -> &CommbufHeader {
        // SAFETY: validated in create; the block outlives self
        unsafe { CommbufHeader::from_ptr(self.block.as_ptr()) }
    }

    #[inline]
    fn data(&self) -> *mut u8 {
        // SAFETY: block length >= header + data_limit, checked in create
        unsafe { self.block.as_ptr().add(COMMBUF_HEADER_SIZE) }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.header().data_limit()
    }

    pub fn attributes(&self) -> StreamAttributes {
        StreamAttributes::from_bits_truncate(self.attributes.load(Ordering::Relaxed))
    }

    fn nonblocking(&self) -> bool {
        self.attributes().contains(StreamAttributes::NONBLOCK)
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::NotOpen);
        }
        Ok(())
    }

    /// Write all of `buf`, parking while the buffer is full
    ///
    /// Returns the count accepted. A peer that goes away part way yields the
    /// partial count, then `BrokenPipe` on the next call. In non-blocking
    /// mode a full buffer yields the partial count or `WouldBlock`.
    pub fn write(&self, buf: &[u8]) -> Result<usize, StreamError> {
        self.ensure_open()?;
        if self.role != StreamRole::Writer {
            return Err(StreamError::Aborted(self.header().state()));
        }
        StreamStats::bump(&self.stats.operations);

        let header = self.header();
        let word = header.wake_word(self.role);
        let mut written = 0;

        while written < buf.len() {
            let seen = word.load(Ordering::Acquire);
            let t = {
                let _guard = header.lock.lock(&self.policy, self.pid);
                header.put(self.data(), &buf[written..], self.segment_limit)
            };
            written += t.moved;
            if t.moved > 0 {
                StreamStats::bump(&self.stats.segments);
            }

            match t.status {
                TransferStatus::Completed => {
                    if t.enter == StreamState::Empty && t.exit == StreamState::Idle {
                        self.wake_peer();
                    }
                }
                TransferStatus::Blocked => {
                    if self.nonblocking() {
                        return if written > 0 {
                            Ok(written)
                        } else {
                            Err(StreamError::WouldBlock)
                        };
                    }
                    self.park(word, seen);
                }
                TransferStatus::Discarded => {
                    StreamStats::bump(&self.stats.errors);
                    return if written > 0 {
                        Ok(written)
                    } else {
                        Err(StreamError::BrokenPipe)
                    };
                }
                TransferStatus::Aborted => {
                    StreamStats::bump(&self.stats.errors);
                    return Err(StreamError::Aborted(t.exit));
                }
            }
        }
        Ok(written)
    }

    /// Read into `buf`, parking until at least `min_bytes` have arrived
    ///
    /// `min_bytes` is clamped to `1..=buf.len()`. When the writer is done
    /// the remaining bytes are returned first; afterwards each call yields
    /// a zero count with `expedite` set.
    pub fn read(&self, buf: &mut [u8], min_bytes: usize) -> Result<ReadOutcome, StreamError> {
        self.ensure_open()?;
        if self.role != StreamRole::Reader {
            return Err(StreamError::Aborted(self.header().state()));
        }
        if buf.is_empty() {
            return Ok(ReadOutcome::default());
        }
        StreamStats::bump(&self.stats.operations);

        let header = self.header();
        let word = header.wake_word(self.role);
        let min_bytes = min_bytes.clamp(1, buf.len());
        let mut outcome = ReadOutcome::default();

        while outcome.count < min_bytes {
            let seen = word.load(Ordering::Acquire);
            let t = {
                let _guard = header.lock.lock(&self.policy, self.pid);
                header.get(self.data(), &mut buf[outcome.count..], self.segment_limit)
            };
            outcome.count += t.moved;
            if t.moved > 0 {
                StreamStats::bump(&self.stats.segments);
            }

            match t.status {
                TransferStatus::Completed => {
                    if t.enter == StreamState::Full && t.exit == StreamState::Idle {
                        self.wake_peer();
                    }
                }
                TransferStatus::Blocked => {
                    if self.nonblocking() {
                        if outcome.count == 0 {
                            return Err(StreamError::WouldBlock);
                        }
                        break;
                    }
                    self.park(word, seen);
                }
                TransferStatus::Discarded => {
                    outcome.expedite = true;
                    break;
                }
                TransferStatus::Aborted => {
                    StreamStats::bump(&self.stats.errors);
                    return Err(StreamError::Aborted(t.exit));
                }
            }
        }
        Ok(outcome)
    }

    /// Mark this side done and wake a peer parked on it
    ///
    /// Idempotent. A reader closing after its writer leaves the buffer
    /// closed.
    pub fn close(&self) -> Result<(), StreamError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let header = self.header();
        let (enter, exit) = {
            let _guard = header.lock.lock(&self.policy, self.pid);
            header.close_side(self.role)
        };
        tracker().unregister(self.id);

        let peer_parked = match self.role {
            StreamRole::Reader => enter == StreamState::Full,
            StreamRole::Writer => enter == StreamState::Empty,
        };
        if peer_parked {
            self.wake_peer();
        }
        debug!(role = ?self.role, ?enter, ?exit, "Memory stream closed");
        Ok(())
    }

    /// Force this side half-closed at process exit
    ///
    /// Clears this side's pid so the peer treats it as gone, and always
    /// wakes the peer.
    pub(crate) fn rundown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let header = self.header();
        {
            let guard = header.lock.try_lock(self.pid);
            // A lock we cannot take promptly belongs to a peer mid-transfer
            let _guard = guard.unwrap_or_else(|| header.lock.lock(&self.policy, self.pid));
            header.set_pid(self.role, 0);
            header.close_side(self.role);
        }
        let peer = header.pid_of(self.role.peer());
        let result = wake_process(peer, header.wake_word(self.role.peer()));
        debug!(role = ?self.role, ?result, "Memory stream run down");
    }

    /// Current state with pending and free byte counts
    pub fn query(&self, arm: bool) -> StreamQuery {
        let header = self.header();
        let _guard = header.lock.lock(&self.policy, self.pid);
        let (state, pending, available) = header.query(self.role, arm);
        StreamQuery {
            state,
            pending,
            available,
        }
    }

    /// Replace the attribute set; unknown bits are rejected
    pub fn control(&self, attributes: u32) -> Result<StreamAttributes, StreamError> {
        let attrs =
            StreamAttributes::from_bits(attributes).ok_or(StreamError::InvalidAttributes(attributes))?;
        self.attributes.store(attrs.bits(), Ordering::Relaxed);
        Ok(attrs)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        let mut attrs = self.attributes();
        attrs.set(StreamAttributes::NONBLOCK, nonblocking);
        self.attributes.store(attrs.bits(), Ordering::Relaxed);
    }

    /// True once the peer has finished and nothing is left for this side
    pub fn is_peer_done(&self) -> bool {
        let header = self.header();
        let state = header.state();
        match self.role {
            StreamRole::Reader => {
                matches!(state, StreamState::WriterDone | StreamState::Closed) && header.pending() == 0
            }
            StreamRole::Writer => matches!(state, StreamState::ReaderDone | StreamState::Closed),
        }
    }

    pub fn state(&self) -> StreamState {
        self.header().state()
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// Park on `word` until it moves past `seen` or a probe slice elapses
    fn park(&self, word: &AtomicU32, seen: u32) {
        StreamStats::bump(&self.stats.waits);
        let _ = futex_wait(word, seen, Some(self.peer_check));

        if word.load(Ordering::Acquire) == seen {
            let peer = self.header().pid_of(self.role.peer());
            if peer != 0 && !process_alive(peer) {
                self.peer_gone(peer);
            }
        }
    }

    fn wake_peer(&self) {
        StreamStats::bump(&self.stats.signals);
        let header = self.header();
        let peer = header.pid_of(self.role.peer());
        if wake_process(peer, header.wake_word(self.role.peer())).is_peer_gone() {
            self.peer_gone(peer);
        }
    }

    fn peer_gone(&self, peer: Pid) {
        warn!(role = ?self.role, peer, "Stream peer process has gone");
        let header = self.header();
        let _guard = header.lock.lock(&self.policy, self.pid);
        header.mark_peer_gone(self.role);
    }

    #[cfg(test)]
    pub(crate) fn header_for_test(&self) -> &CommbufHeader {
        self.header()
    }
}

impl Drop for MemStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close memory stream");
        }
    }
}

impl std::fmt::Debug for MemStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStream")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
