/*!
 * Bypass Session
 *
 * Per-descriptor handle. Each direction moves from unclassified through
 * negotiation to either an established stream or the native path, and
 * stays there. Native I/O goes straight to the descriptor, so switching
 * paths never drops buffered bytes.
 */

use super::alternate::AlternateReader;
use super::device::borrow_fd;
use super::nexus::Nexus;
use super::stderr;
use super::types::{NegotiationState, SessionStats, StallFlags, Verdict};
use crate::core::config::BypassConfig;
use crate::core::errors::{BypassError, BypassResult};
use crate::core::limits::BYPASS_SCRATCH_SIZE;
use crate::core::types::Direction;
use crate::ipc::memstream::{MemStream, ReadOutcome};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const STDERR_FD: RawFd = 2;

pub struct Session {
    key: RawFd,
    fd: Option<RawFd>,
    nexus: Arc<Nexus>,
    config: Arc<BypassConfig>,
    read_state: Mutex<NegotiationState>,
    write_state: Mutex<NegotiationState>,
    rstream: ArcSwapOption<MemStream>,
    wstream: ArcSwapOption<MemStream>,
    alternate: Mutex<Option<AlternateReader>>,
    scratch: Mutex<Vec<u8>>,
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    stderr_checked: AtomicBool,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(key: RawFd, fd: Option<RawFd>, nexus: Arc<Nexus>, config: Arc<BypassConfig>) -> Self {
        Self {
            key,
            fd,
            nexus,
            config,
            read_state: Mutex::new(NegotiationState::Eligible),
            write_state: Mutex::new(NegotiationState::Eligible),
            rstream: ArcSwapOption::empty(),
            wstream: ArcSwapOption::empty(),
            alternate: Mutex::new(None),
            scratch: Mutex::new(Vec::with_capacity(BYPASS_SCRATCH_SIZE)),
            read_ops: AtomicU64::new(0),
            write_ops: AtomicU64::new(0),
            stderr_checked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Registry key: the descriptor, or a negative tag for name-only sessions
    pub fn key(&self) -> RawFd {
        self.key
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn device(&self) -> &str {
        self.nexus.device()
    }

    pub fn nexus(&self) -> &Arc<Nexus> {
        &self.nexus
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn state_cell(&self, direction: Direction) -> &Mutex<NegotiationState> {
        match direction {
            Direction::Read => &self.read_state,
            Direction::Write => &self.write_state,
        }
    }

    fn stream_cell(&self, direction: Direction) -> &ArcSwapOption<MemStream> {
        match direction {
            Direction::Read => &self.rstream,
            Direction::Write => &self.wstream,
        }
    }

    pub fn state(&self, direction: Direction) -> NegotiationState {
        *self.state_cell(direction).lock()
    }

    /// Capability flags as of now, keeping the caller's hint bit
    pub fn flags(&self, hint: StallFlags) -> StallFlags {
        let mut flags = hint & StallFlags::SPAWNED_READER;
        let read = self.state(Direction::Read);
        let write = self.state(Direction::Write);

        flags.set(StallFlags::READS, read == NegotiationState::Established);
        flags.set(StallFlags::WRITES, write == NegotiationState::Established);
        let open = !read.is_terminal() || !write.is_terminal();
        flags.set(StallFlags::STARTING, open && !self.is_closed() && !self.nexus.is_shut_down());
        flags
    }

    /// Negotiate `direction` if it is still open
    ///
    /// `native_flags` are the descriptor's status flags; `O_NONBLOCK`
    /// carries over to an established stream.
    pub fn startup_stall(&self, flags: StallFlags, direction: Direction, native_flags: i32) -> StallFlags {
        if !flags.contains(StallFlags::STARTING) || self.is_closed() {
            return flags;
        }

        {
            let mut state = self.state_cell(direction).lock();
            if state.is_terminal() {
                drop(state);
                return self.flags(flags);
            }
            *state = NegotiationState::Negotiating;
        }

        let next = match self.nexus.stall(direction, &self.config) {
            Verdict::Established(stream) => {
                stream.set_nonblocking(native_flags & libc::O_NONBLOCK != 0);
                self.stream_cell(direction).store(Some(stream));
                NegotiationState::Established
            }
            Verdict::Fallback(reason) => {
                if direction == Direction::Read && flags.contains(StallFlags::SPAWNED_READER) {
                    self.install_alternate_reader();
                }
                debug!(device = self.device(), %direction, ?reason, "Direction falls back");
                NegotiationState::Fallback
            }
        };
        *self.state_cell(direction).lock() = next;
        self.flags(flags)
    }

    fn install_alternate_reader(&self) {
        let Some(fd) = self.fd else {
            return;
        };
        match AlternateReader::new(fd, self.config.implied_newline) {
            Ok(reader) => *self.alternate.lock() = Some(reader),
            Err(e) => warn!(fd, error = %e, "Alternate reader unavailable"),
        }
    }

    /// Read at least `min_bytes` over the stream, or once natively
    pub fn read(&self, buf: &mut [u8], min_bytes: usize) -> BypassResult<ReadOutcome> {
        if self.is_closed() {
            return Err(BypassError::ShutDown);
        }
        self.read_ops.fetch_add(1, Ordering::Relaxed);

        if let Some(stream) = self.rstream.load_full() {
            return Ok(stream.read(buf, min_bytes)?);
        }
        if let Some(alternate) = self.alternate.lock().as_mut() {
            return alternate.read(buf);
        }

        let fd = self.fd.ok_or(BypassError::NoDescriptor)?;
        let count = borrow_fd(fd).read(buf)?;
        Ok(ReadOutcome {
            count,
            expedite: count == 0 && !buf.is_empty(),
        })
    }

    /// Write `buf` over the stream, or once natively
    pub fn write(&self, buf: &[u8]) -> BypassResult<usize> {
        if self.is_closed() {
            return Err(BypassError::ShutDown);
        }
        self.write_ops.fetch_add(1, Ordering::Relaxed);

        if self.fd == Some(STDERR_FD) && !self.stderr_checked.swap(true, Ordering::AcqRel) {
            self.check_stderr();
        }

        if let Some(stream) = self.wstream.load_full() {
            return Ok(stream.write(buf)?);
        }
        let fd = self.fd.ok_or(BypassError::NoDescriptor)?;
        Ok(borrow_fd(fd).write(buf)?)
    }

    /// First write on fd 2: take over the parent's stderr if it published one
    fn check_stderr(&self) {
        match stderr::recover_once(stderr::parent_pid()) {
            Ok(true) => {
                *self.write_state.lock() = NegotiationState::Fallback;
                self.wstream.store(None);
                info!("Stderr write direction moved to recovered descriptor");
            }
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Stderr recovery failed"),
        }
    }

    /// Write `record` followed by a newline in one transfer
    pub fn write_record(&self, record: &[u8]) -> BypassResult<usize> {
        let mut scratch = self.scratch.lock();
        scratch.clear();
        scratch
            .try_reserve(record.len() + 1)
            .map_err(|e| BypassError::OutOfMemory(e.to_string()))?;
        scratch.extend_from_slice(record);
        scratch.push(b'\n');

        let written = self.write(&scratch)?;
        if scratch.capacity() > BYPASS_SCRATCH_SIZE {
            scratch.shrink_to(BYPASS_SCRATCH_SIZE);
        }
        Ok(written)
    }

    /// `read` after stalling the read direction
    pub fn read_auto(&self, buf: &mut [u8], min_bytes: usize) -> BypassResult<ReadOutcome> {
        self.stall_direction(Direction::Read);
        self.read(buf, min_bytes)
    }

    /// `write` after stalling the write direction
    pub fn write_auto(&self, buf: &[u8]) -> BypassResult<usize> {
        self.stall_direction(Direction::Write);
        self.write(buf)
    }

    fn stall_direction(&self, direction: Direction) {
        if !self.state(direction).is_terminal() {
            self.startup_stall(StallFlags::STARTING, direction, 0);
        }
    }

    /// Streams for multiplexed readiness checks
    pub fn current_streams(&self) -> (Option<Arc<MemStream>>, Option<Arc<MemStream>>) {
        (self.rstream.load_full(), self.wstream.load_full())
    }

    pub fn statistics(&self) -> SessionStats {
        SessionStats {
            device: self.device().to_string(),
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            read_state: self.state(Direction::Read),
            write_state: self.state(Direction::Write),
            read_stream: self.rstream.load_full().map(|s| s.stats()),
            write_stream: self.wstream.load_full().map(|s| s.stats()),
        }
    }

    /// Detach from the streams; the nexus keeps them for other sessions
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.rstream.store(None);
        self.wstream.store(None);
        self.alternate.lock().take();
        debug!(key = self.key, device = self.device(), "Session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("device", &self.device())
            .field("read_state", &self.state(Direction::Read))
            .field("write_state", &self.state(Direction::Write))
            .finish()
    }
}
