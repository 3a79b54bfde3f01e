/*!
 * Memory Stream Types
 * States, transfer outcomes, attributes, statistics and errors
 */

use bitflags::bitflags;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Ring buffer state shared by both sides
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle = 0,
    /// Reader parked waiting for data
    Empty = 1,
    /// Writer parked waiting for space
    Full = 2,
    WriterDone = 3,
    ReaderDone = 4,
    Closed = 5,
}

impl StreamState {
    /// Decode a raw header value; anything unknown reads as closed
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Empty,
            2 => Self::Full,
            3 => Self::WriterDone,
            4 => Self::ReaderDone,
            _ => Self::Closed,
        }
    }

    #[inline]
    pub fn is_done(self) -> bool {
        matches!(self, Self::WriterDone | Self::ReaderDone | Self::Closed)
    }
}

/// Which end of the ring buffer a handle drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    Reader,
    Writer,
}

impl StreamRole {
    pub fn peer(self) -> Self {
        match self {
            Self::Reader => Self::Writer,
            Self::Writer => Self::Reader,
        }
    }
}

/// Outcome of one locked transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Bytes moved, or nothing needed moving
    Completed,
    /// Nothing can move until the peer acts
    Blocked,
    /// Peer is gone; writes fail, reads are at end of stream
    Discarded,
    /// Protocol violation
    Aborted,
}

/// Result of a single put/get under the header lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub status: TransferStatus,
    pub moved: usize,
    pub enter: StreamState,
    pub exit: StreamState,
}

bitflags! {
    /// Per-handle stream attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StreamAttributes: u32 {
        /// Return instead of parking when blocked
        const NONBLOCK = 0x1;
    }
}

/// Snapshot returned by `MemStream::query`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamQuery {
    pub state: StreamState,
    /// Bytes written but not yet read
    pub pending: usize,
    /// Bytes a writer could add without blocking
    pub available: usize,
}

/// Result of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadOutcome {
    pub count: usize,
    /// No more data will follow promptly; callers should not wait for more
    pub expedite: bool,
}

impl ReadOutcome {
    #[inline]
    pub fn is_eof(&self) -> bool {
        self.count == 0 && self.expedite
    }
}

/// Live counters kept by a stream
#[derive(Debug, Default)]
pub struct StreamStats {
    pub operations: AtomicU64,
    pub errors: AtomicU64,
    pub segments: AtomicU64,
    pub waits: AtomicU64,
    pub signals: AtomicU64,
}

impl StreamStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            operations: self.operations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            segments: self.segments.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            signals: self.signals.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of `StreamStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamStatsSnapshot {
    pub operations: u64,
    pub errors: u64,
    pub segments: u64,
    pub waits: u64,
    pub signals: u64,
}

/// Memory stream errors
#[derive(Debug, Error, Diagnostic)]
pub enum StreamError {
    #[error("Block of {size} bytes is too small, need at least {min}")]
    #[diagnostic(code(memstream::block_too_small))]
    BlockTooSmall { size: usize, min: usize },

    #[error("Header version {fmt}/{ipc} does not match {expected_fmt}/{expected_ipc}")]
    #[diagnostic(
        code(memstream::version_mismatch),
        help("The peer was built with an incompatible stream format.")
    )]
    VersionMismatch {
        fmt: u16,
        ipc: u16,
        expected_fmt: u16,
        expected_ipc: u16,
    },

    #[error("Header is inconsistent: {0}")]
    #[diagnostic(code(memstream::corrupt))]
    Corrupt(String),

    #[error("Operation would block")]
    #[diagnostic(code(memstream::would_block))]
    WouldBlock,

    #[error("Broken pipe: peer has gone")]
    #[diagnostic(code(memstream::broken_pipe))]
    BrokenPipe,

    #[error("Stream aborted in state {0:?}")]
    #[diagnostic(code(memstream::aborted))]
    Aborted(StreamState),

    #[error("Invalid stream attributes: {0:#x}")]
    #[diagnostic(code(memstream::invalid_attributes), help("Only NONBLOCK (0x1) is defined."))]
    InvalidAttributes(u32),

    #[error("Stream is closed")]
    #[diagnostic(code(memstream::not_open))]
    NotOpen,
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        use std::io::{Error, ErrorKind};
        let kind = match err {
            StreamError::WouldBlock => ErrorKind::WouldBlock,
            StreamError::BrokenPipe => ErrorKind::BrokenPipe,
            StreamError::InvalidAttributes(_) | StreamError::BlockTooSmall { .. } => ErrorKind::InvalidInput,
            StreamError::NotOpen => ErrorKind::NotConnected,
            _ => ErrorKind::Other,
        };
        Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_and_unknown() {
        for state in [
            StreamState::Idle,
            StreamState::Empty,
            StreamState::Full,
            StreamState::WriterDone,
            StreamState::ReaderDone,
            StreamState::Closed,
        ] {
            assert_eq!(StreamState::from_raw(state as u32), state);
        }
        assert_eq!(StreamState::from_raw(99), StreamState::Closed);
    }

    #[test]
    fn test_error_kinds() {
        let e: std::io::Error = StreamError::BrokenPipe.into();
        assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe);
        let e: std::io::Error = StreamError::WouldBlock.into();
        assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock);
    }
}
