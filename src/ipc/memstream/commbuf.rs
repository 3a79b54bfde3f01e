/*!
 * Communication Buffer
 *
 * The header that sits at the start of every stream block and the locked
 * transfer steps that move bytes through the data area behind it.
 *
 * The data area is linear, not circular: the writer appends at `write_pos`
 * until it reaches `data_limit`, and both positions drop back to zero only
 * when the reader catches up. Every function here except `init_or_attach`
 * expects the caller to hold `lock`.
 */

use super::types::{StreamError, StreamRole, StreamState, Transfer, TransferStatus};
use crate::core::limits::{
    COMMBUF_FMT_VERSION, COMMBUF_HEADER_SIZE, COMMBUF_IPC_VERSION, COMMBUF_MIN_BLOCK,
};
use crate::core::sync::SharedLock;
use crate::core::types::Pid;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Marker stored in `fmt_version` while the first mapper fills the header
const INITIALIZING: u16 = u16::MAX;

/// Bound on waiting for another mapper to finish initializing
const INIT_WAIT: Duration = Duration::from_secs(1);

static SEQUENCE: AtomicU32 = AtomicU32::new(1);

/// Shared header, 64 bytes, native endian
#[repr(C)]
#[derive(Debug)]
pub struct CommbufHeader {
    fmt_version: AtomicU16,
    ipc_version: AtomicU16,
    sequence: AtomicU32,
    writer_pid: AtomicU32,
    reader_pid: AtomicU32,
    pub(crate) lock: SharedLock,
    data_limit: AtomicU32,
    state: AtomicU32,
    write_pos: AtomicU32,
    read_pos: AtomicU32,
    reader_wake: AtomicU32,
    writer_wake: AtomicU32,
    _reserved: [AtomicU32; 4],
}

const _: () = assert!(std::mem::size_of::<CommbufHeader>() == COMMBUF_HEADER_SIZE);

impl CommbufHeader {
    /// View the start of a block as a header
    ///
    /// # Safety
    ///
    /// `base` must be 8-byte aligned and valid for at least
    /// `COMMBUF_HEADER_SIZE` bytes for the returned lifetime.
    pub(crate) unsafe fn from_ptr<'a>(base: *mut u8) -> &'a Self {
        &*(base as *const Self)
    }

    /// Fill a fresh header, or validate one another mapper already filled
    ///
    /// Then records `pid` as this role's owner. Returns true if this call
    /// performed the initialization.
    pub(crate) fn init_or_attach(&self, block_len: usize, role: StreamRole, pid: Pid) -> Result<bool, StreamError> {
        if block_len < COMMBUF_MIN_BLOCK {
            return Err(StreamError::BlockTooSmall {
                size: block_len,
                min: COMMBUF_MIN_BLOCK,
            });
        }
        let data_limit = u32::try_from(block_len - COMMBUF_HEADER_SIZE)
            .map_err(|_| StreamError::Corrupt(format!("block of {} bytes", block_len)))?;

        let initialized = match self
            .fmt_version
            .compare_exchange(0, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.ipc_version.store(COMMBUF_IPC_VERSION, Ordering::Relaxed);
                self.sequence
                    .store(SEQUENCE.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
                self.writer_pid.store(0, Ordering::Relaxed);
                self.reader_pid.store(0, Ordering::Relaxed);
                self.lock.reset();
                self.data_limit.store(data_limit, Ordering::Relaxed);
                self.state.store(StreamState::Idle as u32, Ordering::Relaxed);
                self.write_pos.store(0, Ordering::Relaxed);
                self.read_pos.store(0, Ordering::Relaxed);
                self.reader_wake.store(0, Ordering::Relaxed);
                self.writer_wake.store(0, Ordering::Relaxed);
                self.fmt_version.store(COMMBUF_FMT_VERSION, Ordering::Release);
                true
            }
            Err(_) => {
                self.wait_initialized()?;
                let limit = self.data_limit.load(Ordering::Acquire);
                if limit == 0 || limit > data_limit {
                    return Err(StreamError::Corrupt(format!(
                        "data limit {} exceeds mapped {}",
                        limit, data_limit
                    )));
                }
                false
            }
        };

        match role {
            StreamRole::Writer => self.writer_pid.store(pid, Ordering::Release),
            StreamRole::Reader => self.reader_pid.store(pid, Ordering::Release),
        }
        Ok(initialized)
    }

    fn wait_initialized(&self) -> Result<(), StreamError> {
        let deadline = Instant::now() + INIT_WAIT;
        loop {
            let fmt = self.fmt_version.load(Ordering::Acquire);
            if fmt != INITIALIZING {
                let ipc = self.ipc_version.load(Ordering::Acquire);
                if fmt != COMMBUF_FMT_VERSION || ipc != COMMBUF_IPC_VERSION {
                    return Err(StreamError::VersionMismatch {
                        fmt,
                        ipc,
                        expected_fmt: COMMBUF_FMT_VERSION,
                        expected_ipc: COMMBUF_IPC_VERSION,
                    });
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StreamError::Corrupt("header initialization never finished".into()));
            }
            std::thread::yield_now();
        }
    }

    #[inline]
    pub fn state(&self) -> StreamState {
        StreamState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: StreamState) {
        self.state.store(state as u32, Ordering::Release);
    }

    #[inline]
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn data_limit(&self) -> usize {
        self.data_limit.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn pending(&self) -> usize {
        (self.write_pos.load(Ordering::Relaxed) - self.read_pos.load(Ordering::Relaxed)) as usize
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.data_limit() - self.write_pos.load(Ordering::Relaxed) as usize
    }

    pub fn pid_of(&self, role: StreamRole) -> Pid {
        match role {
            StreamRole::Writer => self.writer_pid.load(Ordering::Acquire),
            StreamRole::Reader => self.reader_pid.load(Ordering::Acquire),
        }
    }

    pub(crate) fn set_pid(&self, role: StreamRole, pid: Pid) {
        match role {
            StreamRole::Writer => self.writer_pid.store(pid, Ordering::Release),
            StreamRole::Reader => self.reader_pid.store(pid, Ordering::Release),
        }
    }

    /// Word a party of `role` parks on
    pub(crate) fn wake_word(&self, role: StreamRole) -> &AtomicU32 {
        match role {
            StreamRole::Writer => &self.writer_wake,
            StreamRole::Reader => &self.reader_wake,
        }
    }

    /// Append up to `limit` bytes of `src` to the data area at `data`
    pub(crate) fn put(&self, data: *mut u8, src: &[u8], limit: usize) -> Transfer {
        let enter = self.state();
        let mut moved = 0;

        let status = match enter {
            StreamState::Idle | StreamState::Empty => {
                let wp = self.write_pos.load(Ordering::Relaxed) as usize;
                let segment = src.len().min(limit).min(self.data_limit() - wp);
                if segment > 0 {
                    // SAFETY: wp + segment <= data_limit, the data area length
                    unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), data.add(wp), segment) };
                    self.write_pos.store((wp + segment) as u32, Ordering::Release);
                    moved = segment;
                    if enter == StreamState::Empty {
                        self.set_state(StreamState::Idle);
                    }
                    TransferStatus::Completed
                } else if src.is_empty() {
                    TransferStatus::Completed
                } else {
                    self.set_state(StreamState::Full);
                    TransferStatus::Blocked
                }
            }
            StreamState::Full => TransferStatus::Blocked,
            StreamState::WriterDone | StreamState::ReaderDone | StreamState::Closed => {
                TransferStatus::Discarded
            }
        };

        Transfer {
            status,
            moved,
            enter,
            exit: self.state(),
        }
    }

    /// Copy up to `limit` pending bytes from the data area into `dst`
    pub(crate) fn get(&self, data: *mut u8, dst: &mut [u8], limit: usize) -> Transfer {
        let enter = self.state();
        if enter == StreamState::ReaderDone {
            return Transfer {
                status: TransferStatus::Aborted,
                moved: 0,
                enter,
                exit: enter,
            };
        }

        let rp = self.read_pos.load(Ordering::Relaxed) as usize;
        let wp = self.write_pos.load(Ordering::Acquire) as usize;
        let segment = dst.len().min(limit).min(wp - rp);
        if segment > 0 {
            // SAFETY: rp + segment <= wp <= data_limit
            unsafe { std::ptr::copy_nonoverlapping(data.add(rp), dst.as_mut_ptr(), segment) };
        }
        let drained = rp + segment == wp;
        if drained {
            self.write_pos.store(0, Ordering::Relaxed);
            self.read_pos.store(0, Ordering::Relaxed);
        } else {
            self.read_pos.store((rp + segment) as u32, Ordering::Relaxed);
        }
        let writer_gone = self.writer_pid.load(Ordering::Acquire) == 0;

        let status = match enter {
            StreamState::Idle if segment == 0 && !dst.is_empty() => {
                if writer_gone {
                    self.set_state(StreamState::WriterDone);
                    TransferStatus::Discarded
                } else {
                    self.set_state(StreamState::Empty);
                    TransferStatus::Blocked
                }
            }
            StreamState::Empty => {
                if segment > 0 {
                    self.set_state(StreamState::Idle);
                    TransferStatus::Completed
                } else if writer_gone {
                    self.set_state(StreamState::WriterDone);
                    TransferStatus::Discarded
                } else {
                    TransferStatus::Blocked
                }
            }
            StreamState::Full => {
                if drained {
                    self.set_state(StreamState::Idle);
                }
                TransferStatus::Completed
            }
            StreamState::WriterDone | StreamState::Closed if segment == 0 && !dst.is_empty() => {
                TransferStatus::Discarded
            }
            _ => TransferStatus::Completed,
        };

        Transfer {
            status,
            moved: segment,
            enter,
            exit: self.state(),
        }
    }

    /// Mark `role` done; returns (previous, new) state
    pub(crate) fn close_side(&self, role: StreamRole) -> (StreamState, StreamState) {
        let enter = self.state();
        let exit = match (role, enter) {
            (StreamRole::Writer, StreamState::ReaderDone | StreamState::Closed) => StreamState::Closed,
            (StreamRole::Writer, _) => StreamState::WriterDone,
            (StreamRole::Reader, StreamState::WriterDone | StreamState::Closed) => StreamState::Closed,
            (StreamRole::Reader, _) => StreamState::ReaderDone,
        };
        self.set_state(exit);
        (enter, exit)
    }

    /// Record that the peer of `role` no longer exists
    ///
    /// A reader keeps draining what was written; a writer can no longer
    /// deliver anything.
    pub(crate) fn mark_peer_gone(&self, role: StreamRole) {
        self.set_pid(role.peer(), 0);
        match role {
            StreamRole::Reader => {
                if matches!(self.state(), StreamState::Idle | StreamState::Empty | StreamState::Full) {
                    self.set_state(StreamState::WriterDone);
                }
            }
            StreamRole::Writer => self.set_state(StreamState::Closed),
        }
    }

    /// Non-blocking introspection; `arm` pre-moves idle to empty/full
    pub(crate) fn query(&self, role: StreamRole, arm: bool) -> (StreamState, usize, usize) {
        if arm && self.state() == StreamState::Idle {
            match role {
                StreamRole::Writer if self.available() == 0 => self.set_state(StreamState::Full),
                StreamRole::Reader if self.pending() == 0 => {
                    self.write_pos.store(0, Ordering::Relaxed);
                    self.read_pos.store(0, Ordering::Relaxed);
                    self.set_state(StreamState::Empty);
                }
                _ => {}
            }
        }
        (self.state(), self.pending(), self.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::shm::{HeapBlock, SharedBlock};
    use pretty_assertions::assert_eq;

    fn header(block: &HeapBlock) -> &CommbufHeader {
        unsafe { CommbufHeader::from_ptr(block.as_ptr()) }
    }

    fn data(block: &HeapBlock) -> *mut u8 {
        unsafe { block.as_ptr().add(COMMBUF_HEADER_SIZE) }
    }

    fn attached(len: usize) -> HeapBlock {
        let block = HeapBlock::new(len);
        let hdr = header(&block);
        assert!(hdr.init_or_attach(block.len(), StreamRole::Writer, 10).unwrap());
        assert!(!hdr.init_or_attach(block.len(), StreamRole::Reader, 20).unwrap());
        block
    }

    #[test]
    fn test_init_rejects_small_block() {
        let block = HeapBlock::new(128);
        let err = header(&block)
            .init_or_attach(block.len(), StreamRole::Writer, 1)
            .unwrap_err();
        assert!(matches!(err, StreamError::BlockTooSmall { .. }));
    }

    #[test]
    fn test_attach_rejects_foreign_version() {
        let block = HeapBlock::new(1024);
        let hdr = header(&block);
        hdr.init_or_attach(block.len(), StreamRole::Writer, 1).unwrap();
        hdr.fmt_version.store(7, Ordering::Release);
        let err = hdr.init_or_attach(block.len(), StreamRole::Reader, 2).unwrap_err();
        assert!(matches!(err, StreamError::VersionMismatch { fmt: 7, .. }));
    }

    #[test]
    fn test_put_until_full_then_drain_resets() {
        let block = attached(COMMBUF_MIN_BLOCK);
        let hdr = header(&block);
        let limit = hdr.data_limit();

        let src = vec![0xAB; limit];
        let t = hdr.put(data(&block), &src, usize::MAX);
        assert_eq!(t.status, TransferStatus::Completed);
        assert_eq!(t.moved, limit);

        let t = hdr.put(data(&block), b"x", usize::MAX);
        assert_eq!(t.status, TransferStatus::Blocked);
        assert_eq!(t.exit, StreamState::Full);

        let mut dst = vec![0u8; limit];
        let t = hdr.get(data(&block), &mut dst, usize::MAX);
        assert_eq!(t.moved, limit);
        assert_eq!((t.enter, t.exit), (StreamState::Full, StreamState::Idle));
        assert_eq!(hdr.pending(), 0);
        assert_eq!(hdr.available(), limit);
    }

    #[test]
    fn test_get_empty_parks_and_put_unparks() {
        let block = attached(1024);
        let hdr = header(&block);
        let mut dst = [0u8; 8];

        let t = hdr.get(data(&block), &mut dst, usize::MAX);
        assert_eq!(t.status, TransferStatus::Blocked);
        assert_eq!(t.exit, StreamState::Empty);

        let t = hdr.put(data(&block), b"abc", usize::MAX);
        assert_eq!((t.enter, t.exit), (StreamState::Empty, StreamState::Idle));

        let t = hdr.get(data(&block), &mut dst, usize::MAX);
        assert_eq!(&dst[..t.moved], b"abc");
    }

    #[test]
    fn test_writer_done_drains_then_discards() {
        let block = attached(1024);
        let hdr = header(&block);
        hdr.put(data(&block), b"tail", usize::MAX);
        hdr.close_side(StreamRole::Writer);

        let mut dst = [0u8; 2];
        assert_eq!(hdr.get(data(&block), &mut dst, usize::MAX).moved, 2);
        assert_eq!(hdr.get(data(&block), &mut dst, usize::MAX).moved, 2);
        let t = hdr.get(data(&block), &mut dst, usize::MAX);
        assert_eq!(t.status, TransferStatus::Discarded);
    }

    #[test]
    fn test_close_both_sides_is_closed() {
        let block = attached(1024);
        let hdr = header(&block);
        assert_eq!(hdr.close_side(StreamRole::Reader), (StreamState::Idle, StreamState::ReaderDone));
        assert_eq!(hdr.close_side(StreamRole::Writer), (StreamState::ReaderDone, StreamState::Closed));
        assert_eq!(hdr.put(data(&block), b"x", 1).status, TransferStatus::Discarded);
    }

    #[test]
    fn test_segment_limit_caps_copy() {
        let block = attached(4096);
        let hdr = header(&block);
        let t = hdr.put(data(&block), &[1u8; 100], 16);
        assert_eq!(t.moved, 16);
    }

    #[test]
    fn test_query_arm() {
        let block = attached(1024);
        let hdr = header(&block);
        let (state, pending, available) = hdr.query(StreamRole::Reader, true);
        assert_eq!(state, StreamState::Empty);
        assert_eq!(pending, 0);
        assert_eq!(available, hdr.data_limit());

        let (state, _, _) = hdr.query(StreamRole::Reader, false);
        assert_eq!(state, StreamState::Empty);
    }
}
