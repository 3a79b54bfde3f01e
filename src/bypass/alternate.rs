/*!
 * Alternate Reader
 *
 * Native-path reader for a pipe whose writer is a spawned child that does
 * not negotiate. Each read blocks in poll until data or a hangup arrives;
 * a hangup with nothing readable is end of stream.
 */

use crate::core::errors::BypassResult;
use crate::core::limits::ALT_READER_BUFSIZE;
use crate::ipc::memstream::ReadOutcome;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use tracing::debug;

/// Bytes read from the device per native read; the rest is newline room
const DEVICE_READ: usize = ALT_READER_BUFSIZE - 2;

pub struct AlternateReader {
    device: File,
    buffer: Box<[u8]>,
    start: usize,
    end: usize,
    eof: bool,
    implied_newline: bool,
}

impl AlternateReader {
    /// Open a private read channel on `fd`
    pub fn new(fd: RawFd, implied_newline: bool) -> BypassResult<Self> {
        // SAFETY: the caller keeps `fd` open for the duration of this call
        let owned = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
        debug!(fd, implied_newline, "Alternate reader installed");
        Ok(Self {
            device: File::from(owned),
            buffer: vec![0u8; ALT_READER_BUFSIZE].into_boxed_slice(),
            start: 0,
            end: 0,
            eof: false,
            implied_newline,
        })
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.start == self.end
    }

    /// Return buffered bytes, or block for the next native read
    pub fn read(&mut self, buf: &mut [u8]) -> BypassResult<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::default());
        }
        if self.start == self.end && !self.eof {
            self.fill()?;
        }
        if self.start == self.end {
            return Ok(ReadOutcome {
                count: 0,
                expedite: true,
            });
        }

        let count = buf.len().min(self.end - self.start);
        buf[..count].copy_from_slice(&self.buffer[self.start..self.start + count]);
        self.start += count;
        Ok(ReadOutcome {
            count,
            expedite: self.eof && self.start == self.end,
        })
    }

    fn fill(&mut self) -> BypassResult<()> {
        self.start = 0;
        self.end = 0;

        loop {
            let revents = {
                let mut fds = [PollFd::new(self.device.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => fds[0].revents().unwrap_or(PollFlags::empty()),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(io::Error::from(e).into()),
                }
            };

            if revents.contains(PollFlags::POLLIN) {
                let n = match self.device.read(&mut self.buffer[..DEVICE_READ]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                if n == 0 {
                    self.eof = true;
                    return Ok(());
                }
                self.end = n;
                if self.implied_newline && self.buffer[n - 1] != b'\n' {
                    self.buffer[n] = b'\n';
                    self.end += 1;
                }
                return Ok(());
            }
            if revents.contains(PollFlags::POLLHUP) {
                debug!("Alternate reader saw no remaining writers");
                self.eof = true;
                return Ok(());
            }
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe reported an error").into());
            }
        }
    }
}

impl std::fmt::Debug for AlternateReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlternateReader")
            .field("buffered", &(self.end - self.start))
            .field("eof", &self.eof)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn pipe() -> (File, File) {
        let (r, w) = nix::unistd::pipe().unwrap();
        (File::from(r), File::from(w))
    }

    #[test]
    fn test_reads_until_writer_hangs_up() {
        let (r, mut w) = pipe();
        let mut alt = AlternateReader::new(r.as_raw_fd(), false).unwrap();
        w.write_all(b"abc").unwrap();
        drop(w);

        let mut buf = [0u8; 16];
        let first = alt.read(&mut buf).unwrap();
        assert_eq!(&buf[..first.count], b"abc");

        let end = alt.read(&mut buf).unwrap();
        assert!(end.is_eof());
        // stays at end of stream
        assert!(alt.read(&mut buf).unwrap().is_eof());
    }

    #[test]
    fn test_implied_newline_appended_once_per_record() {
        let (r, mut w) = pipe();
        let mut alt = AlternateReader::new(r.as_raw_fd(), true).unwrap();
        w.write_all(b"line").unwrap();

        let mut buf = [0u8; 16];
        let out = alt.read(&mut buf).unwrap();
        assert_eq!(&buf[..out.count], b"line\n");

        w.write_all(b"done\n").unwrap();
        let out = alt.read(&mut buf).unwrap();
        assert_eq!(&buf[..out.count], b"done\n");
    }

    #[test]
    fn test_small_buffers_drain_in_pieces() {
        let (r, mut w) = pipe();
        let mut alt = AlternateReader::new(r.as_raw_fd(), false).unwrap();
        w.write_all(b"0123456789").unwrap();
        drop(w);

        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let o = alt.read(&mut buf).unwrap();
            out.extend_from_slice(&buf[..o.count]);
            if o.expedite {
                break;
            }
        }
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn test_blocks_until_data_arrives() {
        let (r, mut w) = pipe();
        let mut alt = AlternateReader::new(r.as_raw_fd(), false).unwrap();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            w.write_all(b"late").unwrap();
        });

        let mut buf = [0u8; 8];
        let out = alt.read(&mut buf).unwrap();
        assert_eq!(&buf[..out.count], b"late");
        writer.join().unwrap();
    }
}
