/*!
 * Pipe Endpoint
 *
 * `Read + Write` wrapper around one end of a pipe. The first read or write
 * in each direction runs the startup stall; afterwards bytes move over the
 * shared stream when one was established and over the file otherwise.
 */

use super::registry::Registry;
use super::session::Session;
use super::types::StallFlags;
use crate::core::types::Direction;
use nix::fcntl::{fcntl, FcntlArg};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::Arc;

pub struct PipeEndpoint {
    file: File,
    registry: Arc<Registry>,
    session: Option<Arc<Session>>,
    flags: StallFlags,
}

impl PipeEndpoint {
    pub fn new(registry: Arc<Registry>, file: File) -> Self {
        let session = registry.init(file.as_raw_fd());
        let flags = if session.is_some() {
            StallFlags::STARTING
        } else {
            StallFlags::empty()
        };
        Self {
            file,
            registry,
            session,
            flags,
        }
    }

    /// Mark the peer as a spawned child that will not negotiate
    pub fn spawned_reader(mut self) -> Self {
        self.flags |= StallFlags::SPAWNED_READER;
        self
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn flags(&self) -> StallFlags {
        self.flags
    }

    pub fn is_bypassed(&self, direction: Direction) -> bool {
        match direction {
            Direction::Read => self.flags.contains(StallFlags::READS),
            Direction::Write => self.flags.contains(StallFlags::WRITES),
        }
    }

    /// Run the startup stall for `direction` now instead of on first use
    pub fn negotiate(&mut self, direction: Direction) -> StallFlags {
        if let Some(session) = &self.session {
            let native = fcntl(self.file.as_raw_fd(), FcntlArg::F_GETFL).unwrap_or(0);
            self.flags = session.startup_stall(self.flags, direction, native);
        }
        self.flags
    }

    fn ensure_negotiated(&mut self, direction: Direction) {
        let open = self
            .session
            .as_ref()
            .is_some_and(|session| !session.state(direction).is_terminal());
        if open && self.flags.contains(StallFlags::STARTING) {
            self.negotiate(direction);
        }
    }

    fn release(&mut self) {
        if let Some(session) = self.session.take() {
            self.registry.shutdown(&session);
        }
        self.flags = StallFlags::empty();
    }
}

impl Read for PipeEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_negotiated(Direction::Read);
        match &self.session {
            Some(session) => Ok(session.read(buf, 1)?.count),
            None => self.file.read(buf),
        }
    }
}

impl Write for PipeEndpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_negotiated(Direction::Write);
        match &self.session {
            Some(session) => Ok(session.write(buf)?),
            None => self.file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PipeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEndpoint")
            .field("fd", &self.file.as_raw_fd())
            .field("flags", &self.flags)
            .field("session", &self.session)
            .finish()
    }
}
