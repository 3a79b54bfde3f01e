/*!
 * Device Classification
 *
 * Only FIFOs and anonymous pipes are bypass candidates. Both ends of one
 * pipe report the same device and inode, which gives the two peers a
 * common device name without any other coordination.
 */

use std::fs::File;
use std::io;
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use tracing::debug;

/// What fstat reports for a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Pipe,
    RegularFile,
    Directory,
    CharDevice,
    BlockDevice,
    Socket,
    Other,
}

impl DeviceKind {
    pub fn is_eligible(self) -> bool {
        self == Self::Pipe
    }
}

/// Kind and device name of an open descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub kind: DeviceKind,
    pub name: String,
}

/// Borrow `fd` as a `File` without taking ownership
pub(crate) fn borrow_fd(fd: RawFd) -> ManuallyDrop<File> {
    // SAFETY: the caller keeps `fd` open; ManuallyDrop never closes it
    ManuallyDrop::new(unsafe { File::from_raw_fd(fd) })
}

/// Classify a descriptor
pub fn probe(fd: RawFd) -> io::Result<Device> {
    let meta = borrow_fd(fd).metadata()?;
    let ft = meta.file_type();
    let kind = if ft.is_fifo() {
        DeviceKind::Pipe
    } else if ft.is_file() {
        DeviceKind::RegularFile
    } else if ft.is_dir() {
        DeviceKind::Directory
    } else if ft.is_char_device() {
        DeviceKind::CharDevice
    } else if ft.is_block_device() {
        DeviceKind::BlockDevice
    } else if ft.is_socket() {
        DeviceKind::Socket
    } else {
        DeviceKind::Other
    };

    Ok(Device {
        kind,
        name: format!("fifo{:x}x{:x}", meta.dev(), meta.ino()),
    })
}

/// Device name of `fd` if it is eligible for the bypass
pub fn classify(fd: RawFd) -> Option<String> {
    match probe(fd) {
        Ok(device) if device.kind.is_eligible() => Some(device.name),
        Ok(device) => {
            debug!(fd, kind = ?device.kind, "Descriptor not eligible for bypass");
            None
        }
        Err(e) => {
            debug!(fd, error = %e, "Descriptor could not be classified");
            None
        }
    }
}
