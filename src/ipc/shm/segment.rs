/*!
 * Shared Memory Segment
 *
 * Named POSIX shared memory objects mapped with memmap2. Creation is
 * idempotent: the first caller sizes the zero-filled object, later callers
 * map what exists. Objects are owner read/write only.
 */

use super::traits::SharedBlock;
use super::types::ShmError;
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Longest object name accepted by shm_open, leading '/' included
const SHM_NAME_MAX: usize = 255;

/// A mapped, named shared memory object
pub struct SharedSegment {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
    created: bool,
    unlink_on_drop: AtomicBool,
    _map: MmapMut,
    file: File,
}

// SAFETY: the mapping is owned for the segment's lifetime and all access to
// its contents goes through atomics or explicitly synchronized copies
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create the named object, or map it if it already exists
    ///
    /// The mapped length is `min_size` rounded up to the page size for a new
    /// object, or the existing object's size, which must be at least
    /// `min_size`.
    pub fn create_or_map(name: &str, min_size: usize) -> Result<Self, ShmError> {
        let path = object_path(name)?;
        let fd = shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|source| ShmError::Os {
            name: name.to_string(),
            source,
        })?;
        let file = File::from(fd);

        let existing = file_len(name, &file)?;
        let (len, created) = if existing == 0 {
            let len = round_to_page(min_size);
            file.set_len(len as u64).map_err(|source| ShmError::Map {
                name: name.to_string(),
                source,
            })?;
            (len, true)
        } else {
            (existing, false)
        };

        let segment = Self::map(name, file, len, min_size, created)?;
        debug!(name, len, created, "Shared segment mapped");
        Ok(segment)
    }

    /// Map an object that must already exist
    pub fn open(name: &str, min_size: usize) -> Result<Self, ShmError> {
        let path = object_path(name)?;
        let fd = shm_open(path.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|source| {
            match source {
                Errno::ENOENT => ShmError::NotFound(name.to_string()),
                source => ShmError::Os {
                    name: name.to_string(),
                    source,
                },
            }
        })?;
        let file = File::from(fd);
        let len = file_len(name, &file)?;
        Self::map(name, file, len, min_size, false)
    }

    /// Remove the name; existing mappings stay valid
    ///
    /// Returns false if no object had that name.
    pub fn remove(name: &str) -> Result<bool, ShmError> {
        let path = object_path(name)?;
        match shm_unlink(path.as_str()) {
            Ok(()) => Ok(true),
            Err(Errno::ENOENT) => Ok(false),
            Err(source) => Err(ShmError::Os {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn map(name: &str, file: File, len: usize, min_size: usize, created: bool) -> Result<Self, ShmError> {
        if len < min_size {
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                actual: len,
                required: min_size,
            });
        }

        // SAFETY: the object is at least `len` bytes; concurrent modification
        // by other processes is expected and handled by the users of the block
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file) }.map_err(|source| {
            ShmError::Map {
                name: name.to_string(),
                source,
            }
        })?;
        let ptr = NonNull::new(map.as_mut_ptr()).ok_or_else(|| ShmError::Map {
            name: name.to_string(),
            source: std::io::Error::from(std::io::ErrorKind::InvalidData),
        })?;

        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
            created,
            unlink_on_drop: AtomicBool::new(false),
            _map: map,
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if this handle created the object
    pub fn was_created(&self) -> bool {
        self.created
    }

    /// Descriptor of the underlying object
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Remove the name when this handle is dropped
    pub fn set_unlink_on_drop(&self, unlink: bool) {
        self.unlink_on_drop.store(unlink, Ordering::Relaxed);
    }

    /// Byte view of the mapping
    ///
    /// # Safety
    ///
    /// No other party may write the returned range while it is borrowed.
    pub unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }
}

// SAFETY: the mapping is page-aligned and lives as long as the segment
unsafe impl SharedBlock for SharedSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.unlink_on_drop.load(Ordering::Relaxed) {
            if let Err(e) = Self::remove(&self.name) {
                warn!(name = %self.name, error = %e, "Failed to remove shared segment");
            }
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("created", &self.created)
            .finish()
    }
}

fn object_path(name: &str) -> Result<String, ShmError> {
    if name.is_empty() || name.contains('/') || name.contains('\0') || name.len() + 1 > SHM_NAME_MAX {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    Ok(format!("/{}", name))
}

fn file_len(name: &str, file: &File) -> Result<usize, ShmError> {
    file.metadata()
        .map(|m| m.len() as usize)
        .map_err(|source| ShmError::Map {
            name: name.to_string(),
            source,
        })
}

fn page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as usize
    } else {
        4096
    }
}

fn round_to_page(size: usize) -> usize {
    let page = page_size();
    size.max(1).div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("pbtest_{}_{}", tag, uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(matches!(
            SharedSegment::create_or_map("", 64),
            Err(ShmError::InvalidName(_))
        ));
        assert!(matches!(
            SharedSegment::create_or_map("a/b", 64),
            Err(ShmError::InvalidName(_))
        ));
    }

    #[test]
    fn test_size_rounds_to_page() {
        let name = unique("round");
        let seg = SharedSegment::create_or_map(&name, 100).unwrap();
        seg.set_unlink_on_drop(true);
        assert!(seg.was_created());
        assert_eq!(seg.len() % page_size(), 0);
        assert!(seg.len() >= 100);
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let name = unique("missing");
        assert!(matches!(
            SharedSegment::open(&name, 64),
            Err(ShmError::NotFound(_))
        ));
    }

    #[test]
    fn test_existing_too_small() {
        let name = unique("small");
        let seg = SharedSegment::create_or_map(&name, 64).unwrap();
        seg.set_unlink_on_drop(true);
        let err = SharedSegment::create_or_map(&name, seg.len() + 1).unwrap_err();
        assert!(matches!(err, ShmError::SizeMismatch { .. }));
    }

    #[test]
    fn test_remove_reports_presence() {
        let name = unique("remove");
        let seg = SharedSegment::create_or_map(&name, 64).unwrap();
        assert!(SharedSegment::remove(&name).unwrap());
        assert!(!SharedSegment::remove(&name).unwrap());
        // Mapping survives the unlink
        unsafe { seg.as_ptr().write(9) };
        assert_eq!(unsafe { seg.bytes()[0] }, 9);
    }
}
