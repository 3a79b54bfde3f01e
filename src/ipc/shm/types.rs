/*!
 * Shared Memory Types
 * Errors for named shared segments
 */

use miette::Diagnostic;
use thiserror::Error;

/// Shared memory error types
#[derive(Debug, Error, Diagnostic)]
pub enum ShmError {
    /// Name unusable as a shared memory object name
    #[error("Invalid segment name: {0:?}")]
    #[diagnostic(
        code(shm::invalid_name),
        help("Segment names must be non-empty, contain no '/' and fit within NAME_MAX.")
    )]
    InvalidName(String),

    /// Named segment does not exist
    #[error("Segment not found: {0}")]
    #[diagnostic(code(shm::not_found), help("The creating peer may have already released it."))]
    NotFound(String),

    /// Existing segment smaller than required
    #[error("Segment {name} has {actual} bytes, need at least {required}")]
    #[diagnostic(
        code(shm::size_mismatch),
        help("A stale segment with the same name may exist. Remove it or pick another name.")
    )]
    SizeMismatch {
        name: String,
        actual: usize,
        required: usize,
    },

    /// shm_open or shm_unlink failed
    #[error("Shared memory object {name} failed: {source}")]
    #[diagnostic(code(shm::os_error))]
    Os {
        name: String,
        #[source]
        source: nix::errno::Errno,
    },

    /// Sizing or mapping failed
    #[error("Mapping {name} failed: {source}")]
    #[diagnostic(code(shm::map_failed), help("Check available shared memory (/dev/shm)."))]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
