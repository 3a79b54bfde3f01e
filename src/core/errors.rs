/*!
 * Error Types
 * Centralized error handling with thiserror and miette
 */

use miette::Diagnostic;
use thiserror::Error;

pub use crate::ipc::lock::LockError;
pub use crate::ipc::memstream::StreamError;
pub use crate::ipc::shm::ShmError;

/// Result alias for session-level operations
pub type BypassResult<T> = Result<T, BypassError>;

/// Session-level errors
///
/// Negotiation failures never reach the application as one of these; they
/// become a fallback to the native path. What remains are I/O failures on
/// an established or native path and resource problems with no fallback.
#[derive(Error, Debug, Diagnostic)]
pub enum BypassError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Shm(#[from] ShmError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lock(#[from] LockError),

    #[error("Invalid device name: {0}")]
    #[diagnostic(
        code(bypass::invalid_name),
        help("Device names must produce a non-empty resource name without '/'.")
    )]
    InvalidName(String),

    #[error("Invalid operation {0:?}")]
    #[diagnostic(code(bypass::invalid_operation), help("The stall operation must be \"r\" or \"w\"."))]
    InvalidOperation(String),

    #[error("Session has no native descriptor")]
    #[diagnostic(
        code(bypass::no_descriptor),
        help("Sessions attached by name can only move data over an established stream.")
    )]
    NoDescriptor,

    #[error("Session is shut down")]
    #[diagnostic(code(bypass::shut_down))]
    ShutDown,

    #[error("Out of memory: {0}")]
    #[diagnostic(code(bypass::out_of_memory), help("The scratch buffer could not be grown."))]
    OutOfMemory(String),

    #[error("Native I/O failed: {0}")]
    #[diagnostic(code(bypass::native_io))]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(bypass::config),
        help("Check PIPE_BYPASS_* environment variables and the JSON config file.")
    )]
    Config(String),
}

impl From<BypassError> for std::io::Error {
    fn from(err: BypassError) -> Self {
        use std::io::{Error, ErrorKind};
        match err {
            BypassError::Stream(e) => e.into(),
            BypassError::Io(e) => e,
            BypassError::NoDescriptor | BypassError::ShutDown => {
                Error::new(ErrorKind::NotConnected, err)
            }
            BypassError::OutOfMemory(_) => Error::new(ErrorKind::OutOfMemory, err),
            BypassError::InvalidName(_)
            | BypassError::InvalidOperation(_)
            | BypassError::Config(_) => {
                Error::new(ErrorKind::InvalidInput, err)
            }
            other => Error::new(ErrorKind::Other, other),
        }
    }
}
