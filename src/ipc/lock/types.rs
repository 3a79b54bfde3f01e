/*!
 * Negotiation Lock Types
 */

use crate::ipc::shm::ShmError;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hold level on the lock resource
///
/// `ProtectedWrite` is the exclusive mode in which the value block may be
/// read and rewritten; `Concurrent` means a slot is claimed and the value
/// block has been written back for the peer to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Null,
    Concurrent,
    ProtectedWrite,
}

/// Negotiation lock errors
#[derive(Debug, Error, Diagnostic)]
pub enum LockError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Shm(#[from] ShmError),

    #[error("Both slots of {0} are held by live peers")]
    #[diagnostic(
        code(lock::no_free_slot),
        help("A third process is using the same pipe; the bypass is skipped for it.")
    )]
    NoFreeSlot(String),

    #[error("Lock resource {0} has a foreign layout")]
    #[diagnostic(code(lock::corrupt), help("Another program is using the same resource name."))]
    Corrupt(String),

    #[error("Advisory lock on {resource} failed: {source}")]
    #[diagnostic(code(lock::flock))]
    Flock {
        resource: String,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Lock {0} is not held in exclusive mode")]
    #[diagnostic(code(lock::not_held))]
    NotHeld(String),

    #[error("Lock {0} was released")]
    #[diagnostic(code(lock::released))]
    Released(String),
}
