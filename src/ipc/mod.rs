/*!
 * IPC Module
 * Shared memory segments, memory streams and the negotiation lock
 */

pub mod lock;
pub mod memstream;
pub mod shm;

// Re-export for convenience
pub use lock::{LockError, LockMode, NegotiationLock};
pub use memstream::{MemStream, ReadOutcome, StreamError, StreamOptions, StreamRole, StreamState};
pub use shm::{SharedBlock, SharedSegment, ShmError};
