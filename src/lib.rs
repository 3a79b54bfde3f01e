/*!
 * Pipe Bypass Library
 *
 * Opportunistic shared memory transport for pipes. Two processes sharing a
 * pipe negotiate through a named lock and, when both agree, move bytes
 * through a ring buffer in shared memory instead of the kernel pipe.
 * Anything short of agreement leaves the pipe untouched.
 */

pub mod api;
pub mod bypass;
pub mod core;
pub mod ipc;
pub mod monitoring;

// Re-exports
pub use api::{shutdown_all, BypassHandle, RundownGuard};
pub use bypass::{NegotiationState, PipeEndpoint, Registry, Session, SessionStats, StallFlags};
pub use crate::core::{BypassConfig, BypassError, BypassResult, Direction, PeerIdentity};
pub use crate::ipc::{MemStream, ReadOutcome, SharedSegment, StreamError, StreamOptions, StreamRole, StreamState};
pub use monitoring::init_tracing;
