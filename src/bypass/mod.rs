/*!
 * Bypass
 * Sessions, per-device nexuses and the negotiation that attaches them to
 * shared memory streams
 */

pub mod alternate;
pub mod device;
pub mod endpoint;
mod negotiate;
pub mod nexus;
pub mod registry;
pub mod session;
pub mod stderr;
pub mod types;

pub use alternate::AlternateReader;
pub use endpoint::PipeEndpoint;
pub use nexus::Nexus;
pub use registry::Registry;
pub use session::Session;
pub use types::{FallbackReason, NegotiationState, SessionStats, StallFlags, Verdict};
