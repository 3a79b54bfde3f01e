/*!
 * Negotiation Lock
 * Per-device shared lock with a two-slot value block used to agree on streams
 */

pub mod resource;
pub mod types;
pub mod valblk;

pub use resource::NegotiationLock;
pub use types::{LockError, LockMode};
pub use valblk::{Slot, SlotFlags, ValueBlock};
