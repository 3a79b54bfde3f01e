/*!
 * Bypass Types
 * Negotiation states, stall flags and session statistics
 */

use crate::ipc::memstream::StreamStatsSnapshot;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Per-direction progress of a session
///
/// `Established` and `Fallback` are terminal: once reached, no further
/// negotiation happens for that session and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    #[default]
    Unclassified,
    Eligible,
    Negotiating,
    Established,
    Fallback,
}

impl NegotiationState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Established | Self::Fallback)
    }
}

bitflags! {
    /// Capability flags exchanged with the interception layer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StallFlags: u32 {
        /// Some direction is still negotiable
        const STARTING = 1 << 0;
        /// Reads go through an established stream
        const READS = 1 << 1;
        /// Writes go through an established stream
        const WRITES = 1 << 2;
        /// The peer is a spawned child; a failed read negotiation installs
        /// the alternate reader
        const SPAWNED_READER = 1 << 3;
    }
}

/// Why a direction ended on the native path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The nexus has no usable negotiation lock
    NoLock,
    /// A shutdown is recorded on one side of the lock
    Shutdown,
    /// No peer claimed the other slot during the startup stall
    NoPeer,
    /// Both sides asked for the same direction
    Conflict,
    /// The peer answered our proposal with a nak
    Refused,
    /// The peer never answered our proposal
    Timeout,
    /// The lock is in a state outside the known outcomes
    Unexpected,
    /// A lock, segment or stream operation failed
    Failed,
}

/// Outcome of a startup stall for one direction
#[derive(Debug)]
pub enum Verdict {
    Established(std::sync::Arc<crate::ipc::memstream::MemStream>),
    Fallback(FallbackReason),
}

/// Serializable view of a session's activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub device: String,
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_state: NegotiationState,
    pub write_state: NegotiationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_stream: Option<StreamStatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_stream: Option<StreamStatsSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!NegotiationState::Unclassified.is_terminal());
        assert!(!NegotiationState::Negotiating.is_terminal());
        assert!(NegotiationState::Established.is_terminal());
        assert!(NegotiationState::Fallback.is_terminal());
    }

    #[test]
    fn test_stall_flag_bits_match_collaborator_layout() {
        assert_eq!(StallFlags::STARTING.bits(), 1);
        assert_eq!(StallFlags::READS.bits(), 2);
        assert_eq!(StallFlags::WRITES.bits(), 4);
        assert_eq!(StallFlags::SPAWNED_READER.bits(), 8);
    }
}
