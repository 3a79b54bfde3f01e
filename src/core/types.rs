/*!
 * Core Types
 * Common types used across the bypass layers
 */

use serde::{Deserialize, Serialize};

/// Process ID type
pub type Pid = u32;

/// Native file descriptor number
pub type Fd = i32;

/// Size type for memory operations
pub type Size = usize;

/// Directional stream identifier, unique per negotiation lock
pub type StreamId = u16;

/// Direction of a transfer as seen by the local process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    /// Parse the collaborator-style "r" / "w" operation string
    pub fn from_op(op: &str) -> Option<Self> {
        match op {
            "r" => Some(Self::Read),
            "w" => Some(Self::Write),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Read => Self::Write,
            Self::Write => Self::Read,
        }
    }

    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "r"),
            Self::Write => write!(f, "w"),
        }
    }
}

/// Identity a process advertises in its negotiation slot
///
/// `instance` distinguishes independent registries inside one process so
/// each can act as a separate peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub pid: Pid,
    pub instance: u32,
}

impl PeerIdentity {
    pub fn new(pid: Pid, instance: u32) -> Self {
        Self { pid, instance }
    }

    /// Identity for the calling process with a fresh instance tag
    pub fn current() -> Self {
        let tag = uuid::Uuid::new_v4().as_u128() as u32;
        // zero is reserved for "no instance"
        Self::new(std::process::id(), tag.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_op() {
        assert_eq!(Direction::from_op("r"), Some(Direction::Read));
        assert_eq!(Direction::from_op("w"), Some(Direction::Write));
        assert_eq!(Direction::from_op("rw"), None);
        assert_eq!(Direction::Read.opposite(), Direction::Write);
    }

    #[test]
    fn test_identity_instances_differ() {
        let a = PeerIdentity::current();
        let b = PeerIdentity::current();
        assert_eq!(a.pid, b.pid);
        assert_ne!(a.instance, 0);
        assert_ne!(a, b);
    }
}
