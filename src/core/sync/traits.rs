/*!
 * Synchronization Traits
 * Shared result types for wake operations
 */

/// Result of a wake operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeResult {
    /// Successfully woke N waiters (N >= 1)
    Woken(usize),
    /// No waiters were waiting
    NoWaiters,
    /// The target process no longer exists
    PeerGone,
}

impl WakeResult {
    /// Check if any waiters were woken
    #[inline(always)]
    pub fn is_woken(&self) -> bool {
        matches!(self, WakeResult::Woken(_))
    }

    /// Check if the wake failed because the target vanished
    #[inline(always)]
    pub fn is_peer_gone(&self) -> bool {
        matches!(self, WakeResult::PeerGone)
    }
}
