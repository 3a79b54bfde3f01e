/*!
 * Synchronization Configuration
 *
 * Tuning for the shared spin-then-block lock
 */

use crate::core::limits::{DEFAULT_SEGMENT_LIMIT, DEFAULT_SPIN_RETRY, DEFAULT_SPIN_STALL_MS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// User-facing lock tuning, part of `BypassConfig`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinConfig {
    /// Spin attempts before blocking (multiprocessor only)
    pub initial_retry: u32,
    /// Block timeout between owner liveness probes
    pub stall_ms: u64,
    /// Largest copy performed while holding the ring lock
    pub segment_limit: usize,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            initial_retry: DEFAULT_SPIN_RETRY,
            stall_ms: DEFAULT_SPIN_STALL_MS,
            segment_limit: DEFAULT_SEGMENT_LIMIT,
        }
    }
}

impl SpinConfig {
    /// Configuration for latency-sensitive tests and benches
    pub const fn low_latency() -> Self {
        Self {
            initial_retry: 1_000,
            stall_ms: 5,
            segment_limit: DEFAULT_SEGMENT_LIMIT,
        }
    }

    /// Resolve against the machine this process runs on
    pub fn policy(&self) -> SpinPolicy {
        SpinPolicy::for_cpus(self, available_cpus())
    }
}

/// Resolved lock behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinPolicy {
    /// Spins before blocking; zero on a uniprocessor
    pub spin_limit: u32,
    /// Block timeout between owner liveness probes
    pub stall: Duration,
}

impl SpinPolicy {
    pub fn for_cpus(config: &SpinConfig, cpus: usize) -> Self {
        // Spinning cannot make progress with one core
        let spin_limit = if cpus > 1 { config.initial_retry } else { 0 };
        Self {
            spin_limit,
            stall: Duration::from_millis(config.stall_ms.max(1)),
        }
    }
}

impl Default for SpinPolicy {
    fn default() -> Self {
        SpinConfig::default().policy()
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniprocessor_never_spins() {
        let policy = SpinPolicy::for_cpus(&SpinConfig::default(), 1);
        assert_eq!(policy.spin_limit, 0);
    }

    #[test]
    fn test_multiprocessor_spins() {
        let policy = SpinPolicy::for_cpus(&SpinConfig::default(), 8);
        assert_eq!(policy.spin_limit, DEFAULT_SPIN_RETRY);
        assert_eq!(policy.stall, Duration::from_millis(20));
    }
}
