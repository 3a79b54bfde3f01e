/*!
 * Stream Rundown
 *
 * Process-wide registry of open stream handles. `rundown_all` forces every
 * one of them half-closed and wakes the peer, so no other process stays
 * parked against a stream this process abandoned.
 */

use super::stream::MemStream;
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::info;

/// Registry of live stream handles in this process
pub struct StreamTracker {
    streams: DashMap<u64, Weak<MemStream>, RandomState>,
    next_id: AtomicU64,
}

impl StreamTracker {
    fn new() -> Self {
        Self {
            streams: DashMap::with_hasher(RandomState::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, stream: &Arc<MemStream>) {
        self.streams.insert(stream.id(), Arc::downgrade(stream));
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.streams.remove(&id);
    }

    /// Number of tracked handles still open
    pub fn live_count(&self) -> usize {
        self.streams
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Force every tracked handle half-closed; returns how many were open
    pub fn rundown_all(&self) -> usize {
        // Collect first: rundown must not run while a shard is borrowed
        let live: Vec<Arc<MemStream>> = self
            .streams
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        self.streams.clear();

        let mut count = 0;
        for stream in live {
            if !stream.is_closed() {
                stream.rundown();
                count += 1;
            }
        }
        if count > 0 {
            info!(count, "Ran down open memory streams");
        }
        count
    }
}

/// The process-wide tracker
pub fn tracker() -> &'static StreamTracker {
    static TRACKER: OnceLock<StreamTracker> = OnceLock::new();
    TRACKER.get_or_init(StreamTracker::new)
}

/// Force every open stream of this process half-closed
pub fn rundown_all() -> usize {
    tracker().rundown_all()
}
