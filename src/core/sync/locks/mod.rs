/*!
 * Lock-Based Synchronization Primitives
 *
 * - Shared spin-then-block lock for cross-process headers
 */

mod shared;

// Re-export public API
pub use shared::{SharedLock, SharedLockGuard};
