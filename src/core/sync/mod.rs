/*!
 * Synchronization Primitives
 *
 * Cross-process wait/notify and mutual exclusion over shared memory:
 * - Futex wait/wake on sequence words (Linux), bounded sleep elsewhere
 * - Spin-then-block lock whose spin budget follows the CPU count
 * - Peer liveness probes used to break waits on vanished processes
 */

mod config;
mod futex;
mod locks;
mod peer;
mod traits;

pub use config::{SpinConfig, SpinPolicy};
pub use futex::{futex_signal, futex_wait, futex_wake};
pub use locks::{SharedLock, SharedLockGuard};
pub use peer::{process_alive, wake_process};
pub use traits::WakeResult;
