/*!
 * Limits and Constants
 *
 * Centralized location for protocol constants, buffer sizes and timing
 * defaults. Values marked [WIRE] are part of the cross-process contract and
 * must match between peers.
 */

use std::time::Duration;

// =============================================================================
// RING BUFFER (MEMSTREAM)
// =============================================================================

/// Ring buffer header format version [WIRE]
pub const COMMBUF_FMT_VERSION: u16 = 1;

/// Ring buffer IPC protocol version [WIRE]
pub const COMMBUF_IPC_VERSION: u16 = 1;

/// Size of the ring buffer header that precedes the data area [WIRE]
pub const COMMBUF_HEADER_SIZE: usize = 64;

/// Smallest data area a block may carry
pub const COMMBUF_MIN_DATA: usize = 512;

/// Smallest block accepted by `MemStream::create`
pub const COMMBUF_MIN_BLOCK: usize = COMMBUF_HEADER_SIZE + COMMBUF_MIN_DATA;

/// Largest single copy performed under the header lock (bytes)
/// Clamped per stream to half the data area
pub const DEFAULT_SEGMENT_LIMIT: usize = 4096;

// =============================================================================
// SPIN-THEN-BLOCK LOCK
// =============================================================================

/// Spin attempts before blocking on a multiprocessor
pub const DEFAULT_SPIN_RETRY: u32 = 100_000;

/// Block timeout between owner liveness probes (milliseconds)
pub const DEFAULT_SPIN_STALL_MS: u64 = 20;

// =============================================================================
// NEGOTIATION
// =============================================================================

/// Prefix prepended to the sanitized device name [WIRE]
pub const DEFAULT_RESOURCE_PREFIX: &str = "PIPEBYPASS_";

/// Longest resource name accepted (prefix included)
pub const MAX_RESOURCE_NAME: usize = 64;

/// Size of one shared stream block (64KB)
pub const DEFAULT_BLOCK_SIZE: usize = 0x10000;

/// Upper bound on waiting for a peer to answer a connect request
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Startup stall before concluding no peer is coming
pub const DEFAULT_STARTUP_STALL: Duration = Duration::from_millis(200);

/// Granularity of bounded waits; peers are re-probed at this interval
pub const DEFAULT_PEER_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Number of slots in the negotiation value block [WIRE]
pub const VALBLK_SLOTS: usize = 2;

/// Encoded size of one value block slot [WIRE]
pub const VALBLK_SLOT_SIZE: usize = 16;

/// Encoded size of the whole value block [WIRE]
pub const VALBLK_SIZE: usize = VALBLK_SLOTS * VALBLK_SLOT_SIZE;

/// Magic tag at the start of a negotiation lock object ("NLK1") [WIRE]
pub const LOCK_MAGIC: u32 = 0x314B_4C4E;

// =============================================================================
// SESSIONS
// =============================================================================

/// Scratch buffer owned by each session
pub const BYPASS_SCRATCH_SIZE: usize = 1024;

/// Alternate reader device buffer (native pipe buffer plus delimiter room)
pub const ALT_READER_BUFSIZE: usize = 4096 + 2;

/// Environment variable prefix for the stderr side channel
pub const STDERR_CHANNEL_PREFIX: &str = "PIPE_BYPASS_STDERR_";
