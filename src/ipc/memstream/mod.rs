/*!
 * Memory Streams
 * Single-writer/single-reader byte streams over shared blocks
 */

pub mod commbuf;
pub mod rundown;
pub mod stream;
pub mod types;

pub use commbuf::CommbufHeader;
pub use rundown::{rundown_all, tracker, StreamTracker};
pub use stream::{MemStream, StreamOptions};
pub use types::*;
