/*!
 * Shared Memory
 * Named segments backing bypass streams and negotiation locks
 */

pub mod naming;
pub mod segment;
pub mod traits;
pub mod types;

pub use naming::{core_device_name, resource_name, segment_name};
pub use segment::SharedSegment;
pub use traits::{HeapBlock, SharedBlock};
pub use types::ShmError;
