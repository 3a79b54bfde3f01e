/*!
 * Resource Naming
 *
 * Names shared by both peers of a pipe: the negotiation lock resource is
 * `prefix + core device name`, and each directional stream segment is
 * `resource + "." + stream id`.
 */

use crate::core::errors::{BypassError, BypassResult};
use crate::core::limits::MAX_RESOURCE_NAME;
use crate::core::types::StreamId;

/// Core device name: leading underscores stripped, cut at the first colon
pub fn core_device_name(device: &str) -> &str {
    let trimmed = device.trim_start_matches('_');
    match trimmed.find(':') {
        Some(colon) => &trimmed[..colon],
        None => trimmed,
    }
}

/// Negotiation lock resource name for a device
pub fn resource_name(prefix: &str, device: &str) -> BypassResult<String> {
    let core = core_device_name(device);
    if core.is_empty() || core.contains('/') || core.contains('\0') {
        return Err(BypassError::InvalidName(device.to_string()));
    }

    let name = format!("{}{}", prefix, core);
    if name.len() > MAX_RESOURCE_NAME {
        return Err(BypassError::InvalidName(device.to_string()));
    }
    Ok(name)
}

/// Shared segment name for one directional stream
pub fn segment_name(resource: &str, stream_id: StreamId) -> String {
    format!("{}.{}", resource, stream_id)
}
