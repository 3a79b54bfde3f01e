/*!
 * Shared Segment Tests
 * Named segment creation, reopening and naming
 */

use pipe_bypass::ipc::memstream::{MemStream, StreamOptions, StreamRole};
use pipe_bypass::ipc::shm::{resource_name, segment_name, SharedBlock, SharedSegment, ShmError};
use pipe_bypass::BypassError;
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::Arc;

fn unique(tag: &str) -> String {
    format!("PBSHM_{}_{}", tag, uuid::Uuid::new_v4().simple())
}

#[test]
#[serial]
fn test_second_open_maps_identical_header() {
    let name = unique("idem");
    let first = Arc::new(SharedSegment::create_or_map(&name, 4096).unwrap());
    let second = Arc::new(SharedSegment::create_or_map(&name, 4096).unwrap());
    first.set_unlink_on_drop(true);

    assert!(first.was_created());
    assert!(!second.was_created());
    assert_eq!(first.len(), second.len());

    let _writer = MemStream::create(first.clone(), StreamRole::Writer, &StreamOptions::default()).unwrap();
    let _reader = MemStream::create(second.clone(), StreamRole::Reader, &StreamOptions::default()).unwrap();

    let a = unsafe { &first.bytes()[..64] };
    let b = unsafe { &second.bytes()[..64] };
    assert_eq!(a, b);
    assert!(a.iter().any(|&byte| byte != 0));
}

#[test]
#[serial]
fn test_size_rounds_up_to_page() {
    let name = unique("page");
    let segment = SharedSegment::create_or_map(&name, 100).unwrap();
    segment.set_unlink_on_drop(true);
    assert!(segment.len() >= 100);
    assert_eq!(segment.len() % 4096, 0);
    assert!(unsafe { segment.bytes() }.iter().all(|&b| b == 0));
}

#[test]
#[serial]
fn test_open_requires_existing_segment() {
    let name = unique("missing");
    assert!(matches!(SharedSegment::open(&name, 64), Err(ShmError::NotFound(_))));
}

#[test]
#[serial]
fn test_open_rejects_short_segment() {
    let name = unique("short");
    let created = SharedSegment::create_or_map(&name, 4096).unwrap();
    created.set_unlink_on_drop(true);
    let result = SharedSegment::open(&name, created.len() + 1);
    assert!(matches!(result, Err(ShmError::SizeMismatch { .. })));
}

#[test]
#[serial]
fn test_remove_reports_presence() {
    let name = unique("remove");
    drop(SharedSegment::create_or_map(&name, 64).unwrap());
    assert!(SharedSegment::remove(&name).unwrap());
    assert!(!SharedSegment::remove(&name).unwrap());
}

#[test]
fn test_names_follow_device() {
    let resource = resource_name("PIPEBYPASS_", "_MBA42:").unwrap();
    assert_eq!(resource, "PIPEBYPASS_MBA42");
    assert_eq!(segment_name(&resource, 7), "PIPEBYPASS_MBA42.7");
    assert!(matches!(resource_name("PIPEBYPASS_", ":x"), Err(BypassError::InvalidName(_))));
}
