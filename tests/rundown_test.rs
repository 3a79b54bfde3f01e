/*!
 * Rundown Tests
 *
 * Kept in their own binary: a process-wide rundown closes every stream
 * the process holds.
 */

use pipe_bypass::api::{self, RundownGuard};
use pipe_bypass::core::limits::COMMBUF_MIN_BLOCK;
use pipe_bypass::ipc::memstream::{rundown_all, tracker, MemStream, StreamError, StreamOptions, StreamRole};
use pipe_bypass::ipc::shm::HeapBlock;
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn pair() -> (Arc<MemStream>, Arc<MemStream>) {
    let block = Arc::new(HeapBlock::new(COMMBUF_MIN_BLOCK));
    let options = StreamOptions::default();
    let writer = MemStream::create(block.clone(), StreamRole::Writer, &options).unwrap();
    let reader = MemStream::create(block, StreamRole::Reader, &options).unwrap();
    (writer, reader)
}

#[test]
#[serial]
fn test_rundown_releases_parked_reader() {
    let (writer, reader) = pair();
    assert_eq!(tracker().live_count(), 2);

    let consumer = {
        let reader = Arc::clone(&reader);
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf, 1)
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!consumer.is_finished());

    assert_eq!(rundown_all(), 2);
    // Either side may be run down first; the reader is released both ways
    match consumer.join().unwrap() {
        Ok(outcome) => assert!(outcome.is_eof()),
        Err(e) => assert!(matches!(e, StreamError::Aborted(_))),
    }
    assert!(writer.is_closed());
    assert!(matches!(writer.write(b"late"), Err(StreamError::NotOpen)));
    assert_eq!(tracker().live_count(), 0);
}

#[test]
#[serial]
fn test_closed_streams_are_not_run_down() {
    let (writer, reader) = pair();
    writer.close().unwrap();
    reader.close().unwrap();
    assert_eq!(rundown_all(), 0);
}

#[test]
#[serial]
fn test_guard_runs_down_on_drop() {
    let (writer, reader) = pair();
    {
        let _guard = RundownGuard::new();
        assert!(!writer.is_closed());
    }
    assert!(writer.is_closed());
    assert!(reader.is_closed());
    // nothing left for a second pass
    assert_eq!(api::shutdown_all(), 0);
}
