/*!
 * Memory Stream Tests
 * FIFO, blocking and end-of-stream behaviour of the ring buffer
 */

use pipe_bypass::core::limits::COMMBUF_MIN_BLOCK;
use pipe_bypass::ipc::memstream::{MemStream, StreamAttributes, StreamError, StreamOptions, StreamRole, StreamState};
use pipe_bypass::ipc::shm::HeapBlock;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn pair(len: usize) -> (Arc<MemStream>, Arc<MemStream>) {
    let block = Arc::new(HeapBlock::new(len));
    let options = StreamOptions::default();
    let writer = MemStream::create(block.clone(), StreamRole::Writer, &options).unwrap();
    let reader = MemStream::create(block, StreamRole::Reader, &options).unwrap();
    (writer, reader)
}

fn drain(reader: &MemStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 700];
    loop {
        let outcome = reader.read(&mut buf, 1).unwrap();
        out.extend_from_slice(&buf[..outcome.count]);
        if outcome.is_eof() {
            return out;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_concatenated_reads_equal_writes(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..1500), 1..16)
    ) {
        let (writer, reader) = pair(COMMBUF_MIN_BLOCK);
        let expected: Vec<u8> = chunks.concat();

        let consumer = thread::spawn(move || drain(&reader));
        for chunk in &chunks {
            prop_assert_eq!(writer.write(chunk).unwrap(), chunk.len());
        }
        writer.close().unwrap();

        let received = consumer.join().unwrap();
        prop_assert_eq!(received, expected);
    }
}

#[test]
fn test_write_larger_than_capacity_blocks_until_drained() {
    let (writer, reader) = pair(COMMBUF_MIN_BLOCK);
    let payload = vec![0xA5u8; writer.capacity() * 3 + 17];
    let len = payload.len();

    let producer = thread::spawn(move || writer.write(&payload));
    thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished());

    let mut got = 0;
    let mut buf = vec![0u8; 256];
    while got < len {
        got += reader.read(&mut buf, 1).unwrap().count;
    }
    assert_eq!(producer.join().unwrap().unwrap(), len);
}

#[test]
fn test_read_on_empty_blocks_until_data() {
    let (writer, reader) = pair(COMMBUF_MIN_BLOCK);
    let consumer = thread::spawn(move || {
        let mut buf = [0u8; 16];
        let outcome = reader.read(&mut buf, 5).unwrap();
        buf[..outcome.count].to_vec()
    });

    thread::sleep(Duration::from_millis(50));
    assert!(!consumer.is_finished());
    writer.write(b"abc").unwrap();
    writer.write(b"de").unwrap();
    assert_eq!(consumer.join().unwrap(), b"abcde");
}

#[test]
fn test_read_drains_before_eof() {
    let (writer, reader) = pair(COMMBUF_MIN_BLOCK);
    writer.write(b"tail").unwrap();
    writer.close().unwrap();
    assert!(!reader.is_peer_done());

    let mut buf = [0u8; 16];
    let first = reader.read(&mut buf, 1).unwrap();
    assert_eq!(&buf[..first.count], b"tail");

    let second = reader.read(&mut buf, 1).unwrap();
    assert!(second.is_eof());
    assert!(reader.is_peer_done());
}

#[test]
fn test_closed_reader_breaks_blocked_writer() {
    let (writer, reader) = pair(COMMBUF_MIN_BLOCK);
    let payload = vec![1u8; writer.capacity() * 2];
    let producer = thread::spawn(move || {
        let first = writer.write(&payload);
        let second = writer.write(b"more");
        (first, second)
    });

    thread::sleep(Duration::from_millis(50));
    reader.close().unwrap();

    let (first, second) = producer.join().unwrap();
    match first {
        Ok(n) => assert!(n < 2 * COMMBUF_MIN_BLOCK),
        Err(e) => assert!(matches!(e, StreamError::BrokenPipe)),
    }
    assert!(matches!(second, Err(StreamError::BrokenPipe)));
}

#[test]
fn test_nonblocking_reports_would_block() {
    let (writer, reader) = pair(COMMBUF_MIN_BLOCK);
    reader.set_nonblocking(true);
    writer.control(StreamAttributes::NONBLOCK.bits()).unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(reader.read(&mut buf, 1), Err(StreamError::WouldBlock)));

    let big = vec![7u8; writer.capacity() + 100];
    assert_eq!(writer.write(&big).unwrap(), writer.capacity());
    assert!(matches!(writer.write(b"x"), Err(StreamError::WouldBlock)));
}

#[test]
fn test_query_and_arm() {
    let (writer, reader) = pair(COMMBUF_MIN_BLOCK);
    let q = writer.query(false);
    assert_eq!(q.state, StreamState::Idle);
    assert_eq!(q.pending, 0);
    assert_eq!(q.available, writer.capacity());

    // Arming an idle reader with nothing pending pre-moves it to empty
    let armed = reader.query(true);
    assert_eq!(armed.state, StreamState::Empty);

    writer.write(b"12345").unwrap();
    let q = reader.query(false);
    assert_eq!(q.state, StreamState::Idle);
    assert_eq!(q.pending, 5);
}

#[test]
fn test_unknown_attributes_rejected() {
    let (writer, _reader) = pair(COMMBUF_MIN_BLOCK);
    assert!(matches!(writer.control(0x80), Err(StreamError::InvalidAttributes(0x80))));
}

#[test]
fn test_block_too_small() {
    let block = Arc::new(HeapBlock::new(COMMBUF_MIN_BLOCK - 8));
    let result = MemStream::create(block, StreamRole::Writer, &StreamOptions::default());
    assert!(matches!(result, Err(StreamError::BlockTooSmall { .. })));
}

#[test]
fn test_stats_count_operations() {
    let (writer, reader) = pair(COMMBUF_MIN_BLOCK);
    writer.write(b"one").unwrap();
    writer.write(b"two").unwrap();
    let mut buf = [0u8; 8];
    reader.read(&mut buf, 6).unwrap();

    assert_eq!(writer.stats().operations, 2);
    assert_eq!(reader.stats().operations, 1);
    assert!(writer.stats().segments >= 2);
}

#[test]
fn test_blocked_reader_wakes_promptly() {
    let (writer, reader) = pair(COMMBUF_MIN_BLOCK);
    let consumer = thread::spawn(move || {
        let mut buf = [0u8; 4];
        let start = Instant::now();
        reader.read(&mut buf, 1).unwrap();
        start.elapsed()
    });

    thread::sleep(Duration::from_millis(20));
    writer.write(b"x").unwrap();
    // The wake arrives well before the peer probe interval
    assert!(consumer.join().unwrap() < Duration::from_secs(1));
}
