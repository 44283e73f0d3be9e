//! Ring and stream integration tests.
//!
//! These exercise the byte-level contract of the circular buffer and the
//! stream facade through separate writer/reader handles on one ring, the way
//! two processes would share it.

use std::time::Duration;

use mercury_core::config::{ChannelConfig, RingConfig};
use mercury_core::{CircularBuffer, MessageStream};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn unique_name(prefix: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    )
}

fn quick_config(ring: RingConfig) -> ChannelConfig {
    ChannelConfig {
        ring,
        read_timeout_ms: 200,
        write_timeout_ms: 200,
        ..ChannelConfig::default()
    }
}

fn pseudo_random_bytes(len: usize, seed: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    let mut x = seed;
    for b in bytes.iter_mut() {
        x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        *b = (x >> 24) as u8;
    }
    bytes
}

#[test]
fn single_message_text_roundtrip() {
    init_logging();
    let name = unique_name("r1");
    let cfg = quick_config(RingConfig::default());
    let producer = MessageStream::open_or_create(&name, &cfg).unwrap();
    let consumer = MessageStream::open_or_create(&name, &cfg).unwrap();

    let line = "This is a test !";
    producer.write(line.as_bytes()).unwrap();

    let mut buf = vec![0u8; line.len()];
    let mut got = 0;
    while got < buf.len() {
        got += consumer.read(&mut buf[got..]).unwrap();
    }
    assert_eq!(std::str::from_utf8(&buf).unwrap(), line);
}

#[test]
fn large_payload_spans_multiple_nodes() {
    init_logging();
    let name = unique_name("r2");
    let geometry = RingConfig::new(512, 32);
    let writer = CircularBuffer::open_or_create(&name, &geometry).unwrap();
    let reader = CircularBuffer::open_or_create(&name, &geometry).unwrap();

    let payload = pseudo_random_bytes(74, 0xC0FF_EE01);
    assert_eq!(
        writer
            .write(&payload, Duration::from_millis(200))
            .unwrap(),
        74
    );

    let mut out = vec![0u8; 74];
    assert_eq!(
        reader.read(&mut out, Duration::from_millis(200)).unwrap(),
        74
    );
    assert_eq!(out, payload, "every byte must match");
}

#[test]
fn back_to_back_alternating_io() {
    init_logging();
    let name = unique_name("r4");
    let geometry = RingConfig::new(512, 32);
    let writer = CircularBuffer::open_or_create(&name, &geometry).unwrap();
    let reader = CircularBuffer::open_or_create(&name, &geometry).unwrap();

    for round in 0u32..3 {
        let payload = pseudo_random_bytes(74, 0xBEEF_0000 + round);
        assert_eq!(
            writer
                .write(&payload, Duration::from_millis(200))
                .unwrap(),
            74
        );

        let mut out = vec![0u8; 74];
        assert_eq!(
            reader.read(&mut out, Duration::from_millis(200)).unwrap(),
            74
        );
        assert_eq!(out, payload, "round {} mismatch", round);
    }
}

#[test]
fn byte_stream_is_fifo_across_many_segments() {
    init_logging();
    let name = unique_name("ring_fifo");
    let geometry = RingConfig::new(64, 16);
    let writer = CircularBuffer::open_or_create(&name, &geometry).unwrap();
    let reader = CircularBuffer::open_or_create(&name, &geometry).unwrap();

    let mut expected = Vec::new();
    let mut received = Vec::new();
    for i in 0u32..50 {
        let segment = pseudo_random_bytes(1 + (i as usize * 7) % 40, i);
        writer
            .write(&segment, Duration::from_millis(200))
            .unwrap();
        expected.extend_from_slice(&segment);

        let mut out = vec![0u8; segment.len()];
        reader.read(&mut out, Duration::from_millis(200)).unwrap();
        received.extend_from_slice(&out);
    }
    assert_eq!(received, expected);
}

#[test]
fn quiescent_node_accounting_holds() {
    init_logging();
    let name = unique_name("ring_p2");
    let geometry = RingConfig::new(16, 8);
    let ring = CircularBuffer::open_or_create(&name, &geometry).unwrap();

    // free + occupied == node_count - 1 at every quiescent point.
    for payload_len in [1usize, 8, 17, 40] {
        let payload = pseudo_random_bytes(payload_len, payload_len as u32);
        ring.write(&payload, Duration::from_millis(200)).unwrap();
        assert_eq!(ring.free_node_count() + ring.occupied_node_count(), 15);

        let mut out = vec![0u8; payload_len];
        ring.read(&mut out, Duration::from_millis(200)).unwrap();
        assert_eq!(ring.free_node_count() + ring.occupied_node_count(), 15);
        assert_eq!(ring.occupied_node_count(), 0);
    }
}

#[test]
fn shutdown_is_reported_to_both_handles() {
    init_logging();
    let name = unique_name("ring_shutdown");
    let cfg = quick_config(RingConfig::new(32, 16));
    let a = MessageStream::open_or_create(&name, &cfg).unwrap();
    let b = MessageStream::open_or_create(&name, &cfg).unwrap();

    b.close();

    let mut buf = [0u8; 4];
    assert!(a.write(b"data").unwrap_err().is_closed());
    assert!(a.read(&mut buf).unwrap_err().is_closed());
    assert!(b.write(b"data").unwrap_err().is_closed());
}
