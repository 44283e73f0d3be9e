//! Connection, framing, and rendezvous integration tests.
//!
//! Each test pairs two endpoints in this process over unique ring names,
//! exercising the same shared-memory path two processes would use.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::bounded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use mercury_core::config::{ChannelConfig, RingConfig};
use mercury_core::{
    BinaryCodec, BytesCodec, Client, Connection, ConnectionBuilder, FrameCodec, MessageStream,
    Role, Server,
};

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

fn quick_config() -> ChannelConfig {
    ChannelConfig {
        ring: RingConfig::new(512, 64),
        read_timeout_ms: 100,
        write_timeout_ms: 100,
        ..ChannelConfig::default()
    }
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Stamp {
    label: String,
    timestamp: String,
}

#[test]
fn structured_value_roundtrip() {
    init_logging();
    let name = unique_name("r3");
    let cfg = quick_config();
    let writer = MessageStream::open_or_create(&name, &cfg).unwrap();
    let reader = MessageStream::open_or_create(&name, &cfg).unwrap();

    let stamp = Stamp {
        label: "created".to_string(),
        timestamp: "2024-01-02T03:04:05.000Z".to_string(),
    };
    let codec = BinaryCodec::<Stamp>::new();

    FrameCodec::write_frame(&writer, &codec, &stamp).unwrap();
    let decoded = FrameCodec::read_frame(&reader, &codec).unwrap().unwrap();
    assert_eq!(decoded, stamp);
}

#[test]
fn parallel_reader_and_writer() {
    init_logging();
    let name = unique_name("r5");
    let cfg = quick_config();
    let writer = MessageStream::open_or_create(&name, &cfg).unwrap();
    let reader = MessageStream::open_or_create(&name, &cfg).unwrap();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
    let expected = payload.clone();

    let (done_tx, done_rx) = bounded::<Vec<u8>>(1);

    let write_thread = std::thread::spawn(move || {
        FrameCodec::write_frame(&writer, &BytesCodec, &payload).unwrap();
    });
    let read_thread = std::thread::spawn(move || {
        let value = FrameCodec::read_frame(&reader, &BytesCodec).unwrap().unwrap();
        done_tx.send(value).unwrap();
    });

    // Both sides must complete well within the 60 s join budget.
    let value = done_rx
        .recv_timeout(Duration::from_millis(60_000))
        .expect("reader did not finish in time");
    assert_eq!(value, expected);

    write_thread.join().unwrap();
    read_thread.join().unwrap();
}

#[test]
fn concurrent_writers_never_interleave_frames() {
    init_logging();
    let name = unique_name("conn_p7");
    let cfg = quick_config();
    let stream = Arc::new(MessageStream::open_or_create(&name, &cfg).unwrap());
    let reader = MessageStream::open_or_create(&name, &cfg).unwrap();

    const FRAMES_PER_WRITER: usize = 50;

    let mut writers = Vec::new();
    for marker in [b'A', b'B'] {
        let stream = Arc::clone(&stream);
        writers.push(std::thread::spawn(move || {
            for i in 0..FRAMES_PER_WRITER {
                // Uniform fill per frame: any interleaving would mix markers.
                let payload = vec![marker; 24 + (i % 8)];
                FrameCodec::write_frame(&stream, &BytesCodec, &payload).unwrap();
            }
        }));
    }

    let mut counts = std::collections::HashMap::new();
    for _ in 0..FRAMES_PER_WRITER * 2 {
        let frame = FrameCodec::read_frame(&reader, &BytesCodec).unwrap().unwrap();
        let marker = frame[0];
        assert!(
            frame.iter().all(|&b| b == marker),
            "frame mixed bytes from two writers"
        );
        *counts.entry(marker).or_insert(0usize) += 1;
    }
    assert_eq!(counts.get(&b'A'), Some(&FRAMES_PER_WRITER));
    assert_eq!(counts.get(&b'B'), Some(&FRAMES_PER_WRITER));

    for writer in writers {
        writer.join().unwrap();
    }
}

#[test]
fn typed_connection_roundtrip() {
    init_logging();
    let name = unique_name("conn_typed");
    let received = Arc::new(Mutex::new(Vec::<Stamp>::new()));

    let sink = Arc::clone(&received);
    let acceptor: Connection<Stamp, Stamp> = ConnectionBuilder::new()
        .config(quick_config())
        .on_message(move |_, stamp: &Stamp| sink.lock().push(stamp.clone()))
        .open(&name, Role::Acceptor)
        .unwrap();

    let initiator: Connection<Stamp, Stamp> = ConnectionBuilder::new()
        .config(quick_config())
        .open(&name, Role::Initiator)
        .unwrap();

    let stamp = Stamp {
        label: "event".to_string(),
        timestamp: "2024-01-02T03:04:05.000Z".to_string(),
    };
    initiator.push_message(stamp.clone());

    assert!(wait_until(Duration::from_secs(5), || !received
        .lock()
        .is_empty()));
    assert_eq!(received.lock().as_slice(), [stamp]);

    drop(initiator);
    drop(acceptor);
}

#[test]
fn messages_pushed_before_peer_opens_are_delivered() {
    init_logging();
    let name = unique_name("conn_early_push");
    let initiator: Connection<String, String> = ConnectionBuilder::new()
        .config(quick_config())
        .open(&name, Role::Initiator)
        .unwrap();

    initiator.push_message("early bird".to_string());
    std::thread::sleep(Duration::from_millis(100));

    let received = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&received);
    let acceptor: Connection<String, String> = ConnectionBuilder::new()
        .config(quick_config())
        .on_message(move |_, msg: &String| sink.lock().push(msg.clone()))
        .open(&name, Role::Acceptor)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !received
        .lock()
        .is_empty()));
    assert_eq!(received.lock().as_slice(), ["early bird".to_string()]);

    drop(initiator);
    drop(acceptor);
}

#[test]
fn server_echoes_to_client() {
    init_logging();
    let name = unique_name("srv_echo");
    let config = ChannelConfig {
        auto_reconnect: false,
        ..quick_config()
    };

    let mut server: Server<String, String> = Server::bind(&name, config.clone(), || {
        ConnectionBuilder::new().on_message(|handle, msg: &String| {
            handle.push_message(format!("echo:{}", msg));
        })
    })
    .unwrap();

    let replies = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&replies);
    let mut client: Client<String, String> = Client::connect(&name, config, move || {
        let sink = Arc::clone(&sink);
        ConnectionBuilder::new().on_message(move |_, msg: &String| sink.lock().push(msg.clone()))
    })
    .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        client.is_connected() && server.connection_count() == 1
    }));

    client.push_message("ping".to_string());
    assert!(wait_until(Duration::from_secs(10), || !replies
        .lock()
        .is_empty()));
    assert_eq!(replies.lock().as_slice(), ["echo:ping".to_string()]);

    client.stop();
    server.stop();
}

#[test]
fn server_broadcasts_to_all_clients() {
    init_logging();
    let name = unique_name("srv_bcast");
    let config = ChannelConfig {
        auto_reconnect: false,
        ..quick_config()
    };

    let mut server: Server<String, String> =
        Server::bind(&name, config.clone(), ConnectionBuilder::new).unwrap();

    let seen_a = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen_b = Arc::new(Mutex::new(Vec::<String>::new()));

    let sink = Arc::clone(&seen_a);
    let mut client_a: Client<String, String> = Client::connect(&name, config.clone(), move || {
        let sink = Arc::clone(&sink);
        ConnectionBuilder::new().on_message(move |_, msg: &String| sink.lock().push(msg.clone()))
    })
    .unwrap();

    let sink = Arc::clone(&seen_b);
    let mut client_b: Client<String, String> = Client::connect(&name, config, move || {
        let sink = Arc::clone(&sink);
        ConnectionBuilder::new().on_message(move |_, msg: &String| sink.lock().push(msg.clone()))
    })
    .unwrap();

    assert!(wait_until(Duration::from_secs(10), || server
        .connection_count()
        == 2));

    server.broadcast("fan-out".to_string());

    assert!(wait_until(Duration::from_secs(10), || {
        !seen_a.lock().is_empty() && !seen_b.lock().is_empty()
    }));
    assert_eq!(seen_a.lock().as_slice(), ["fan-out".to_string()]);
    assert_eq!(seen_b.lock().as_slice(), ["fan-out".to_string()]);

    client_a.stop();
    client_b.stop();
    server.stop();
}

#[test]
fn client_reconnects_after_losing_its_connection() {
    init_logging();
    let name = unique_name("srv_reconnect");
    let config = quick_config(); // auto_reconnect defaults to true

    let accepted = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&accepted);
    let mut server: Server<String, String> = Server::bind(&name, config.clone(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        ConnectionBuilder::new()
    })
    .unwrap();

    let mut client: Client<String, String> =
        Client::connect(&name, config, ConnectionBuilder::new).unwrap();

    assert!(wait_until(Duration::from_secs(10), || client.is_connected()));
    let first_generation = accepted.load(Ordering::SeqCst);
    assert!(first_generation >= 1);

    // Kill the live link; the monitor should dial a fresh one.
    client.handle().unwrap().close();
    assert!(wait_until(Duration::from_secs(15), || {
        client.is_connected() && accepted.load(Ordering::SeqCst) > first_generation
    }));

    client.stop();
    server.stop();
}
