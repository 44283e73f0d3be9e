//! Multi-client server over the handshake rendezvous.
//!
//! The server listens on a well-known buffer name. Per client: it creates a
//! short-lived handshake ring under that name, frame-writes a unique
//! per-connection data-buffer name into it, waits until the client drained
//! the ring, tears the handshake down, and opens a [`Connection`] (acceptor
//! side) on the data name. Cancellation is an explicit stop flag polled by
//! the listener between bounded handshake steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::communication::connection::{Connection, ConnectionBuilder};
use crate::communication::frame::{FrameCodec, TextCodec};
use crate::communication::stream::{MessageStream, Role};
use crate::config::{ChannelConfig, RingConfig};
use crate::error::MercuryResult;
use crate::mercury_internal;

/// Handshake rings are tiny: a name fits in one node, its length prefix in
/// another, and the third slot is the ring's empty gap.
const HANDSHAKE_NODE_COUNT: u32 = 3;
const HANDSHAKE_NODE_SIZE: u32 = 4096;

/// How long the listener waits per drain poll before re-checking the stop
/// flag.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Pause after a failed handshake step before re-arming.
const REARM_DELAY: Duration = Duration::from_millis(100);

/// The channel config with the ring geometry replaced by the fixed handshake
/// geometry.
pub(crate) fn handshake_config(base: &ChannelConfig) -> ChannelConfig {
    ChannelConfig {
        ring: RingConfig::new(HANDSHAKE_NODE_COUNT, HANDSHAKE_NODE_SIZE),
        ..base.clone()
    }
}

/// Multi-client server: listener thread + connection set + broadcast fan-out.
pub struct Server<R, W> {
    name: String,
    connections: Arc<Mutex<Vec<Connection<R, W>>>>,
    stop: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl<R: 'static, W: Send + 'static> Server<R, W> {
    /// Start listening on `name`. `builder_factory` produces the listener
    /// set for each accepted connection; the server applies `config` to it
    /// so every data ring shares one geometry.
    pub fn bind<F>(name: &str, config: ChannelConfig, builder_factory: F) -> MercuryResult<Self>
    where
        F: Fn() -> ConnectionBuilder<R, W> + Send + 'static,
    {
        let connections: Arc<Mutex<Vec<Connection<R, W>>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let listener = {
            let name = name.to_string();
            let connections = Arc::clone(&connections);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("mercury-listen-{}", name))
                .spawn(move || listen_loop(name, config, builder_factory, connections, stop))
                .map_err(|e| mercury_internal!("failed to spawn listener: {}", e))?
        };

        log::info!("Server listening on '{}'", name);

        Ok(Self {
            name: name.to_string(),
            connections,
            stop,
            listener: Some(listener),
        })
    }

    /// Enqueue `message` on every live connection, dropping dead ones.
    pub fn broadcast(&self, message: W)
    where
        W: Clone,
    {
        let mut connections = self.connections.lock();
        connections.retain(|connection| {
            if connection.is_closed() {
                false
            } else {
                connection.push_message(message.clone());
                true
            }
        });
    }

    /// Number of currently live connections.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Stop listening and close every connection. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
        let drained: Vec<_> = std::mem::take(&mut *self.connections.lock());
        for connection in &drained {
            connection.close();
        }
        // Dropping joins each connection's pumps.
        drop(drained);
        log::info!("Server '{}' stopped", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<R, W> Drop for Server<R, W> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
        self.connections.lock().clear();
    }
}

fn listen_loop<R: 'static, W: Send + 'static, F>(
    name: String,
    config: ChannelConfig,
    builder_factory: F,
    connections: Arc<Mutex<Vec<Connection<R, W>>>>,
    stop: Arc<AtomicBool>,
) where
    F: Fn() -> ConnectionBuilder<R, W> + Send + 'static,
{
    let hs_config = handshake_config(&config);
    let mut seq = 0u64;

    while !stop.load(Ordering::Acquire) {
        seq += 1;
        let data_name = format!("{}_{}_{}", name, std::process::id(), seq);

        // Arm the handshake ring and offer the data name.
        let handshake = match MessageStream::open_or_create(&name, &hs_config) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Handshake ring '{}' unavailable: {}", name, e);
                thread::sleep(REARM_DELAY);
                continue;
            }
        };
        if !handshake.ring().is_owner() {
            // A previous server crashed and left its handshake ring behind.
            log::warn!("Clearing stale handshake ring '{}'", name);
            handshake.close();
            handshake.ring().force_cleanup();
            drop(handshake);
            thread::sleep(REARM_DELAY);
            continue;
        }
        if let Err(e) = FrameCodec::write_frame(&handshake, &TextCodec, &data_name) {
            log::warn!("Handshake offer on '{}' failed: {}", name, e);
            handshake.close();
            thread::sleep(REARM_DELAY);
            continue;
        }

        // Wait until a client consumed the offer, polling the stop flag.
        let consumed = loop {
            if stop.load(Ordering::Acquire) {
                break false;
            }
            if handshake.ring().wait_drain(DRAIN_POLL) {
                break true;
            }
            if handshake.is_closed() {
                break false;
            }
        };
        handshake.close();
        drop(handshake); // owner side unlinks the handshake ring

        if !consumed {
            continue;
        }

        match builder_factory()
            .config(config.clone())
            .open(&data_name, Role::Acceptor)
        {
            Ok(connection) => {
                log::info!("Accepted connection '{}'", data_name);
                connections.lock().push(connection);
            }
            Err(e) => log::warn!("Failed to open accepted connection '{}': {}", data_name, e),
        }
    }
}
