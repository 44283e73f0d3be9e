//! Client side of the handshake rendezvous.
//!
//! `connect` opens the server's handshake ring, frame-reads the
//! per-connection data-buffer name, and opens a [`Connection`] (initiator
//! side) on it. With `auto_reconnect` enabled a monitor thread re-runs the
//! handshake after a disconnect until the client is stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::communication::connection::{Connection, ConnectionBuilder, ConnectionHandle};
use crate::communication::frame::{FrameCodec, TextCodec};
use crate::communication::server::handshake_config;
use crate::communication::stream::{MessageStream, Role};
use crate::config::ChannelConfig;
use crate::error::{MercuryError, MercuryResult};
use crate::mercury_internal;

/// Pause between handshake attempts.
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Budget per reconnect attempt, and the pause between failed ones.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Client wrapper: one live connection plus an optional reconnect monitor.
pub struct Client<R, W> {
    name: String,
    connection: Arc<Mutex<Option<Connection<R, W>>>>,
    stop: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl<R: 'static, W: Send + 'static> Client<R, W> {
    /// Connect to the server listening on `name`. The initial handshake gets
    /// the config's spin-acquire budget; with `auto_reconnect` a monitor
    /// thread keeps re-dialing after disconnects.
    pub fn connect<F>(name: &str, config: ChannelConfig, builder_factory: F) -> MercuryResult<Self>
    where
        F: Fn() -> ConnectionBuilder<R, W> + Send + Sync + 'static,
    {
        let builder_factory = Arc::new(builder_factory);
        let connection = rendezvous(
            name,
            &config,
            builder_factory.as_ref(),
            config.spin_acquire_timeout(),
        )?;
        let connection = Arc::new(Mutex::new(Some(connection)));
        let stop = Arc::new(AtomicBool::new(false));

        let monitor = if config.auto_reconnect {
            let name = name.to_string();
            let connection = Arc::clone(&connection);
            let stop = Arc::clone(&stop);
            let factory = Arc::clone(&builder_factory);
            Some(
                thread::Builder::new()
                    .name(format!("mercury-reconnect-{}", name))
                    .spawn(move || monitor_loop(name, config, factory, connection, stop))
                    .map_err(|e| mercury_internal!("failed to spawn reconnect monitor: {}", e))?,
            )
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            connection,
            stop,
            monitor,
        })
    }

    /// Enqueue a message on the current connection; dropped while
    /// disconnected.
    pub fn push_message(&self, message: W) {
        if let Some(connection) = self.connection.lock().as_ref() {
            connection.push_message(message);
        }
    }

    /// A non-owning handle to the current connection, if any.
    pub fn handle(&self) -> Option<ConnectionHandle<W>> {
        self.connection.lock().as_ref().map(|c| c.handle())
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Stop reconnecting and close the current connection. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
        if let Some(connection) = self.connection.lock().take() {
            connection.close();
            // Dropping joins the pumps.
        }
        log::info!("Client '{}' stopped", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<R, W> Drop for Client<R, W> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
        self.connection.lock().take();
    }
}

/// Run the handshake: read the data-buffer name from the server's handshake
/// ring, then open the data connection as initiator.
fn rendezvous<R: 'static, W: Send + 'static, F>(
    name: &str,
    config: &ChannelConfig,
    builder_factory: &F,
    budget: Duration,
) -> MercuryResult<Connection<R, W>>
where
    F: Fn() -> ConnectionBuilder<R, W>,
{
    let deadline = Instant::now() + budget;
    loop {
        match rendezvous_once(name, config, builder_factory, deadline) {
            Ok(connection) => return Ok(connection),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(MercuryError::communication(format!(
                        "handshake with '{}' failed within {:?}: {}",
                        name, budget, e
                    )));
                }
                thread::sleep(CONNECT_RETRY);
            }
        }
    }
}

fn rendezvous_once<R: 'static, W: Send + 'static, F>(
    name: &str,
    config: &ChannelConfig,
    builder_factory: &F,
    deadline: Instant,
) -> MercuryResult<Connection<R, W>>
where
    F: Fn() -> ConnectionBuilder<R, W>,
{
    let handshake = MessageStream::open_existing(name, &handshake_config(config))?;
    let data_name = match FrameCodec::read_frame_deadline(&handshake, &TextCodec, Some(deadline))?
    {
        Some(data_name) => data_name,
        // A stale ring from a finished handshake; retry against a fresh one.
        None => {
            return Err(MercuryError::communication(format!(
                "handshake ring '{}' closed before offering a name",
                name
            )))
        }
    };
    drop(handshake);

    log::info!("Handshake on '{}' offered data buffer '{}'", name, data_name);

    builder_factory()
        .config(config.clone())
        .open(&data_name, Role::Initiator)
}

fn monitor_loop<R: 'static, W: Send + 'static, F>(
    name: String,
    config: ChannelConfig,
    builder_factory: Arc<F>,
    connection: Arc<Mutex<Option<Connection<R, W>>>>,
    stop: Arc<AtomicBool>,
) where
    F: Fn() -> ConnectionBuilder<R, W> + Send + Sync + 'static,
{
    while !stop.load(Ordering::Acquire) {
        thread::sleep(RECONNECT_BACKOFF);
        if stop.load(Ordering::Acquire) {
            break;
        }

        let disconnected = connection
            .lock()
            .as_ref()
            .map(|c| c.is_closed())
            .unwrap_or(true);
        if !disconnected {
            continue;
        }

        match rendezvous(
            &name,
            &config,
            builder_factory.as_ref(),
            RECONNECT_BACKOFF,
        ) {
            Ok(fresh) => {
                log::info!("Client '{}' reconnected", name);
                *connection.lock() = Some(fresh);
            }
            Err(e) => log::debug!("Client '{}' reconnect attempt failed: {}", name, e),
        }
    }
}
