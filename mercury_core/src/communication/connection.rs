//! Full-duplex typed connection over a shared-memory duplex stream.
//!
//! A [`Connection`] owns one [`DuplexStream`] and two background workers: a
//! read pump looping on [`FrameCodec::read_frame`] and a write pump draining
//! an unbounded write queue. Listeners (`on_message`, `on_disconnect`,
//! `on_error`) are registered up front on a [`ConnectionBuilder`]; they
//! receive a non-owning [`ConnectionHandle`] so a callback can push or close
//! without creating an ownership cycle.
//!
//! Pump error policy: recoverable errors (deadline misses, full rings, bad
//! payloads) are routed to `on_error` and the pump continues; `Closed` ends
//! the pump quietly; anything else tears the connection down. A panicking
//! listener is caught and reported — it never kills a pump.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::communication::frame::{Codec, FrameCodec, TieredCodec};
use crate::communication::stream::{DuplexStream, Role};
use crate::config::ChannelConfig;
use crate::error::{MercuryError, MercuryResult};
use crate::mercury_internal;

/// Write pump wake-up interval; also bounds how fast a close is observed.
const PUMP_POLL: Duration = Duration::from_millis(50);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    New = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            3 => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// One-shot manual-reset completion event.
pub(crate) struct EventFlag {
    state: Mutex<bool>,
    cvar: Condvar,
}

impl EventFlag {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        let mut signaled = self.state.lock();
        *signaled = true;
        self.cvar.notify_all();
    }

    /// Wait until the event is set or `timeout` elapses. Returns whether the
    /// event is set.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.state.lock();
        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.cvar.wait_for(&mut signaled, deadline - now);
        }
        *signaled
    }
}

/// Shared, non-generic control state for one connection.
struct ControlBlock {
    stream: DuplexStream,
    state: AtomicU8,
    disconnect_notified: AtomicBool,
    pumps_live: AtomicU32,
    opened: EventFlag,
    closed: EventFlag,
}

impl ControlBlock {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Idempotent transition into Closing; sets the sticky shutdown flag on
    /// both rings, which unblocks both pumps within one polling interval.
    fn begin_close(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::New as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.stream.close();
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open && !self.stream.is_closed()
    }
}

/// Non-owning handle given to event listeners (and clonable by users).
///
/// Holds only the write sender and a weak reference to the control block, so
/// listeners can never keep a closed connection alive.
pub struct ConnectionHandle<W> {
    write_tx: Sender<W>,
    control: Weak<ControlBlock>,
}

impl<W> Clone for ConnectionHandle<W> {
    fn clone(&self) -> Self {
        Self {
            write_tx: self.write_tx.clone(),
            control: self.control.clone(),
        }
    }
}

impl<W> ConnectionHandle<W> {
    /// Enqueue a message for the write pump. Never blocks for I/O; a message
    /// pushed after close is dropped.
    pub fn push_message(&self, message: W) {
        let _ = self.write_tx.send(message);
    }

    /// Request connection close. Idempotent, never fails.
    pub fn close(&self) {
        if let Some(control) = self.control.upgrade() {
            control.begin_close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.control
            .upgrade()
            .map(|control| control.is_connected())
            .unwrap_or(false)
    }
}

type MessageListener<R, W> = Box<dyn Fn(&ConnectionHandle<W>, &R) + Send + Sync>;
type DisconnectListener<W> = Box<dyn Fn(&ConnectionHandle<W>) + Send + Sync>;
type ErrorListener<W> = Box<dyn Fn(&ConnectionHandle<W>, &MercuryError) + Send + Sync>;

/// Builder for a [`Connection`]: codecs, config, and listeners are fixed at
/// open time.
pub struct ConnectionBuilder<R, W> {
    config: ChannelConfig,
    codec_r: Box<dyn Codec<R>>,
    codec_w: Box<dyn Codec<W>>,
    on_message: Vec<MessageListener<R, W>>,
    on_disconnect: Vec<DisconnectListener<W>>,
    on_error: Vec<ErrorListener<W>>,
}

impl<R, W> ConnectionBuilder<R, W>
where
    R: Serialize + DeserializeOwned + 'static,
    W: Serialize + DeserializeOwned + Send + 'static,
{
    /// Builder with the default two-tier serde codec on both directions.
    pub fn new() -> Self {
        Self::with_codecs(
            Box::new(TieredCodec::<R>::new()),
            Box::new(TieredCodec::<W>::new()),
        )
    }
}

impl<R, W> Default for ConnectionBuilder<R, W>
where
    R: Serialize + DeserializeOwned + 'static,
    W: Serialize + DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<R: 'static, W: Send + 'static> ConnectionBuilder<R, W> {
    /// Builder with caller-supplied codecs.
    pub fn with_codecs(codec_r: Box<dyn Codec<R>>, codec_w: Box<dyn Codec<W>>) -> Self {
        Self {
            config: ChannelConfig::default(),
            codec_r,
            codec_w,
            on_message: Vec::new(),
            on_disconnect: Vec::new(),
            on_error: Vec::new(),
        }
    }

    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a message listener. Messages are delivered in ring order,
    /// from the read pump thread.
    pub fn on_message(
        mut self,
        listener: impl Fn(&ConnectionHandle<W>, &R) + Send + Sync + 'static,
    ) -> Self {
        self.on_message.push(Box::new(listener));
        self
    }

    /// Register a disconnect listener; fired exactly once per connection,
    /// after the last delivered message.
    pub fn on_disconnect(
        mut self,
        listener: impl Fn(&ConnectionHandle<W>) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect.push(Box::new(listener));
        self
    }

    /// Register an error listener for recoverable pump errors and listener
    /// panics.
    pub fn on_error(
        mut self,
        listener: impl Fn(&ConnectionHandle<W>, &MercuryError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error.push(Box::new(listener));
        self
    }

    /// Open the duplex stream and start both pumps.
    pub fn open(self, name: &str, role: Role) -> MercuryResult<Connection<R, W>> {
        let stream = DuplexStream::open_or_create(name, role, &self.config)?;
        Connection::start(name, stream, self)
    }
}

/// A full-duplex typed connection: read pump, write pump, write queue.
pub struct Connection<R, W> {
    control: Arc<ControlBlock>,
    write_tx: Sender<W>,
    read_pump: Option<JoinHandle<()>>,
    write_pump: Option<JoinHandle<()>>,
    name: String,
    _marker: PhantomData<fn() -> R>,
}

impl<R: 'static, W: Send + 'static> Connection<R, W> {
    fn start(
        name: &str,
        stream: DuplexStream,
        builder: ConnectionBuilder<R, W>,
    ) -> MercuryResult<Self> {
        let control = Arc::new(ControlBlock {
            stream,
            state: AtomicU8::new(ConnectionState::New as u8),
            disconnect_notified: AtomicBool::new(false),
            pumps_live: AtomicU32::new(2),
            opened: EventFlag::new(),
            closed: EventFlag::new(),
        });
        let (write_tx, write_rx) = unbounded::<W>();
        let handle = ConnectionHandle {
            write_tx: write_tx.clone(),
            control: Arc::downgrade(&control),
        };

        let on_error = Arc::new(builder.on_error);
        let on_disconnect = Arc::new(builder.on_disconnect);

        // Open before the pumps start so a pump that dies immediately moves
        // the state forward, never backward.
        control
            .state
            .store(ConnectionState::Open as u8, Ordering::Release);
        control.opened.set();

        let read_pump = {
            let control = Arc::clone(&control);
            let codec = builder.codec_r;
            let on_message = builder.on_message;
            let on_error = Arc::clone(&on_error);
            let on_disconnect = Arc::clone(&on_disconnect);
            let handle = handle.clone();
            thread::Builder::new()
                .name(format!("mercury-read-{}", name))
                .spawn(move || {
                    run_read_pump(control, codec, on_message, on_error, on_disconnect, handle)
                })
                .map_err(|e| mercury_internal!("failed to spawn read pump: {}", e))?
        };

        let write_pump = {
            let control_for_pump = Arc::clone(&control);
            let codec = builder.codec_w;
            let on_error = Arc::clone(&on_error);
            let on_disconnect = Arc::clone(&on_disconnect);
            let handle = handle.clone();
            match thread::Builder::new()
                .name(format!("mercury-write-{}", name))
                .spawn(move || {
                    run_write_pump(
                        control_for_pump,
                        codec,
                        write_rx,
                        on_error,
                        on_disconnect,
                        handle,
                    )
                }) {
                Ok(join_handle) => join_handle,
                Err(e) => {
                    control.begin_close();
                    let _ = read_pump.join();
                    return Err(mercury_internal!("failed to spawn write pump: {}", e));
                }
            }
        };

        log::debug!("Connection '{}' opened", name);

        Ok(Self {
            control,
            write_tx,
            read_pump: Some(read_pump),
            write_pump: Some(write_pump),
            name: name.to_string(),
            _marker: PhantomData,
        })
    }
}

impl<R, W> Connection<R, W> {
    /// Enqueue a message for the write pump. Never blocks for I/O.
    pub fn push_message(&self, message: W) {
        let _ = self.write_tx.send(message);
    }

    /// A non-owning handle usable from any thread (and from listeners).
    pub fn handle(&self) -> ConnectionHandle<W> {
        ConnectionHandle {
            write_tx: self.write_tx.clone(),
            control: Arc::downgrade(&self.control),
        }
    }

    /// Request close. Idempotent, never fails; both pumps exit within one
    /// polling interval and `on_disconnect` fires exactly once.
    pub fn close(&self) {
        self.control.begin_close();
    }

    pub fn state(&self) -> ConnectionState {
        self.control.state()
    }

    pub fn is_connected(&self) -> bool {
        self.control.is_connected()
    }

    /// True iff the underlying stream is closed.
    pub fn is_closed(&self) -> bool {
        self.control.stream.is_closed()
    }

    /// Wait until the connection reached Open (set at `open`, so this only
    /// ever waits on a connection still being constructed elsewhere).
    pub fn wait_open(&self, timeout: Duration) -> bool {
        self.control.opened.wait(timeout)
    }

    /// Wait until both pumps exited and `on_disconnect` was delivered.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        self.control.closed.wait(timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<R, W> Drop for Connection<R, W> {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.read_pump.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.write_pump.take() {
            let _ = handle.join();
        }
    }
}

/// A payload rejected by the codec or framing rules is the caller's bug, not
/// a link failure; only transport-level errors tear the connection down.
fn is_pump_fatal(error: &MercuryError) -> bool {
    error.is_fatal() && !matches!(error, MercuryError::Config(_))
}

fn fire_error<W>(
    listeners: &[ErrorListener<W>],
    handle: &ConnectionHandle<W>,
    error: &MercuryError,
) {
    for listener in listeners {
        let _ = catch_unwind(AssertUnwindSafe(|| listener(handle, error)));
    }
}

fn run_read_pump<R, W>(
    control: Arc<ControlBlock>,
    codec: Box<dyn Codec<R>>,
    on_message: Vec<MessageListener<R, W>>,
    on_error: Arc<Vec<ErrorListener<W>>>,
    on_disconnect: Arc<Vec<DisconnectListener<W>>>,
    handle: ConnectionHandle<W>,
) {
    loop {
        if control.state() != ConnectionState::Open {
            break;
        }
        match FrameCodec::read_frame(control.stream.inbound(), codec.as_ref()) {
            Ok(Some(message)) => {
                for listener in &on_message {
                    let delivery = catch_unwind(AssertUnwindSafe(|| listener(&handle, &message)));
                    if delivery.is_err() {
                        fire_error(
                            &on_error,
                            &handle,
                            &mercury_internal!("message listener panicked"),
                        );
                    }
                }
            }
            // Clean end of stream.
            Ok(None) => break,
            Err(e) if e.is_closed() => break,
            Err(e) if !is_pump_fatal(&e) => fire_error(&on_error, &handle, &e),
            Err(e) => {
                log::warn!("Read pump on '{}' failed: {}", control.stream.name(), e);
                fire_error(&on_error, &handle, &e);
                break;
            }
        }
    }
    control.begin_close();
    pump_exit(&control, &on_disconnect, &handle);
}

fn run_write_pump<W>(
    control: Arc<ControlBlock>,
    codec: Box<dyn Codec<W>>,
    write_rx: Receiver<W>,
    on_error: Arc<Vec<ErrorListener<W>>>,
    on_disconnect: Arc<Vec<DisconnectListener<W>>>,
    handle: ConnectionHandle<W>,
) {
    loop {
        if control.state() != ConnectionState::Open {
            break;
        }
        match write_rx.recv_timeout(PUMP_POLL) {
            Ok(message) => {
                match FrameCodec::write_frame(control.stream.outbound(), codec.as_ref(), &message)
                {
                    Ok(()) => {}
                    Err(e) if e.is_closed() => break,
                    Err(e) if !is_pump_fatal(&e) => fire_error(&on_error, &handle, &e),
                    Err(e) => {
                        log::warn!("Write pump on '{}' failed: {}", control.stream.name(), e);
                        fire_error(&on_error, &handle, &e);
                        break;
                    }
                }
            }
            // Re-check the state at the loop top.
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    control.begin_close();
    pump_exit(&control, &on_disconnect, &handle);
}

fn pump_exit<W>(
    control: &Arc<ControlBlock>,
    on_disconnect: &[DisconnectListener<W>],
    handle: &ConnectionHandle<W>,
) {
    // The last pump out finalizes the connection and notifies exactly once.
    if control.pumps_live.fetch_sub(1, Ordering::AcqRel) == 1 {
        control
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        if !control.disconnect_notified.swap(true, Ordering::AcqRel) {
            for listener in on_disconnect {
                let _ = catch_unwind(AssertUnwindSafe(|| listener(handle)));
            }
        }
        control.closed.set();
        log::debug!("Connection '{}' closed", control.stream.name());
    }
}
