//! Byte-stream facade over a circular buffer.
//!
//! [`MessageStream`] adds per-direction mutual exclusion (named spins) and
//! read/write deadlines on top of a [`CircularBuffer`]. [`DuplexStream`]
//! pairs two of them — one ring per direction — so a connection gets strict
//! single-producer/single-consumer reasoning on each ring.

use std::time::{Duration, Instant};

use crate::communication::ring::CircularBuffer;
use crate::communication::spin::{self, SpinGuard};
use crate::config::ChannelConfig;
use crate::error::{MercuryError, MercuryResult};

/// A byte stream over one shared-memory ring.
///
/// Reads and writes within this process are serialized through two named
/// spins, `<name>_read` and `<name>_write`; a read never blocks a write and
/// vice versa. Construction does not block and `flush` is a no-op — the ring
/// advances its cursors on every node.
///
/// Reads must mirror the writer's segment sizes: every `write` call starts at
/// a fresh node, and every `read` consumes whole nodes. The frame layer
/// guarantees this by writing the length prefix and payload as separate
/// segments and reading back exactly those byte counts.
pub struct MessageStream {
    ring: CircularBuffer,
    read_spin: String,
    write_spin: String,
    read_timeout: Duration,
    write_timeout: Duration,
    spin_timeout: Duration,
}

impl MessageStream {
    /// Open the named ring if it exists, otherwise create it with the
    /// config's geometry.
    pub fn open_or_create(name: &str, config: &ChannelConfig) -> MercuryResult<Self> {
        let ring = CircularBuffer::open_or_create(name, &config.ring)?;
        Ok(Self::over(ring, config))
    }

    /// Open an existing ring; fails if the name does not exist.
    pub fn open_existing(name: &str, config: &ChannelConfig) -> MercuryResult<Self> {
        let ring = CircularBuffer::open(name)?;
        Ok(Self::over(ring, config))
    }

    fn over(ring: CircularBuffer, config: &ChannelConfig) -> Self {
        let name = ring.name().to_string();
        Self {
            ring,
            read_spin: format!("{}_read", name),
            write_spin: format!("{}_write", name),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            spin_timeout: config.spin_acquire_timeout(),
        }
    }

    /// Take this process's write spin for the stream. Held across a whole
    /// frame by the frame layer so concurrent writers never interleave.
    pub(crate) fn lock_write(&self) -> MercuryResult<SpinGuard> {
        spin::acquire_scoped(&self.write_spin, self.spin_timeout)
    }

    /// Take this process's read spin for the stream.
    pub(crate) fn lock_read(&self) -> MercuryResult<SpinGuard> {
        spin::acquire_scoped(&self.read_spin, self.spin_timeout)
    }

    /// Write all of `buf`, assuming the write spin is already held.
    pub(crate) fn write_unlocked(&self, buf: &[u8]) -> MercuryResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + self.write_timeout;
        let mut off = 0usize;
        while off < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                return Err(MercuryError::timeout(format!(
                    "stream '{}' write of {} bytes stalled at {}",
                    self.ring.name(),
                    buf.len(),
                    off
                )));
            }
            let n = self.ring.write(&buf[off..], deadline - now)?;
            off += n as usize;
        }
        Ok(())
    }

    /// Read into `buf`, assuming the read spin is already held. Returns the
    /// byte count, `Ok(0)` meaning "no data yet".
    pub(crate) fn read_unlocked(&self, buf: &mut [u8]) -> MercuryResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.ring.read(buf, self.read_timeout) {
            Ok(n) => Ok(n as usize),
            // An empty deadline is the legal "no data yet" outcome at this
            // layer; the caller loops.
            Err(MercuryError::Timeout(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Write all of `buf` to the stream, or fail with `Timeout`/`Closed`.
    pub fn write(&self, buf: &[u8]) -> MercuryResult<()> {
        let _guard = self.lock_write()?;
        self.write_unlocked(buf)
    }

    /// Read up to `buf.len()` bytes. Returns the byte count; 0 means no data
    /// arrived within the read timeout and the stream is still open.
    pub fn read(&self, buf: &mut [u8]) -> MercuryResult<usize> {
        let _guard = self.lock_read()?;
        self.read_unlocked(buf)
    }

    /// No-op: the ring publishes every node as it is written.
    pub fn flush(&self) -> MercuryResult<()> {
        Ok(())
    }

    /// Set the sticky shutdown flag on the underlying ring.
    pub fn close(&self) {
        self.ring.close();
    }

    /// True iff the underlying ring is closed.
    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    pub fn ring(&self) -> &CircularBuffer {
        &self.ring
    }

    pub fn name(&self) -> &str {
        self.ring.name()
    }
}

/// Which side of a duplex link this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that dialed (client side of a rendezvous)
    Initiator,
    /// The side that accepted (server side of a rendezvous)
    Acceptor,
}

/// A full-duplex byte channel: one ring per direction.
///
/// Both endpoints open the same base name with opposite roles; the initiator
/// writes `<name>.a2b` and reads `<name>.b2a`, the acceptor the mirror
/// image. Either side may create the rings — whoever arrives first.
pub struct DuplexStream {
    outbound: MessageStream,
    inbound: MessageStream,
    name: String,
}

impl DuplexStream {
    pub fn open_or_create(name: &str, role: Role, config: &ChannelConfig) -> MercuryResult<Self> {
        let a2b = format!("{}.a2b", name);
        let b2a = format!("{}.b2a", name);
        let (out_name, in_name) = match role {
            Role::Initiator => (a2b, b2a),
            Role::Acceptor => (b2a, a2b),
        };
        Ok(Self {
            outbound: MessageStream::open_or_create(&out_name, config)?,
            inbound: MessageStream::open_or_create(&in_name, config)?,
            name: name.to_string(),
        })
    }

    /// The stream this endpoint writes.
    pub fn outbound(&self) -> &MessageStream {
        &self.outbound
    }

    /// The stream this endpoint reads.
    pub fn inbound(&self) -> &MessageStream {
        &self.inbound
    }

    /// Close both directions.
    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }

    /// True iff either direction is closed.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed() || self.inbound.is_closed()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingConfig;

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
            ring: RingConfig::new(64, 16),
            read_timeout_ms: 50,
            write_timeout_ms: 50,
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let name = unique_name("stream_rt");
        let cfg = quick_config();
        let writer = MessageStream::open_or_create(&name, &cfg).unwrap();
        let reader = MessageStream::open_or_create(&name, &cfg).unwrap();

        writer.write(b"This is a test !").unwrap();
        let mut buf = [0u8; 16];
        let mut got = 0;
        while got < buf.len() {
            got += reader.read(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"This is a test !");
    }

    #[test]
    fn read_with_no_data_returns_zero() {
        let name = unique_name("stream_empty");
        let stream = MessageStream::open_or_create(&name, &quick_config()).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert!(!stream.is_closed());
    }

    #[test]
    fn write_larger_than_ring_capacity_times_out() {
        let name = unique_name("stream_overflow");
        let cfg = ChannelConfig {
            ring: RingConfig::new(4, 8), // 24 usable bytes
            read_timeout_ms: 50,
            write_timeout_ms: 50,
            ..ChannelConfig::default()
        };
        let stream = MessageStream::open_or_create(&name, &cfg).unwrap();
        let err = stream.write(&[1u8; 100]).unwrap_err();
        assert!(matches!(err, MercuryError::Timeout(_)));
    }

    #[test]
    fn closed_stream_rejects_io() {
        let name = unique_name("stream_closed");
        let stream = MessageStream::open_or_create(&name, &quick_config()).unwrap();
        stream.close();
        assert!(stream.is_closed());
        assert!(stream.write(b"x").unwrap_err().is_closed());
        let mut buf = [0u8; 1];
        assert!(stream.read(&mut buf).unwrap_err().is_closed());
    }

    #[test]
    fn duplex_pair_crosses_directions() {
        let name = unique_name("duplex");
        let cfg = quick_config();
        let a = DuplexStream::open_or_create(&name, Role::Initiator, &cfg).unwrap();
        let b = DuplexStream::open_or_create(&name, Role::Acceptor, &cfg).unwrap();

        a.outbound().write(b"ping").unwrap();
        b.outbound().write(b"pong").unwrap();

        let mut buf = [0u8; 4];
        b.inbound().read(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        a.inbound().read(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn duplex_close_is_seen_by_peer() {
        let name = unique_name("duplex_close");
        let cfg = quick_config();
        let a = DuplexStream::open_or_create(&name, Role::Initiator, &cfg).unwrap();
        let b = DuplexStream::open_or_create(&name, Role::Acceptor, &cfg).unwrap();

        a.close();
        assert!(b.is_closed());
    }
}
