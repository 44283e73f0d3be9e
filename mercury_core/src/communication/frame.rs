//! Length-prefixed framing and payload codecs.
//!
//! Wire format, bytes on the ring:
//!
//! ```text
//!  0  1  2  3   4 ...                        4+len-1
//! +--+--+--+--+------------------------------+
//! | len (u32, big-endian) | payload bytes    |
//! +-----------------------+------------------+
//! ```
//!
//! A `len == 0` frame is a no-op the reader skips, which means a zero-length
//! application payload is not representable — `write_frame` rejects empty
//! encodings instead of sending a message the peer would never deliver.
//!
//! The write spin is held across both segments of a frame and the read spin
//! across a whole frame, so concurrent same-process callers never interleave
//! frames on the wire.

use std::marker::PhantomData;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::communication::stream::MessageStream;
use crate::error::{MercuryError, MercuryResult};

/// Frames must stay below 2^31 bytes.
const MAX_FRAME_LEN: usize = 1 << 31;

/// Serializer contract for one payload type.
///
/// `decode(encode(value))` must round-trip every `T` the codec supports.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> MercuryResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> MercuryResult<T>;
}

/// Compact binary codec (bincode).
pub struct BinaryCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BinaryCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BinaryCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for BinaryCodec<T> {
    fn encode(&self, value: &T) -> MercuryResult<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> MercuryResult<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Portable JSON codec.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec<T> {
    fn encode(&self, value: &T) -> MercuryResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> MercuryResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Two-tier codec: the compact binary form is attempted first, the portable
/// JSON form on failure (both directions).
pub struct TieredCodec<T> {
    binary: BinaryCodec<T>,
    portable: JsonCodec<T>,
}

impl<T> TieredCodec<T> {
    pub fn new() -> Self {
        Self {
            binary: BinaryCodec::new(),
            portable: JsonCodec::new(),
        }
    }
}

impl<T> Default for TieredCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for TieredCodec<T> {
    fn encode(&self, value: &T) -> MercuryResult<Vec<u8>> {
        self.binary
            .encode(value)
            .or_else(|_| self.portable.encode(value))
    }

    fn decode(&self, bytes: &[u8]) -> MercuryResult<T> {
        self.binary
            .decode(bytes)
            .or_else(|_| self.portable.decode(bytes))
    }
}

/// Pass-through codec for raw byte payloads.
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> MercuryResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> MercuryResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// UTF-8 codec for text payloads.
pub struct TextCodec;

impl Codec<String> for TextCodec {
    fn encode(&self, value: &String) -> MercuryResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> MercuryResult<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| MercuryError::serialization(format!("invalid UTF-8 payload: {}", e)))
    }
}

/// Framing over a [`MessageStream`]: one typed message per frame.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode `value` and write one frame: the 4-byte big-endian length, then
    /// the payload, each as its own stream segment under a single write spin.
    ///
    /// A write that cannot fit within the stream's write timeout fails with
    /// `NoSpace`.
    pub fn write_frame<T>(
        stream: &MessageStream,
        codec: &dyn Codec<T>,
        value: &T,
    ) -> MercuryResult<()> {
        let payload = codec.encode(value)?;
        if payload.is_empty() {
            return Err(MercuryError::config(
                "zero-length frames are reserved as no-ops and cannot carry a payload".to_string(),
            ));
        }
        if payload.len() >= MAX_FRAME_LEN {
            return Err(MercuryError::config(format!(
                "frame payload of {} bytes exceeds the 2^31 limit",
                payload.len()
            )));
        }

        let _guard = stream.lock_write()?;
        let len_bytes = (payload.len() as u32).to_be_bytes();
        stream
            .write_unlocked(&len_bytes)
            .map_err(no_space_on_timeout)?;
        stream
            .write_unlocked(&payload)
            .map_err(no_space_on_timeout)?;
        Ok(())
    }

    /// Read one frame and decode it. Blocks until a frame arrives or the
    /// stream closes; returns `Ok(None)` iff the stream closed before any
    /// byte of a frame arrived. Zero-length frames are skipped.
    pub fn read_frame<T>(
        stream: &MessageStream,
        codec: &dyn Codec<T>,
    ) -> MercuryResult<Option<T>> {
        Self::read_frame_deadline(stream, codec, None)
    }

    /// [`read_frame`](Self::read_frame) with an optional overall deadline,
    /// for callers that cannot wait on the stream indefinitely (the
    /// rendezvous handshake). A deadline miss reports `Timeout`.
    pub fn read_frame_deadline<T>(
        stream: &MessageStream,
        codec: &dyn Codec<T>,
        deadline: Option<Instant>,
    ) -> MercuryResult<Option<T>> {
        let _guard = stream.lock_read()?;
        loop {
            let mut len_buf = [0u8; 4];
            let mut have = 0usize;
            while have < 4 {
                match stream.read_unlocked(&mut len_buf[have..]) {
                    Ok(0) => {
                        if let Some(d) = deadline {
                            if Instant::now() >= d {
                                return Err(MercuryError::timeout(format!(
                                    "no frame arrived on '{}' before the deadline",
                                    stream.name()
                                )));
                            }
                        }
                    }
                    Ok(n) => have += n,
                    Err(e) if e.is_closed() && have == 0 => return Ok(None),
                    Err(e) => return Err(e),
                }
            }

            let len = u32::from_be_bytes(len_buf) as usize;
            if len == 0 {
                // No-op frame.
                continue;
            }

            let mut payload = vec![0u8; len];
            let mut got = 0usize;
            while got < len {
                match stream.read_unlocked(&mut payload[got..]) {
                    Ok(0) => {
                        if let Some(d) = deadline {
                            if Instant::now() >= d {
                                return Err(MercuryError::timeout(format!(
                                    "frame payload stalled on '{}' at {}/{} bytes",
                                    stream.name(),
                                    got,
                                    len
                                )));
                            }
                        }
                    }
                    Ok(n) => got += n,
                    // Closing mid-frame is a torn frame, not a clean EOF.
                    Err(e) => return Err(e),
                }
            }

            return codec.decode(&payload).map(Some);
        }
    }
}

fn no_space_on_timeout(err: MercuryError) -> MercuryError {
    match err {
        MercuryError::Timeout(msg) => MercuryError::NoSpace(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, RingConfig};

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
            ring: RingConfig::new(128, 32),
            read_timeout_ms: 50,
            write_timeout_ms: 50,
            ..ChannelConfig::default()
        }
    }

    fn stream_pair(name: &str, cfg: &ChannelConfig) -> (MessageStream, MessageStream) {
        (
            MessageStream::open_or_create(name, cfg).unwrap(),
            MessageStream::open_or_create(name, cfg).unwrap(),
        )
    }

    #[test]
    fn text_frame_roundtrip() {
        let name = unique_name("frame_text");
        let (w, r) = stream_pair(&name, &quick_config());

        FrameCodec::write_frame(&w, &TextCodec, &"This is a test !".to_string()).unwrap();
        let got = FrameCodec::read_frame(&r, &TextCodec).unwrap();
        assert_eq!(got.as_deref(), Some("This is a test !"));
    }

    #[test]
    fn bytes_frame_spans_many_nodes() {
        let name = unique_name("frame_span");
        let (w, r) = stream_pair(&name, &quick_config());

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        FrameCodec::write_frame(&w, &BytesCodec, &payload).unwrap();
        let got = FrameCodec::read_frame(&r, &BytesCodec).unwrap().unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn zero_length_frames_are_skipped() {
        let name = unique_name("frame_skip");
        let (w, r) = stream_pair(&name, &quick_config());

        // A raw no-op frame, then a real one.
        w.write(&0u32.to_be_bytes()).unwrap();
        FrameCodec::write_frame(&w, &TextCodec, &"after the no-op".to_string()).unwrap();

        let got = FrameCodec::read_frame(&r, &TextCodec).unwrap();
        assert_eq!(got.as_deref(), Some("after the no-op"));
    }

    #[test]
    fn empty_payload_is_rejected() {
        let name = unique_name("frame_empty");
        let (w, _r) = stream_pair(&name, &quick_config());

        let err = FrameCodec::write_frame(&w, &TextCodec, &String::new()).unwrap_err();
        assert!(matches!(err, MercuryError::Config(_)));
    }

    #[test]
    fn closed_before_frame_reads_none() {
        let name = unique_name("frame_closed");
        let (w, r) = stream_pair(&name, &quick_config());
        w.close();
        assert!(FrameCodec::read_frame(&r, &TextCodec).unwrap().is_none());
    }

    #[test]
    fn oversized_stream_write_reports_no_space() {
        let name = unique_name("frame_nospace");
        let cfg = ChannelConfig {
            ring: RingConfig::new(4, 8), // 24 usable bytes
            read_timeout_ms: 50,
            write_timeout_ms: 50,
            ..ChannelConfig::default()
        };
        let (w, _r) = stream_pair(&name, &cfg);
        let err = FrameCodec::write_frame(&w, &BytesCodec, &vec![9u8; 100]).unwrap_err();
        assert!(matches!(err, MercuryError::NoSpace(_)));
    }

    #[test]
    fn read_frame_deadline_times_out_on_silence() {
        let name = unique_name("frame_deadline");
        let (_w, r) = stream_pair(&name, &quick_config());
        let deadline = Instant::now() + std::time::Duration::from_millis(100);
        let err = FrameCodec::read_frame_deadline(&r, &TextCodec, Some(deadline)).unwrap_err();
        assert!(matches!(err, MercuryError::Timeout(_)));
    }

    #[test]
    fn tiered_codec_reads_both_formats() {
        let tiered: TieredCodec<Vec<i32>> = TieredCodec::new();
        let value = vec![1, 2, 3, -7];

        let binary = BinaryCodec::<Vec<i32>>::new().encode(&value).unwrap();
        let json = JsonCodec::<Vec<i32>>::new().encode(&value).unwrap();

        assert_eq!(tiered.decode(&binary).unwrap(), value);
        assert_eq!(tiered.decode(&json).unwrap(), value);
        assert_eq!(tiered.decode(&tiered.encode(&value).unwrap()).unwrap(), value);
    }
}
