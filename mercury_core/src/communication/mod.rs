//! # Communication - framed messaging over shared-memory rings
//!
//! Layering, bottom up:
//!
//! - [`ring`]: lock-free circular byte buffer with cross-process cursors
//! - [`spin`]: process-local named spins for per-direction exclusion
//! - [`stream`]: byte streams with timeouts; duplex pairing (one ring per
//!   direction)
//! - [`frame`]: length-prefixed framing and payload codecs
//! - [`connection`]: typed full-duplex connections with background pumps
//! - [`server`] / [`client`]: the multi-client rendezvous built on top

pub mod client;
pub mod connection;
pub mod frame;
pub mod ring;
pub mod server;
pub mod spin;
pub mod stream;

pub use client::Client;
pub use connection::{Connection, ConnectionBuilder, ConnectionHandle, ConnectionState};
pub use frame::{BinaryCodec, BytesCodec, Codec, FrameCodec, JsonCodec, TextCodec, TieredCodec};
pub use ring::CircularBuffer;
pub use server::Server;
pub use stream::{DuplexStream, MessageStream, Role};
