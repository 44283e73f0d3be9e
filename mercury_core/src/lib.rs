//! # Mercury Core
//!
//! The core runtime for Mercury, a shared-memory IPC system for cooperating
//! processes on one host.
//!
//! Mercury moves typed, length-framed messages through a lock-free circular
//! byte buffer overlaid on a memory-mapped named region. This crate provides
//! the building blocks:
//!
//! - **Memory**: named cross-process regions (`ShmRegion`)
//! - **Ring**: the circular buffer with atomic cursors (`CircularBuffer`)
//! - **Streams**: byte streams with timeouts and per-direction exclusion
//! - **Framing**: length-prefixed frames and pluggable payload codecs
//! - **Connections**: full-duplex typed endpoints with background pumps
//! - **Rendezvous**: a multi-client server and auto-reconnecting client
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mercury_core::{ConnectionBuilder, Role};
//!
//! let conn: mercury_core::Connection<String, String> = ConnectionBuilder::new()
//!     .on_message(|_conn, msg| println!("got: {}", msg))
//!     .open("demo-link", Role::Initiator)?;
//!
//! conn.push_message("hello".to_string());
//! # Ok::<(), mercury_core::MercuryError>(())
//! ```

pub mod communication;
pub mod config;
pub mod error;
pub mod memory;

pub use communication::{
    BinaryCodec, BytesCodec, CircularBuffer, Client, Codec, Connection, ConnectionBuilder,
    ConnectionHandle, ConnectionState, DuplexStream, FrameCodec, JsonCodec, MessageStream, Role,
    Server, TextCodec, TieredCodec,
};
pub use config::{ChannelConfig, RingConfig};
pub use error::{MercuryError, MercuryResult};
pub use memory::ShmRegion;

// Re-export serde for downstream message derives.
pub use serde;
