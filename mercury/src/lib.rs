//! # Mercury - shared-memory message IPC
//!
//! Mercury delivers typed, length-framed messages between cooperating
//! processes on one host through lock-free circular buffers in shared
//! memory, with a multi-client server topology layered on top.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mercury::prelude::*;
//!
//! let conn: Connection<String, String> = ConnectionBuilder::new()
//!     .on_message(|_conn, msg| println!("got: {}", msg))
//!     .open("demo-link", Role::Initiator)?;
//!
//! conn.push_message("hello".to_string());
//! # Ok::<(), MercuryError>(())
//! ```

// Re-export core components
pub use mercury_core::{self, *};

// Re-export serde at crate root for message derives
pub use serde;

/// The Mercury prelude - everything you need to get started
pub mod prelude {
    pub use mercury_core::{
        ChannelConfig, Client, Codec, Connection, ConnectionBuilder, ConnectionHandle,
        ConnectionState, MercuryError, MercuryResult, RingConfig, Role, Server,
    };
}
