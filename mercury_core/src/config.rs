//! Mercury channel configuration
//!
//! Typed configuration for rings and connections. Every field has a default,
//! so partial configs deserialize cleanly and `ChannelConfig::default()` is a
//! working setup for local IPC.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_node_count() -> u32 {
    1024
}

fn default_node_size() -> u32 {
    4096
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_write_timeout_ms() -> u64 {
    1000
}

fn default_spin_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_auto_reconnect() -> bool {
    true
}

/// Geometry of one shared-memory ring.
///
/// The ring keeps one slot empty to distinguish full from empty, so the
/// usable capacity is `(node_count - 1) * node_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Total ring slots, including the one-slot gap
    pub node_count: u32,
    /// Bytes per slot
    pub node_size: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            node_count: default_node_count(),
            node_size: default_node_size(),
        }
    }
}

impl RingConfig {
    /// Geometry with explicit slot count and size.
    pub fn new(node_count: u32, node_size: u32) -> Self {
        Self {
            node_count,
            node_size,
        }
    }

    /// Usable payload capacity in bytes (one slot is always kept empty).
    pub fn capacity_bytes(&self) -> u64 {
        u64::from(self.node_count.saturating_sub(1)) * u64::from(self.node_size)
    }
}

/// Configuration for a stream or connection endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Ring geometry (ignored when opening an existing ring — the creator's
    /// geometry wins)
    pub ring: RingConfig,
    /// Upper bound for one stream-level read
    pub read_timeout_ms: u64,
    /// Upper bound for one stream-level write
    pub write_timeout_ms: u64,
    /// Upper bound for acquiring a named spin
    pub spin_acquire_timeout_ms: u64,
    /// Client wrapper only: re-run the handshake after a disconnect
    pub auto_reconnect: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ring: RingConfig::default(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            spin_acquire_timeout_ms: default_spin_acquire_timeout_ms(),
            auto_reconnect: default_auto_reconnect(),
        }
    }
}

impl ChannelConfig {
    /// Config with explicit ring geometry and default timeouts.
    pub fn with_ring(ring: RingConfig) -> Self {
        Self {
            ring,
            ..Self::default()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn spin_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.spin_acquire_timeout_ms)
    }
}
