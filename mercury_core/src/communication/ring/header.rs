//! Shared memory ring header.
//!
//! The `RingHeader` is laid out at offset 0 of every ring region. It carries
//! the geometry, the two cross-process cursors, and the sticky shutdown flag.
//! Everything except the cursors, the advisory free counter, and the shutdown
//! flag is immutable after creation.

use std::mem;
use std::sync::atomic::{fence, AtomicI32, AtomicU32, Ordering};

use crate::error::{MercuryError, MercuryResult};

/// Magic number identifying an initialized Mercury ring ("MCRY").
///
/// Written LAST by the owner with Release ordering; joiners spin-wait on it
/// before reading any other field.
pub(crate) const RING_MAGIC: u32 = 0x4D43_5259;

/// Header layout version.
pub(crate) const RING_VERSION: u32 = 1;

/// Maximum spin iterations a joiner waits for the owner to finish
/// initialization (~100ms on typical hardware).
const MAX_INIT_WAIT_ITERS: u32 = 1_000_000;

// Geometry bounds. Values outside these ranges are rejected as incompatible.
pub(crate) const MIN_NODE_COUNT: u32 = 2; // one usable node + the gap slot
pub(crate) const MAX_NODE_COUNT: u32 = 1 << 20;
pub(crate) const MIN_NODE_SIZE: u32 = 1;
pub(crate) const MAX_NODE_SIZE: u32 = 1 << 20;
/// Maximum total region size (1 GiB).
pub(crate) const MAX_TOTAL_SIZE: usize = 1 << 30;

/// Fixed-layout ring metadata, exactly one cache line.
///
/// All multi-byte fields are naturally aligned, little-endian on every
/// supported host. The cursors are the ground truth for occupancy;
/// `free_nodes` is advisory (kept current with atomic arithmetic, but always
/// recomputable from the cursors).
#[repr(C, align(64))]
pub(crate) struct RingHeader {
    /// Written last during init; joiners synchronize on it
    pub(crate) magic: AtomicU32,
    pub(crate) version: u32,
    /// Total slots, including the one-slot gap
    pub(crate) node_count: u32,
    /// Bytes per slot
    pub(crate) node_size: u32,
    /// Consumer cursor, 0 <= read_index < node_count
    pub(crate) read_index: AtomicU32,
    /// Producer cursor, 0 <= write_index < node_count
    pub(crate) write_index: AtomicU32,
    /// Advisory count of writable nodes
    pub(crate) free_nodes: AtomicI32,
    /// Pid of the creator (informational)
    pub(crate) owner_pid: u32,
    /// Sticky shutdown flag: 0 or 1
    pub(crate) shutting_down: AtomicU32,
    _pad: [u8; 28],
}

// The header must stay exactly one cache line.
const _: () = assert!(mem::size_of::<RingHeader>() == 64);

/// Byte footprint of the header at the start of a region.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<RingHeader>();

impl RingHeader {
    /// Initialize a fresh header in place.
    ///
    /// # Safety
    ///
    /// `header` must point to `HEADER_SIZE` writable, 64-byte-aligned bytes
    /// that no other process reads before `magic` is published (guaranteed by
    /// the region creation protocol: joiners spin on `magic` first).
    pub(crate) unsafe fn init(header: *mut RingHeader, node_count: u32, node_size: u32) {
        // All fields are written BEFORE magic; joiners check magic to decide
        // whether the header is initialized.
        (*header).version = RING_VERSION;
        (*header).node_count = node_count;
        (*header).node_size = node_size;
        (*header).read_index.store(0, Ordering::Relaxed);
        (*header).write_index.store(0, Ordering::Relaxed);
        (*header)
            .free_nodes
            .store(node_count as i32 - 1, Ordering::Relaxed);
        (*header).owner_pid = std::process::id();
        (*header).shutting_down.store(0, Ordering::Relaxed);

        fence(Ordering::Release);
        (*header).magic.store(RING_MAGIC, Ordering::Release);
    }

    /// Joiner side: wait for the owner to publish `magic`, then validate the
    /// header. Returns `Incompatible` on a foreign magic, a version mismatch,
    /// or out-of-range geometry.
    pub(crate) fn wait_ready(&self, name: &str) -> MercuryResult<()> {
        let mut wait_iters = 0u32;
        loop {
            let magic = self.magic.load(Ordering::Acquire);
            if magic == RING_MAGIC {
                break;
            }
            if magic != 0 {
                return Err(MercuryError::incompatible(format!(
                    "ring '{}' has invalid magic 0x{:08X} (corrupted or not a Mercury ring)",
                    name, magic
                )));
            }
            // Magic is 0: the owner is still initializing.
            wait_iters += 1;
            if wait_iters > MAX_INIT_WAIT_ITERS {
                return Err(MercuryError::incompatible(format!(
                    "ring '{}' initialization timeout: owner may have crashed during setup",
                    name
                )));
            }
            std::hint::spin_loop();
        }

        if self.version != RING_VERSION {
            return Err(MercuryError::incompatible(format!(
                "ring '{}' has version {} (expected {})",
                name, self.version, RING_VERSION
            )));
        }
        validate_geometry(self.node_count, self.node_size).map_err(|_| {
            MercuryError::incompatible(format!(
                "ring '{}' has out-of-range geometry ({} nodes x {} bytes)",
                name, self.node_count, self.node_size
            ))
        })?;

        Ok(())
    }

    /// Nodes currently occupied, derived from the cursors.
    #[inline]
    pub(crate) fn occupied(&self) -> u32 {
        let n = self.node_count;
        let w = self.write_index.load(Ordering::Acquire);
        let r = self.read_index.load(Ordering::Acquire);
        (w + n - r) % n
    }

    /// Nodes currently writable, derived from the cursors.
    #[inline]
    pub(crate) fn free(&self) -> u32 {
        self.node_count - 1 - self.occupied()
    }

    #[inline]
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire) != 0
    }
}

/// Check ring geometry against the documented bounds.
pub(crate) fn validate_geometry(node_count: u32, node_size: u32) -> MercuryResult<()> {
    if !(MIN_NODE_COUNT..=MAX_NODE_COUNT).contains(&node_count) {
        return Err(MercuryError::config(format!(
            "node_count {} out of range ({}-{})",
            node_count, MIN_NODE_COUNT, MAX_NODE_COUNT
        )));
    }
    if !(MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&node_size) {
        return Err(MercuryError::config(format!(
            "node_size {} out of range ({}-{})",
            node_size, MIN_NODE_SIZE, MAX_NODE_SIZE
        )));
    }
    let data = (node_count as usize)
        .checked_mul(node_size as usize)
        .ok_or_else(|| MercuryError::config("ring size overflows".to_string()))?;
    let total = data
        .checked_add(HEADER_SIZE)
        .ok_or_else(|| MercuryError::config("ring size overflows".to_string()))?;
    if total > MAX_TOTAL_SIZE {
        return Err(MercuryError::config(format!(
            "total ring size {} exceeds maximum {}",
            total, MAX_TOTAL_SIZE
        )));
    }
    Ok(())
}
