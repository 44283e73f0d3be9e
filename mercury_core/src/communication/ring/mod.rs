//! Lock-free circular byte buffer in shared memory.
//!
//! A ring of `node_count` fixed-size nodes overlaid on a [`ShmRegion`], with
//! the ring header at offset 0 and the node area immediately after. One
//! logical writer advances `write_index`, one logical
//! reader advances `read_index`; the ring keeps one slot empty so
//! `write_index == read_index` means empty and `(write_index + 1) % N ==
//! read_index` means full.
//!
//! `read`/`write` never block inside the ring math itself; on an empty/full
//! ring they sleep 1 ms between retries up to the caller's deadline. Node
//! payload bytes become visible to the reader only after the writer's
//! release-store of `write_index` past that node.

pub(crate) mod header;

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::config::RingConfig;
use crate::error::{MercuryError, MercuryResult};
use crate::memory::shm_region::ShmRegion;

use header::{validate_geometry, RingHeader, HEADER_SIZE};

/// Sleep between retries on a full/empty ring.
const RETRY_SLEEP: Duration = Duration::from_millis(1);

/// Lock-free ring of fixed-size nodes in a shared memory region.
///
/// The buffer owns its region for the lifetime of the instance; dropping the
/// owning handle unlinks the region. Multiple threads in one process must
/// serialize through the stream layer's named spins before touching a cursor
/// (the ring itself only guarantees one-writer/one-reader safety).
#[derive(Debug)]
pub struct CircularBuffer {
    region: ShmRegion,
    header: NonNull<RingHeader>,
    nodes: NonNull<u8>,
    node_count: u32,
    node_size: u32,
}

// SAFETY: all shared state lives in the mapped region and is accessed through
// atomics; the raw pointers are stable for the lifetime of the region.
unsafe impl Send for CircularBuffer {}
unsafe impl Sync for CircularBuffer {}

impl CircularBuffer {
    /// Open the named ring if it exists (adopting its geometry — `config` is
    /// ignored in that case), otherwise create it with `config`'s geometry.
    pub fn open_or_create(name: &str, config: &RingConfig) -> MercuryResult<Self> {
        validate_geometry(config.node_count, config.node_size)?;
        let total_size = HEADER_SIZE + config.node_count as usize * config.node_size as usize;

        let region = ShmRegion::open_or_create(name, total_size)?;
        if region.is_owner() {
            Self::from_owned_region(region, config)
        } else {
            Self::from_joined_region(region)
        }
    }

    /// Open an existing ring; fails if the name does not exist.
    pub fn open(name: &str) -> MercuryResult<Self> {
        let region = ShmRegion::open(name)?;
        Self::from_joined_region(region)
    }

    fn from_owned_region(region: ShmRegion, config: &RingConfig) -> MercuryResult<Self> {
        let header = Self::header_ptr(&region)?;
        // SAFETY: the header area is exclusively ours until magic is
        // published; pointer validated by header_ptr.
        unsafe { RingHeader::init(header.as_ptr(), config.node_count, config.node_size) };

        log::info!(
            "Created ring '{}' ({} nodes x {} bytes)",
            region.name(),
            config.node_count,
            config.node_size
        );

        Self::finish(region, header, config.node_count, config.node_size)
    }

    fn from_joined_region(region: ShmRegion) -> MercuryResult<Self> {
        let header = Self::header_ptr(&region)?;
        // SAFETY: pointer validated by header_ptr; wait_ready synchronizes
        // with the owner's publishing store before any other field is read.
        let hdr = unsafe { header.as_ref() };
        hdr.wait_ready(region.name())?;

        let (node_count, node_size) = (hdr.node_count, hdr.node_size);

        log::info!(
            "Opened ring '{}' ({} nodes x {} bytes)",
            region.name(),
            node_count,
            node_size
        );

        Self::finish(region, header, node_count, node_size)
    }

    fn header_ptr(region: &ShmRegion) -> MercuryResult<NonNull<RingHeader>> {
        if region.size() < HEADER_SIZE {
            return Err(MercuryError::memory(format!(
                "region '{}' too small for a ring header ({} < {})",
                region.name(),
                region.size(),
                HEADER_SIZE
            )));
        }
        let ptr = region.as_mut_ptr() as *mut RingHeader;
        if !(ptr as usize).is_multiple_of(std::mem::align_of::<RingHeader>()) {
            return Err(MercuryError::memory(format!(
                "region '{}' header is not {}-byte aligned",
                region.name(),
                std::mem::align_of::<RingHeader>()
            )));
        }
        NonNull::new(ptr)
            .ok_or_else(|| MercuryError::memory("null pointer for ring header".to_string()))
    }

    fn finish(
        region: ShmRegion,
        header: NonNull<RingHeader>,
        node_count: u32,
        node_size: u32,
    ) -> MercuryResult<Self> {
        let data_size = node_count as usize * node_size as usize;
        if region.size() < HEADER_SIZE + data_size {
            return Err(MercuryError::incompatible(format!(
                "region '{}' too small for its declared geometry ({} < {})",
                region.name(),
                region.size(),
                HEADER_SIZE + data_size
            )));
        }
        // SAFETY: HEADER_SIZE is within the mapped region (checked above).
        let nodes_ptr = unsafe { region.as_mut_ptr().add(HEADER_SIZE) };
        let nodes = NonNull::new(nodes_ptr)
            .ok_or_else(|| MercuryError::memory("null pointer for node area".to_string()))?;

        Ok(Self {
            region,
            header,
            nodes,
            node_count,
            node_size,
        })
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: the header pointer is valid for the lifetime of the region.
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn node_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.node_count);
        // SAFETY: index < node_count, so the offset stays inside the node
        // area validated in finish().
        unsafe {
            self.nodes
                .as_ptr()
                .add(index as usize * self.node_size as usize)
        }
    }

    /// Copy bytes from `src` into free nodes, one whole or tail node per
    /// iteration, returning the byte count written (which may be less than
    /// `src.len()` once the ring fills).
    ///
    /// Returns `Timeout` if no byte could be written before the deadline and
    /// `Closed` once the shutdown flag is set.
    pub fn write(&self, src: &[u8], timeout: Duration) -> MercuryResult<u32> {
        if src.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout;
        let hdr = self.header();
        let n = self.node_count;
        let mut written = 0usize;

        loop {
            if hdr.is_shutting_down() {
                return if written > 0 {
                    Ok(written as u32)
                } else {
                    Err(MercuryError::closed(format!(
                        "ring '{}' is shutting down",
                        self.region.name()
                    )))
                };
            }
            if written == src.len() {
                return Ok(written as u32);
            }

            let w = hdr.write_index.load(Ordering::Acquire);
            let r = hdr.read_index.load(Ordering::Acquire);
            let free = (r + n - w - 1) % n;
            if free == 0 {
                if written > 0 {
                    return Ok(written as u32);
                }
                if Instant::now() >= deadline {
                    return Err(MercuryError::timeout(format!(
                        "ring '{}' full for {:?}",
                        self.region.name(),
                        timeout
                    )));
                }
                std::thread::sleep(RETRY_SLEEP);
                continue;
            }

            let chunk = (src.len() - written).min(self.node_size as usize);
            // SAFETY: the node is free (not between the cursors), chunk <=
            // node_size, and src has at least `written + chunk` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(written), self.node_ptr(w), chunk);
            }
            // Publish the node: readers may touch its bytes only after this
            // release-store.
            hdr.write_index.store((w + 1) % n, Ordering::Release);
            hdr.free_nodes.fetch_sub(1, Ordering::AcqRel);
            written += chunk;
        }
    }

    /// Copy bytes from occupied nodes into `dst`, one node per iteration,
    /// returning the byte count read (which may be less than `dst.len()` if
    /// the ring runs empty).
    ///
    /// The caller's framing must mirror the writer's segment sizes: each read
    /// consumes whole nodes, taking at most `dst` remaining bytes from each.
    /// Returns `Timeout` if no byte arrived before the deadline and `Closed`
    /// once the shutdown flag is set.
    pub fn read(&self, dst: &mut [u8], timeout: Duration) -> MercuryResult<u32> {
        if dst.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout;
        let hdr = self.header();
        let n = self.node_count;
        let mut done = 0usize;

        loop {
            if hdr.is_shutting_down() {
                return if done > 0 {
                    Ok(done as u32)
                } else {
                    Err(MercuryError::closed(format!(
                        "ring '{}' is shutting down",
                        self.region.name()
                    )))
                };
            }
            if done == dst.len() {
                return Ok(done as u32);
            }

            let r = hdr.read_index.load(Ordering::Acquire);
            let w = hdr.write_index.load(Ordering::Acquire);
            if r == w {
                // Empty.
                if done > 0 {
                    return Ok(done as u32);
                }
                if Instant::now() >= deadline {
                    return Err(MercuryError::timeout(format!(
                        "ring '{}' empty for {:?}",
                        self.region.name(),
                        timeout
                    )));
                }
                std::thread::sleep(RETRY_SLEEP);
                continue;
            }

            let chunk = (dst.len() - done).min(self.node_size as usize);
            // SAFETY: node r is occupied (the acquire load of write_index
            // above synchronized with the writer's publishing store), chunk
            // <= node_size, and dst has at least `done + chunk` bytes left.
            unsafe {
                std::ptr::copy_nonoverlapping(self.node_ptr(r), dst.as_mut_ptr().add(done), chunk);
            }
            hdr.read_index.store((r + 1) % n, Ordering::Release);
            hdr.free_nodes.fetch_add(1, Ordering::AcqRel);
            done += chunk;
        }
    }

    /// Writable node count, derived from the cursors.
    pub fn free_node_count(&self) -> u32 {
        self.header().free()
    }

    /// Occupied node count, derived from the cursors.
    pub fn occupied_node_count(&self) -> u32 {
        self.header().occupied()
    }

    /// Whether at least one node is readable.
    pub fn has_node_to_read(&self) -> bool {
        self.header().occupied() > 0
    }

    /// Best-effort wait until every node has been consumed by the reader.
    /// Returns `true` once the ring is drained, `false` on deadline or
    /// shutdown with data still pending.
    pub fn wait_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.header().occupied() == 0 {
                return true;
            }
            if self.is_closed() || Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(RETRY_SLEEP);
        }
    }

    /// Set the sticky shutdown flag. Every subsequent `read`/`write` on any
    /// handle of this ring reports `Closed` within one polling interval.
    pub fn close(&self) {
        if !self.header().is_shutting_down() {
            log::info!("Closing ring '{}'", self.region.name());
        }
        self.header().shutting_down.store(1, Ordering::Release);
    }

    /// True iff the shutdown flag is set (by this handle or the peer).
    pub fn is_closed(&self) -> bool {
        self.header().is_shutting_down()
    }

    /// Whether this handle created the ring (and unlinks it on drop).
    pub fn is_owner(&self) -> bool {
        self.region.is_owner()
    }

    /// Unlink the backing region regardless of ownership. Used to clear
    /// stale rings left behind by a crashed creator; live handles keep their
    /// mappings.
    pub fn force_cleanup(&self) {
        self.region.force_cleanup();
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn node_size(&self) -> u32 {
        self.node_size
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }
}

impl Drop for CircularBuffer {
    fn drop(&mut self) {
        // The owner takes the region down with it; make sure joiners observe
        // the shutdown rather than a vanished name.
        if self.region.is_owner() {
            self.close();
        }
    }
}
