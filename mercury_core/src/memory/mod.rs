//! # Shared memory primitives for Mercury
//!
//! This module provides the cross-process byte region every ring is overlaid
//! on:
//!
//! - **ShmRegion**: named, fixed-size regions with a single owning creator
//! - **platform**: namespace layout and name validation
//!
//! The region itself carries no synchronization. All cross-process
//! coordination lives in the ring header atomics
//! (see `communication::ring`).

pub(crate) mod platform;
pub(crate) mod shm_region;

pub use platform::{has_native_shm, shm_base_dir, shm_rings_dir};
pub use shm_region::ShmRegion;
