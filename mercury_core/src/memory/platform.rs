//! Platform paths and capabilities for Mercury shared memory.
//!
//! Linux rings live as files under `/dev/shm` (tmpfs, RAM-backed); other
//! platforms either use native shared-memory objects (macOS, Windows) or fall
//! back to files under the system temp directory.

use std::path::PathBuf;

use crate::error::{MercuryError, MercuryResult};

/// Base directory for all Mercury shared-memory objects on file-backed
/// platforms.
pub fn shm_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/dev/shm/mercury")
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::env::temp_dir().join("mercury")
    }
}

/// Directory holding ring buffer regions.
pub fn shm_rings_dir() -> PathBuf {
    shm_base_dir().join("rings")
}

/// Whether this platform maps regions through a RAM-backed native mechanism.
pub fn has_native_shm() -> bool {
    cfg!(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "windows"
    ))
}

/// Validate a caller-supplied region name.
///
/// Names become file names (or kernel object names), so they must be
/// non-empty, NUL-free, and free of path traversal.
pub fn validate_region_name(name: &str) -> MercuryResult<()> {
    if name.is_empty() {
        return Err(MercuryError::config("region name must not be empty"));
    }
    if name.contains('\0') {
        return Err(MercuryError::config(format!(
            "region name {:?} contains a NUL byte",
            name
        )));
    }
    if name.contains("..") {
        return Err(MercuryError::config(format!(
            "region name {:?} must not contain '..'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rings_dir_is_under_base() {
        assert!(shm_rings_dir().starts_with(shm_base_dir()));
    }

    #[test]
    fn name_validation() {
        assert!(validate_region_name("server.a2b").is_ok());
        assert!(validate_region_name("links/handshake_1").is_ok());
        assert!(validate_region_name("").is_err());
        assert!(validate_region_name("a\0b").is_err());
        assert!(validate_region_name("../etc/passwd").is_err());
    }
}
