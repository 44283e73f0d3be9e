//! Unified error handling for Mercury
//!
//! This module provides a centralized error type for the entire system,
//! ensuring consistent error handling across all components.

use thiserror::Error;

/// Main error type for Mercury operations
#[derive(Debug, Error)]
pub enum MercuryError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shared memory region errors
    #[error("Memory error: {0}")]
    Memory(String),

    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rendezvous / connection management errors
    #[error("Communication error: {0}")]
    Communication(String),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Read/write deadline exceeded; recoverable by retry
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The buffer (or its peer) has set the sticky shutdown flag
    #[error("Channel closed: {0}")]
    Closed(String),

    /// A frame could not fit into the ring within its write deadline
    #[error("No space in ring: {0}")]
    NoSpace(String),

    /// Region magic/version mismatch; fatal for construction
    #[error("Incompatible region: {0}")]
    Incompatible(String),

    /// Internal errors with source location for debugging.
    /// Use the `mercury_internal!()` macro to create these — it captures
    /// file/line automatically.
    #[error("Internal error: {message} (at {file}:{line})")]
    Internal {
        message: String,
        file: &'static str,
        line: u32,
    },
}

/// Create an internal error with automatic file/line capture.
///
/// ```rust,ignore
/// use mercury_core::mercury_internal;
/// return Err(mercury_internal!("Unexpected pump state: {:?}", state));
/// ```
#[macro_export]
macro_rules! mercury_internal {
    ($($arg:tt)*) => {
        $crate::error::MercuryError::Internal {
            message: format!($($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// Convenience type alias for Results using MercuryError
pub type MercuryResult<T> = std::result::Result<T, MercuryError>;

/// Short alias — `Result<T>` is equivalent to `MercuryResult<T>`
pub type Result<T> = MercuryResult<T>;

impl From<serde_json::Error> for MercuryError {
    fn from(err: serde_json::Error) -> Self {
        MercuryError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for MercuryError {
    fn from(err: bincode::Error) -> Self {
        MercuryError::Serialization(err.to_string())
    }
}

// Helper methods
impl MercuryError {
    /// Create a memory error with a custom message
    pub fn memory<S: Into<String>>(msg: S) -> Self {
        MercuryError::Memory(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        MercuryError::Config(msg.into())
    }

    /// Create a communication error
    pub fn communication<S: Into<String>>(msg: S) -> Self {
        MercuryError::Communication(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        MercuryError::Serialization(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        MercuryError::Timeout(msg.into())
    }

    /// Create a closed-channel error
    pub fn closed<S: Into<String>>(msg: S) -> Self {
        MercuryError::Closed(msg.into())
    }

    /// Create a no-space error
    pub fn no_space<S: Into<String>>(msg: S) -> Self {
        MercuryError::NoSpace(msg.into())
    }

    /// Create an incompatible-region error
    pub fn incompatible<S: Into<String>>(msg: S) -> Self {
        MercuryError::Incompatible(msg.into())
    }

    /// True iff this error reports the sticky shutdown flag (end of life,
    /// not a failure).
    pub fn is_closed(&self) -> bool {
        matches!(self, MercuryError::Closed(_))
    }

    /// True for errors a connection pump may swallow and retry:
    /// deadline misses, full rings, and bad payloads.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MercuryError::Timeout(_) | MercuryError::NoSpace(_) | MercuryError::Serialization(_)
        )
    }

    /// True for errors that must tear the connection down.
    pub fn is_fatal(&self) -> bool {
        !self.is_closed() && !self.is_recoverable()
    }
}
