//! Error types for snapmerge
//!
//! This module defines the shared error taxonomy. Format errors are always
//! fatal at parse time; transient blocking conditions (an open holder on a
//! device) are modeled as `Busy` so callers can report them as
//! merge-needs-reboot rather than failures. We use `thiserror` for
//! automatic `Display` and `Error` trait implementations.

use std::io;
use thiserror::Error;

/// Result type alias for snapmerge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared across the snapshot/merge stack
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations, device access)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed on-disk format (bad magic, version, truncation)
    #[error("Format error: {0}")]
    Format(String),

    /// Data corruption detected (checksum or count mismatch)
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Operation not valid in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A holder keeps the resource open; retry after it is gone
    #[error("Resource busy: {0}")]
    Busy(String),

    /// Control-channel protocol violation
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Not enough free space to allocate a snapshot
    #[error("Insufficient space: requested {requested} bytes, available {available}")]
    InsufficientSpace {
        /// Bytes requested
        requested: u64,
        /// Bytes available
        available: u64,
    },
}

impl Error {
    /// Whether this error denotes a transient blocking condition that is
    /// expected to clear after the holder goes away (typically a reboot).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_error_display_format() {
        let err = Error::Format("bad magic".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Format error"));
        assert!(msg.contains("bad magic"));
    }

    #[test]
    fn test_error_display_insufficient_space() {
        let err = Error::InsufficientSpace {
            requested: 1024,
            available: 512,
        };
        let msg = err.to_string();
        assert!(msg.contains("1024"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn test_busy_is_transient() {
        assert!(Error::Busy("open fd".to_string()).is_transient());
        assert!(!Error::Corruption("crc".to_string()).is_transient());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
