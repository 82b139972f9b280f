//! Error types for discardable segments.
//!
//! Only allocation, mapping and handle failures are errors. A lock that finds
//! the content purged, or a purge that is declined, is reported as `false`.

use thiserror::Error;

/// Result type alias using the crate's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for segment operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Shared memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid segment or handle.
    #[error("invalid memory segment: {0}")]
    InvalidSegment(String),

    /// The segment is already mapped into this process.
    #[error("segment is already mapped")]
    AlreadyMapped,

    /// The segment has been closed or never had a handle.
    #[error("segment has no open handle")]
    Closed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
