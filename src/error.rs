//! Error types for vamana.

use thiserror::Error;

/// Errors that can occur during index construction, search and persistence.
#[derive(Debug, Error)]
pub enum VamanaError {
    /// Vector length disagrees with the configured dimensionality.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Id outside `[0, N)`.
    #[error("id {id} out of range for index of {count} vectors")]
    IdOutOfRange { id: u64, count: u64 },

    /// Persisted artifact missing, truncated or internally inconsistent.
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    /// Backing-store read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation requires at least one element.
    #[error("index is empty")]
    Empty,

    /// Search cooperatively aborted between beam steps.
    #[error("search cancelled")]
    Cancelled,

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for vamana operations.
pub type Result<T> = std::result::Result<T, VamanaError>;
