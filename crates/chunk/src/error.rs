//! Chunker Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A chunking error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for chunking operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Chunker parameters cannot produce sensible chunks.
    #[display("invalid chunker parameters: {_0}")]
    InvalidParameters(#[error(not(source))] String),
    /// Reading the input stream failed.
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Io)
    }
}
