//! State Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A state error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for state operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A row could not be converted to or from its model.
    #[display("invalid state data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// A state snapshot could not be decrypted. Either the passphrase is
    /// wrong or the snapshot is corrupt; in both cases the run must stop.
    #[display("wrong passphrase or corrupted state snapshot: {_0}")]
    WrongPassphrase(#[error(not(source))] String),
    /// Transferring a snapshot to or from the blob store failed.
    #[display("state snapshot transfer failed")]
    Storage,
    /// Local snapshot cache could not be read or written.
    #[display("state cache I/O error")]
    Io,
    /// A row references something that does not exist.
    #[display("constraint violated: {_0}")]
    Constraint(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage)
    }
}
