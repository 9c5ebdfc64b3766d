//! Crypto Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A crypto error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for hashing and codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The blob could not be decrypted or decompressed. Either the passphrase
    /// is wrong or the blob is damaged; the two are deliberately
    /// indistinguishable.
    #[display("wrong passphrase or corrupted blob")]
    Decrypt,
    /// Text did not describe a valid content hash.
    #[display("invalid hash: {_0}")]
    InvalidHash(#[error(not(source))] String),
    /// Reading the plaintext or writing the output failed.
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Io)
    }
}
