//! Config Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// All of these are raised before any remote call is made; fix the
/// configuration and run again.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Sources could not be read or merged, or a value has the wrong type.
    #[display("could not load configuration")]
    Load,
    /// Configuration file extension is not one of toml, yaml, yml or json.
    #[display("unsupported configuration format: {}", _0.display())]
    UnsupportedFormat(#[error(not(source))] PathBuf),
    /// A value was read fine but is not usable.
    #[display("invalid configuration: {_0}")]
    Invalid(#[error(not(source))] String),
    /// No cache directory was configured and the platform has no default.
    #[display("no cache directory configured and no platform default available")]
    NoCacheDir,
    /// The configured blob store could not be set up.
    #[display("could not open blob store")]
    Backend,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
