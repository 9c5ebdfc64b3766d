//! Engine Error Types
//!
//! Only fatal conditions are errors here. Anything that affects a single
//! file is recorded as an [`ItemFailure`](crate::ItemFailure) in the run's
//! report and the run carries on.

use arca_crypto::error::ErrorKind as CryptoErrorKind;
use arca_state::error::ErrorKind as StateErrorKind;
use arca_storage::error::ErrorKind as StorageErrorKind;
use derive_more::{Display, Error};

/// An engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a run was aborted.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The run configuration was rejected before any remote call.
    #[display("invalid run configuration")]
    Config,
    /// The container does not exist or the credentials cannot reach it.
    #[display("blob store is unreachable")]
    Unreachable,
    /// The state snapshot could not be decrypted with this passphrase.
    #[display("wrong passphrase or corrupted state")]
    WrongPassphrase,
    /// The requested version does not exist (nor any version before it).
    #[display("no repository version at or before {_0}")]
    VersionNotFound(#[error(not(source))] String),
    /// Reading or writing the state database failed.
    #[display("state database error")]
    State,
    /// A blob store operation needed by the whole run failed.
    #[display("blob store error")]
    Storage,
    /// Local filesystem access needed by the whole run failed.
    #[display("local I/O error")]
    Io,
    /// Downloaded content could not be decrypted or does not hash to what
    /// the state says it should.
    #[display("integrity check failed: {_0}")]
    Integrity(#[error(not(source))] String),
    /// A pipeline task panicked or could not be joined.
    #[display("pipeline task failed")]
    Task,
    /// The run was cancelled from outside.
    #[display("run cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::Unreachable)
    }

    /// Whether the error stops the whole run. Storage, I/O and integrity
    /// errors are raised for single items and only end up here when the run
    /// itself could not proceed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Storage | Self::Io | Self::Integrity(_))
    }
}

/// Raise a blob store error, escalating the kinds that mean the whole
/// container is out of reach.
pub(crate) fn storage_error(err: arca_storage::error::Error) -> Error {
    let kind = match &*err {
        StorageErrorKind::Unreachable(_) | StorageErrorKind::PermissionDenied(_) => ErrorKind::Unreachable,
        _ => ErrorKind::Storage,
    };
    err.raise(kind)
}

pub(crate) fn state_error(err: arca_state::error::Error) -> Error {
    let kind = match &*err {
        StateErrorKind::WrongPassphrase(_) => ErrorKind::WrongPassphrase,
        _ => ErrorKind::State,
    };
    err.raise(kind)
}

/// Raise a codec error. A blob that does not decrypt is an integrity
/// problem of that blob, not of the run.
pub(crate) fn crypto_error(err: arca_crypto::error::Error) -> Error {
    let kind = match &*err {
        CryptoErrorKind::Decrypt => ErrorKind::Integrity("blob does not decrypt".to_string()),
        _ => ErrorKind::Io,
    };
    err.raise(kind)
}

/// Render an error and its first chain of causes on one line, for reports
/// and log fields.
pub(crate) fn describe<E>(err: &exn::Exn<E>) -> String
where
    E: std::error::Error + Send + Sync + 'static,
{
    let mut parts = vec![err.frame().to_string()];
    let mut frame = err.frame();
    while let Some(child) = frame.children().first() {
        parts.push(child.to_string());
        frame = child;
    }
    parts.dedup();
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use exn::ResultExt;

    #[test]
    fn test_describe_walks_causes() {
        let io = std::io::Error::other("disk on fire");
        let err: Result<()> = Err(io).or_raise(|| ErrorKind::Io);
        assert_eq!(describe(&err.unwrap_err()), "local I/O error: disk on fire");
    }

    #[test]
    fn test_undecryptable_blob_is_not_fatal() {
        let codec = arca_crypto::Codec::new(arca_crypto::Passphrase::new("right"));
        let blob = codec.encrypt_to_vec(b"secret").unwrap();
        let wrong = arca_crypto::Codec::new(arca_crypto::Passphrase::new("wrong"));
        let err = crypto_error(wrong.decrypt_to_vec(&blob).unwrap_err());
        assert!(matches!(&*err, ErrorKind::Integrity(_)));
        assert!(!err.is_fatal());
    }
}
