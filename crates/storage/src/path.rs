//! Key validation.
//!
//! Blob keys look like relative paths (`chunks/<hash>`). Every backend runs
//! them through [`validate`] so that no key can escape the container root.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates and normalizes a blob key.
///
/// `.` components and repeated or trailing separators are dropped, `..`
/// is resolved, and anything that would leave the container root, carries a
/// Windows prefix, contains a NUL byte, or normalizes to nothing is rejected
/// with [`InvalidPath`](crate::error::ErrorKind::InvalidPath).
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use arca_storage::validate_path;
/// assert!(validate_path("chunks/9f86d081").is_ok());
/// assert!(validate_path("states/../chunks/9f86d081").is_ok()); // (never leaves the root)
/// assert!(validate_path("../chunks/9f86d081").is_err());
/// assert!(validate_path("a\0b").is_err());
/// assert_eq!(
///     validate_path("states//./2026-01-02T03-04-05/").unwrap(),
///     Path::new("states/2026-01-02T03-04-05")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}
