//! Pointer files.
//!
//! A pointer file sits next to its binary as `<binary>.pointer.arca` and
//! records which content the binary held when it was archived. It is the
//! only local trace left once a binary is removed after archiving.

use arca_config::POINTER_EXTENSION;
use arca_crypto::Hash;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use time::UtcDateTime;

/// Contents of a pointer file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerFile {
    pub hash: Hash,
    /// Size of the binary in bytes.
    pub size: u64,
    #[serde(with = "unix_nanos")]
    pub created: UtcDateTime,
    #[serde(with = "unix_nanos")]
    pub modified: UtcDateTime,
}

impl PointerFile {
    pub async fn read(path: &Path) -> io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        serde_json::from_slice(&bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Write the pointer file, unless one with identical contents is already
    /// there. Returns `true` if the file was written.
    pub async fn write_if_changed(&self, path: &Path) -> io::Result<bool> {
        if let Ok(existing) = Self::read(path).await
            && existing == *self
        {
            return Ok(false);
        }
        let json = serde_json::to_vec(self).map_err(io::Error::other)?;
        tokio::fs::write(path, json).await?;
        Ok(true)
    }

    /// Whether a binary with this size and modification time can be assumed
    /// to still hold [`hash`](Self::hash) without hashing it again.
    pub fn matches(&self, size: u64, modified: UtcDateTime) -> bool {
        self.size == size && self.modified == modified
    }
}

/// Pointer file path for a binary path.
pub fn pointer_path(binary: &Path) -> PathBuf {
    let mut name = binary.as_os_str().to_owned();
    name.push(POINTER_EXTENSION);
    PathBuf::from(name)
}

/// The binary file name a pointer file name refers to, or `None` if `name`
/// is not a pointer file name.
pub fn binary_name(name: &str) -> Option<&str> {
    name.strip_suffix(POINTER_EXTENSION).filter(|binary| !binary.is_empty())
}

mod unix_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::UtcDateTime;

    pub(super) fn serialize<S: Serializer>(value: &UtcDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = i64::try_from(value.unix_timestamp_nanos()).map_err(serde::ser::Error::custom)?;
        serializer.serialize_i64(nanos)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UtcDateTime, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        UtcDateTime::from_unix_timestamp_nanos(i128::from(nanos)).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_crypto::{ContentHasher, Passphrase};
    use rstest::rstest;

    fn pointer() -> PointerFile {
        let at = UtcDateTime::from_unix_timestamp_nanos(1_750_000_000_123_456_789).unwrap();
        PointerFile {
            hash: ContentHasher::new(&Passphrase::new("pw")).hash_bytes(b"content"),
            size: 7,
            created: at,
            modified: at,
        }
    }

    #[test]
    fn test_json_layout() {
        let json: serde_json::Value = serde_json::to_value(pointer()).unwrap();
        assert_eq!(json["size"], 7);
        assert_eq!(json["modified"], 1_750_000_000_123_456_789_i64);
        assert_eq!(json["hash"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_write_if_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = pointer_path(&dir.path().join("cat.jpg"));
        assert!(path.ends_with("cat.jpg.pointer.arca"));

        assert!(pointer().write_if_changed(&path).await.unwrap());
        assert!(!pointer().write_if_changed(&path).await.unwrap());
        assert_eq!(PointerFile::read(&path).await.unwrap(), pointer());

        let mut changed = pointer();
        changed.size = 8;
        assert!(changed.write_if_changed(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_garbage_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pointer.arca");
        std::fs::write(&path, b"not json").unwrap();
        assert_eq!(PointerFile::read(&path).await.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[rstest]
    #[case("cat.jpg.pointer.arca", Some("cat.jpg"))]
    #[case("cat.jpg", None)]
    #[case(".pointer.arca", None)]
    fn test_binary_name(#[case] name: &str, #[case] expected: Option<&str>) {
        assert_eq!(binary_name(name), expected);
    }
}
