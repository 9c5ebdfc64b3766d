use crate::error::{Error, ErrorKind};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 32-byte content address.
///
/// Equality is byte-wise, so two hex renderings that differ only in letter
/// case parse to equal values. Always displayed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Length of the raw digest in bytes.
    pub const LEN: usize = 32;

    pub(crate) fn from_digest(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

/// Parses 64 hex characters in either case. Anything else is rejected, so a
/// hash read back from a pointer file or the state database is always a full
/// digest.
impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        if s.len() != Self::LEN * 2 {
            exn::bail!(ErrorKind::InvalidHash(s.to_string()));
        }
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ErrorKind::InvalidHash(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| serde::de::Error::custom(format!("invalid hash `{s}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const LOWER: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn display_is_lowercase_hex() {
        let hash: Hash = LOWER.to_uppercase().parse().unwrap();
        assert_eq!(hash.to_string(), LOWER);
    }

    #[test]
    fn parsing_ignores_case() {
        let lower: Hash = LOWER.parse().unwrap();
        let upper: Hash = LOWER.to_uppercase().parse().unwrap();
        assert_eq!(lower, upper);
    }

    #[rstest]
    #[case::empty("")]
    #[case::too_short("9f86d081")]
    #[case::too_long(&format!("{LOWER}00"))]
    #[case::not_hex(&"zz".repeat(32))]
    fn rejects_invalid_text(#[case] input: &str) {
        let err = input.parse::<Hash>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidHash(_)));
    }

    #[test]
    fn serializes_as_string() {
        let hash: Hash = LOWER.parse().unwrap();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{LOWER}\""));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(serde_json::from_str::<Hash>("\"nope\"").is_err());
    }
}
