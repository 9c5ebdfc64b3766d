//! Storage tiers and the small-object policy.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Objects at or below this logical size are never placed in
/// [`StorageTier::Archive`]; see [`effective_tier`].
pub const SMALL_OBJECT_THRESHOLD: u64 = 1024 * 1024;

/// Remote object "temperature", hottest first.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    #[default]
    #[display("hot")]
    Hot,
    #[display("cool")]
    Cool,
    #[display("cold")]
    Cold,
    /// Cheapest to keep, unreadable until rehydrated.
    #[display("archive")]
    Archive,
}

impl StorageTier {
    /// Whether a blob in this tier can be read straight away.
    pub fn is_online(&self) -> bool {
        !matches!(self, Self::Archive)
    }
}

impl FromStr for StorageTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(Self::Hot),
            "cool" => Ok(Self::Cool),
            "cold" => Ok(Self::Cold),
            "archive" => Ok(Self::Archive),
            other => Err(format!("unknown storage tier `{other}`")),
        }
    }
}

/// The tier an object of `size` bytes is actually stored in when `requested`
/// is asked for.
///
/// Archive retrieval is priced per object, so small objects requested into
/// the archive tier are placed in [`StorageTier::Cold`] instead. Callers
/// record the returned tier rather than the requested one.
pub fn effective_tier(requested: StorageTier, size: u64) -> StorageTier {
    match requested {
        StorageTier::Archive if size <= SMALL_OBJECT_THRESHOLD => StorageTier::Cold,
        tier => tier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::tiny_archive(StorageTier::Archive, 10, StorageTier::Cold)]
    #[case::one_mebibyte(StorageTier::Archive, 1024 * 1024, StorageTier::Cold)]
    #[case::just_over(StorageTier::Archive, 1024 * 1024 + 1, StorageTier::Archive)]
    #[case::hot_small(StorageTier::Hot, 10, StorageTier::Hot)]
    #[case::cool_large(StorageTier::Cool, u64::MAX, StorageTier::Cool)]
    #[case::cold_small(StorageTier::Cold, 0, StorageTier::Cold)]
    fn small_objects_never_archived(#[case] requested: StorageTier, #[case] size: u64, #[case] expected: StorageTier) {
        assert_eq!(effective_tier(requested, size), expected);
    }

    #[rstest]
    #[case("hot", StorageTier::Hot)]
    #[case("Cool", StorageTier::Cool)]
    #[case("COLD", StorageTier::Cold)]
    #[case("archive", StorageTier::Archive)]
    fn parses_case_insensitively(#[case] input: &str, #[case] expected: StorageTier) {
        assert_eq!(input.parse::<StorageTier>().unwrap(), expected);
        assert_eq!(expected.to_string().parse::<StorageTier>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_tier() {
        assert!("glacier".parse::<StorageTier>().is_err());
    }
}
