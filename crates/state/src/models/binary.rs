use super::{from_db_hash, from_db_size, from_db_tier, to_db_size};
use crate::error::{Error, ErrorKind};
use arca_crypto::Hash;
use arca_storage::StorageTier;

/// Where a packed binary lives inside its container chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parent {
    /// Hash of the container chunk.
    pub hash: Hash,
    /// Byte offset of the binary within the container's plaintext.
    pub offset: u64,
}

/// One row per distinct binary content ever archived.
///
/// Created once, on the first successful upload of that content, and never
/// deleted. Only [`tier`](Self::tier) may change afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryProperties {
    pub hash: Hash,
    /// Logical size of the binary in bytes.
    pub original_size: u64,
    /// Bytes actually stored remotely for this binary. For packed binaries
    /// this is the binary's proportional share of its container.
    pub archived_size: u64,
    /// Effective tier, after the small-object policy. A chunked binary
    /// carries the coldest tier among its chunks.
    pub tier: StorageTier,
    pub parent: Option<Parent>,
}

/// One row per object under `chunks/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    pub hash: Hash,
    pub original_size: u64,
    pub archived_size: u64,
    pub tier: StorageTier,
}

#[derive(sqlx::FromRow)]
pub(crate) struct BinaryRow {
    pub(crate) hash: String,
    pub(crate) original_size: i64,
    pub(crate) archived_size: i64,
    pub(crate) storage_tier: String,
    pub(crate) parent_hash: Option<String>,
    pub(crate) parent_offset: Option<i64>,
}
impl TryFrom<&BinaryProperties> for BinaryRow {
    type Error = Error;
    fn try_from(props: &BinaryProperties) -> Result<Self, Self::Error> {
        Ok(Self {
            hash: props.hash.to_string(),
            original_size: to_db_size(props.original_size, "original size")?,
            archived_size: to_db_size(props.archived_size, "archived size")?,
            storage_tier: props.tier.to_string(),
            parent_hash: props.parent.map(|p| p.hash.to_string()),
            parent_offset: props.parent.map(|p| to_db_size(p.offset, "parent offset")).transpose()?,
        })
    }
}
impl TryFrom<BinaryRow> for BinaryProperties {
    type Error = Error;
    fn try_from(row: BinaryRow) -> Result<Self, Self::Error> {
        let parent = match (row.parent_hash, row.parent_offset) {
            (Some(hash), Some(offset)) => Some(Parent {
                hash: from_db_hash(&hash)?,
                offset: from_db_size(offset, "parent offset")?,
            }),
            (None, None) => None,
            _ => exn::bail!(ErrorKind::InvalidData("parent hash without offset")),
        };
        Ok(Self {
            hash: from_db_hash(&row.hash)?,
            original_size: from_db_size(row.original_size, "original size")?,
            archived_size: from_db_size(row.archived_size, "archived size")?,
            tier: from_db_tier(&row.storage_tier)?,
            parent,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ChunkRow {
    pub(crate) hash: String,
    pub(crate) original_size: i64,
    pub(crate) archived_size: i64,
    pub(crate) storage_tier: String,
}
impl TryFrom<&ChunkInfo> for ChunkRow {
    type Error = Error;
    fn try_from(chunk: &ChunkInfo) -> Result<Self, Self::Error> {
        Ok(Self {
            hash: chunk.hash.to_string(),
            original_size: to_db_size(chunk.original_size, "original size")?,
            archived_size: to_db_size(chunk.archived_size, "archived size")?,
            storage_tier: chunk.tier.to_string(),
        })
    }
}
impl TryFrom<ChunkRow> for ChunkInfo {
    type Error = Error;
    fn try_from(row: ChunkRow) -> Result<Self, Self::Error> {
        Ok(Self {
            hash: from_db_hash(&row.hash)?,
            original_size: from_db_size(row.original_size, "original size")?,
            archived_size: from_db_size(row.archived_size, "archived size")?,
            tier: from_db_tier(&row.storage_tier)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
    const PARENT: &str = "692ed948ccd76c2230efe90175a519a3092b1862ab049704b7221738e56028ca";

    #[test]
    fn test_row_to_model() {
        let row = BinaryRow {
            hash: HASH.to_uppercase(),
            original_size: 1024,
            archived_size: 512,
            storage_tier: "cold".to_string(),
            parent_hash: Some(PARENT.to_string()),
            parent_offset: Some(4096),
        };
        let model = BinaryProperties::try_from(row).unwrap();
        assert_eq!(model.hash.to_string(), HASH);
        assert_eq!(model.tier, StorageTier::Cold);
        assert_eq!(model.parent.unwrap().offset, 4096);
    }

    #[test]
    fn test_model_to_row() {
        let model = BinaryProperties {
            hash: HASH.parse().unwrap(),
            original_size: 10,
            archived_size: 48,
            tier: StorageTier::Archive,
            parent: None,
        };
        let row = BinaryRow::try_from(&model).unwrap();
        assert_eq!(row.storage_tier, "archive");
        assert_eq!(row.parent_hash, None);
        assert_eq!(row.parent_offset, None);
    }

    #[test]
    fn test_rejects_half_parent() {
        let row = BinaryRow {
            hash: HASH.to_string(),
            original_size: 1,
            archived_size: 1,
            storage_tier: "hot".to_string(),
            parent_hash: Some(PARENT.to_string()),
            parent_offset: None,
        };
        let err = BinaryProperties::try_from(row).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData(_)));
    }

    #[test]
    fn test_rejects_negative_size() {
        let row = ChunkRow {
            hash: HASH.to_string(),
            original_size: -1,
            archived_size: 1,
            storage_tier: "hot".to_string(),
        };
        assert!(ChunkInfo::try_from(row).is_err());
    }
}
