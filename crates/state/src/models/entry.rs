use super::{BinaryRow, from_db_hash, from_db_time, to_db_time};
use crate::BinaryProperties;
use crate::error::Error;
use arca_crypto::Hash;
use time::UtcDateTime;

/// A relative name pointing at a binary, as recorded in one version.
///
/// Relative names always use `/` as separator and never carry the pointer
/// file extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointerFileEntry {
    pub relative_name: String,
    pub hash: Hash,
    pub creation_time: UtcDateTime,
    pub last_write_time: UtcDateTime,
    pub is_deleted: bool,
}

impl PointerFileEntry {
    /// The deletion marker that hides this entry from later versions.
    pub fn deleted(&self) -> Self {
        Self {
            is_deleted: true,
            ..self.clone()
        }
    }

    /// Whether writing `self` on top of `current` records a change.
    ///
    /// Creation time is best-effort on some platforms and is ignored.
    pub fn differs_from(&self, current: Option<&PointerFileEntry>) -> bool {
        match current {
            None => !self.is_deleted,
            Some(current) => {
                current.is_deleted != self.is_deleted
                    || current.hash != self.hash
                    || current.last_write_time != self.last_write_time
            },
        }
    }
}

/// A current entry at some version, joined with its binary's properties.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurrentEntry {
    pub entry: PointerFileEntry,
    /// Version the entry was written in; at or before the queried version.
    pub version: String,
    /// Missing only if the snapshot is inconsistent.
    pub properties: Option<BinaryProperties>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub(crate) relative_name: String,
    pub(crate) version: String,
    pub(crate) hash: String,
    pub(crate) creation_time: i64,
    pub(crate) last_write_time: i64,
    pub(crate) is_deleted: bool,
}
impl EntryRow {
    pub(crate) fn new(entry: &PointerFileEntry, version: &str) -> Result<Self, Error> {
        Ok(Self {
            relative_name: entry.relative_name.clone(),
            version: version.to_string(),
            hash: entry.hash.to_string(),
            creation_time: to_db_time(entry.creation_time)?,
            last_write_time: to_db_time(entry.last_write_time)?,
            is_deleted: entry.is_deleted,
        })
    }
}
impl TryFrom<EntryRow> for PointerFileEntry {
    type Error = Error;
    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            relative_name: row.relative_name,
            hash: from_db_hash(&row.hash)?,
            creation_time: from_db_time(row.creation_time)?,
            last_write_time: from_db_time(row.last_write_time)?,
            is_deleted: row.is_deleted,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct CurrentEntryRow {
    #[sqlx(flatten)]
    pub(crate) entry: EntryRow,
    pub(crate) original_size: Option<i64>,
    pub(crate) archived_size: Option<i64>,
    pub(crate) storage_tier: Option<String>,
    pub(crate) parent_hash: Option<String>,
    pub(crate) parent_offset: Option<i64>,
}
impl TryFrom<CurrentEntryRow> for CurrentEntry {
    type Error = Error;
    fn try_from(row: CurrentEntryRow) -> Result<Self, Self::Error> {
        let properties = match (row.original_size, row.archived_size, row.storage_tier) {
            (Some(original_size), Some(archived_size), Some(storage_tier)) => Some(BinaryProperties::try_from(BinaryRow {
                hash: row.entry.hash.clone(),
                original_size,
                archived_size,
                storage_tier,
                parent_hash: row.parent_hash,
                parent_offset: row.parent_offset,
            })?),
            _ => None,
        };
        let version = row.entry.version.clone();
        Ok(Self {
            entry: PointerFileEntry::try_from(row.entry)?,
            version,
            properties,
        })
    }
}
