mod binary;
mod entry;

pub use self::binary::{BinaryProperties, ChunkInfo, Parent};
pub(crate) use self::binary::{BinaryRow, ChunkRow};
pub use self::entry::{CurrentEntry, PointerFileEntry};
pub(crate) use self::entry::{CurrentEntryRow, EntryRow};
use crate::error::{ErrorKind, Result};
use arca_crypto::Hash;
use arca_storage::StorageTier;
use exn::ResultExt;
use time::UtcDateTime;

// SQLite integers are signed; sizes and offsets are stored as i64 and
// converted at this boundary only.

pub(crate) fn to_db_size(value: u64, what: &'static str) -> Result<i64> {
    i64::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn from_db_size(value: i64, what: &'static str) -> Result<u64> {
    u64::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn to_db_time(value: UtcDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos()).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

pub(crate) fn from_db_time(value: i64) -> Result<UtcDateTime> {
    UtcDateTime::from_unix_timestamp_nanos(i128::from(value)).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

pub(crate) fn from_db_hash(value: &str) -> Result<Hash> {
    value.parse::<Hash>().or_raise(|| ErrorKind::InvalidData("hash"))
}

pub(crate) fn from_db_tier(value: &str) -> Result<StorageTier> {
    value.parse::<StorageTier>().map_err(|_| ErrorKind::InvalidData("storage tier").into())
}
