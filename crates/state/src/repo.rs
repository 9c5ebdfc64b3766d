//! Repository over binaries, chunks and pointer file entries.
//!
//! Binaries and chunks are content-addressed and insert-only: inserting a
//! hash that is already known is a no-op. Pointer file entries form an
//! append-only log keyed by `(relative_name, version)`; the current state at
//! a version is the newest entry per name at or before it.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{
    BinaryProperties, BinaryRow, ChunkInfo, ChunkRow, CurrentEntry, CurrentEntryRow, EntryRow, PointerFileEntry,
    from_db_hash, from_db_size,
};
use arca_crypto::Hash;
use arca_storage::StorageTier;
use exn::ResultExt;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::instrument;

/// Row counts, mostly useful in tests and run summaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub binaries: u64,
    pub chunks: u64,
    pub entries: u64,
}

/// Repository for all rows of one state database.
///
/// Cheap to clone; clones share the pending-changes flag and the write lock.
/// Reads run concurrently. Writes are serialized so that the
/// read-then-write of [`upsert_pointer_file_entries`](Self::upsert_pointer_file_entries)
/// cannot interleave.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
    pending: Arc<AtomicBool>,
    write_lock: Arc<Mutex<()>>,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }
}
impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            pending: Arc::new(AtomicBool::new(false)),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Whether anything was written since this repository was created.
    ///
    /// Inserting rows that already exist, or entries that do not change the
    /// current state, does not count.
    pub fn has_pending_changes(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn mark_pending(&self, rows: u64) {
        if rows > 0 {
            self.pending.store(true, Ordering::SeqCst);
        }
    }

    // =========================================================================
    // Binaries and chunks
    // =========================================================================

    pub async fn get_binary_properties(&self, hash: &Hash) -> Result<Option<BinaryProperties>> {
        let row: Option<BinaryRow> = sqlx::query_as(include_str!("../queries/get_binary_properties.sql"))
            .bind(hash.to_string())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(BinaryProperties::try_from).transpose()
    }

    /// Insert binary properties; hashes that are already known are left as
    /// they are. Returns how many rows were new.
    ///
    /// Chunks referenced as parents must have been added first.
    #[instrument(level = "debug", skip_all, fields(batch = batch.len()))]
    pub async fn add_binary_properties(&self, batch: &[BinaryProperties]) -> Result<u64> {
        let rows = batch.iter().map(BinaryRow::try_from).collect::<Result<Vec<_>>>()?;
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut inserted = 0;
        for row in rows {
            let result = sqlx::query(include_str!("../queries/insert_binary_properties.sql"))
                .bind(row.hash)
                .bind(row.original_size)
                .bind(row.archived_size)
                .bind(row.storage_tier)
                .bind(row.parent_hash)
                .bind(row.parent_offset)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
            inserted += result.rows_affected();
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        self.mark_pending(inserted);
        Ok(inserted)
    }

    /// Insert chunk rows; known hashes are left as they are. Returns how
    /// many rows were new.
    pub async fn add_chunks(&self, batch: &[ChunkInfo]) -> Result<u64> {
        let rows = batch.iter().map(ChunkRow::try_from).collect::<Result<Vec<_>>>()?;
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut inserted = 0;
        for row in rows {
            let result = sqlx::query(include_str!("../queries/insert_chunk.sql"))
                .bind(row.hash)
                .bind(row.original_size)
                .bind(row.archived_size)
                .bind(row.storage_tier)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
            inserted += result.rows_affected();
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        self.mark_pending(inserted);
        Ok(inserted)
    }

    pub async fn get_chunk(&self, hash: &Hash) -> Result<Option<ChunkInfo>> {
        let row: Option<ChunkRow> = sqlx::query_as(include_str!("../queries/get_chunk.sql"))
            .bind(hash.to_string())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(ChunkInfo::try_from).transpose()
    }

    /// Insert a binary that was split into several chunks together with its
    /// ordered chunk list, in one transaction. Returns `false` if the binary
    /// was already known, in which case nothing is written.
    ///
    /// Every chunk must already exist.
    #[instrument(level = "debug", skip_all, fields(hash = %props.hash, chunks = chunks.len()))]
    pub async fn add_chunked_binary(&self, props: &BinaryProperties, chunks: &[Hash]) -> Result<bool> {
        let row = BinaryRow::try_from(props)?;
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let inserted = sqlx::query(include_str!("../queries/insert_binary_properties.sql"))
            .bind(row.hash)
            .bind(row.original_size)
            .bind(row.archived_size)
            .bind(row.storage_tier)
            .bind(row.parent_hash)
            .bind(row.parent_offset)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?
            .rows_affected();
        if inserted == 0 {
            return Ok(false);
        }
        for (ordinal, chunk) in chunks.iter().enumerate() {
            let ordinal = i64::try_from(ordinal).or_raise(|| ErrorKind::InvalidData("chunk ordinal"))?;
            sqlx::query(include_str!("../queries/insert_chunk_list_item.sql"))
                .bind(props.hash.to_string())
                .bind(ordinal)
                .bind(chunk.to_string())
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Constraint(format!("chunk list of {}", props.hash)))?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        self.mark_pending(inserted);
        Ok(true)
    }

    /// Ordered chunk hashes of a binary; empty unless it was split.
    pub async fn chunk_list(&self, binary: &Hash) -> Result<Vec<Hash>> {
        let hashes: Vec<String> = sqlx::query_scalar(include_str!("../queries/get_chunk_list.sql"))
            .bind(binary.to_string())
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        hashes.iter().map(|hash| from_db_hash(hash)).collect()
    }

    /// Record a tier change for a binary and for the chunk of the same hash,
    /// if there is one. Returns `true` if anything changed.
    pub async fn set_storage_tier(&self, hash: &Hash, tier: StorageTier) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut changed = 0;
        for query in [include_str!("../queries/set_binary_tier.sql"), include_str!("../queries/set_chunk_tier.sql")] {
            let result = sqlx::query(query)
                .bind(tier.to_string())
                .bind(hash.to_string())
                .bind(tier.to_string())
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
            changed += result.rows_affected();
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        self.mark_pending(changed);
        Ok(changed > 0)
    }

    // =========================================================================
    // Pointer file entries
    // =========================================================================

    async fn latest_entry(&self, relative_name: &str) -> Result<Option<PointerFileEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(include_str!("../queries/get_latest_entry.sql"))
            .bind(relative_name)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(PointerFileEntry::try_from).transpose()
    }

    async fn insert_entry(&self, entry: &PointerFileEntry, version: &str) -> Result<()> {
        let row = EntryRow::new(entry, version)?;
        sqlx::query(include_str!("../queries/insert_entry.sql"))
            .bind(row.relative_name)
            .bind(row.version)
            .bind(row.hash)
            .bind(row.creation_time)
            .bind(row.last_write_time)
            .bind(row.is_deleted)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Constraint(format!("entry for {} needs its binary first", entry.relative_name)))?;
        Ok(())
    }

    /// Write entries for `version`, skipping those that would not change
    /// the current state of their name. Returns how many were written.
    ///
    /// Each entry's binary properties must already exist.
    #[instrument(level = "debug", skip(self, batch), fields(batch = batch.len()))]
    pub async fn upsert_pointer_file_entries(&self, version: &str, batch: &[PointerFileEntry]) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut written = 0;
        for entry in batch {
            let current = self.latest_entry(&entry.relative_name).await?;
            if !entry.differs_from(current.as_ref()) {
                continue;
            }
            self.insert_entry(entry, version).await?;
            written += 1;
        }
        self.mark_pending(written);
        Ok(written)
    }

    /// Stream the current entries at `at` (`None` for the newest state)
    /// whose relative name starts with `prefix`, in name order.
    ///
    /// A directory prefix should end with `/`, otherwise `photos` also
    /// matches `photos-old/…`.
    pub fn current_entries<'a>(&'a self, prefix: Option<&str>, at: Option<&str>) -> BoxStream<'a, Result<CurrentEntry>> {
        let lower = prefix.unwrap_or_default().to_string();
        let upper = prefix.and_then(prefix_upper_bound);
        sqlx::query_as::<_, CurrentEntryRow>(include_str!("../queries/current_entries.sql"))
            .bind(at.map(str::to_string))
            .bind(lower)
            .bind(upper)
            .fetch(&self.pool)
            .map(|row| row.or_raise(|| ErrorKind::Database).and_then(CurrentEntry::try_from))
            .boxed()
    }

    /// Collect [`current_entries()`](Self::current_entries) into a [`Vec`].
    pub async fn current_entries_vec(&self, prefix: Option<&str>, at: Option<&str>) -> Result<Vec<CurrentEntry>> {
        self.current_entries(prefix, at).try_collect().await
    }

    /// Write a deletion marker in `version` for every current entry whose
    /// name matches `predicate`. History is never removed. Returns how many
    /// markers were written.
    #[instrument(level = "debug", skip(self, predicate))]
    pub async fn delete_entries<F>(&self, version: &str, predicate: F) -> Result<u64>
    where
        F: Fn(&str) -> bool,
    {
        let doomed: Vec<PointerFileEntry> = self
            .current_entries(None, None)
            .try_filter_map(|current| {
                let keep = predicate(&current.entry.relative_name);
                async move { Ok(keep.then(|| current.entry.deleted())) }
            })
            .try_collect()
            .await?;
        self.upsert_pointer_file_entries(version, &doomed).await
    }

    pub async fn counts(&self) -> Result<Counts> {
        let (binaries, chunks, entries): (i64, i64, i64) = sqlx::query_as(include_str!("../queries/counts.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(Counts {
            binaries: from_db_size(binaries, "count")?,
            chunks: from_db_size(chunks, "count")?,
            entries: from_db_size(entries, "count")?,
        })
    }
}

/// Smallest string greater than every string starting with `prefix`, or
/// `None` when there is no such bound (empty prefix, or nothing to bump).
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        // Skip the surrogate gap; `char::from_u32` rejects it.
        let next = (u32::from(last) + 1..=u32::from(char::MAX)).find_map(char::from_u32);
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}
