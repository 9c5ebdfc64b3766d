//! Versioned state index for an arca repository.
//!
//! The state index is an SQLite database recording every distinct binary
//! ever archived ([`BinaryProperties`]), the chunks that hold it, and an
//! append-only log of [`PointerFileEntry`] rows keyed by relative name and
//! repository version. Each archive run that changes anything uploads the
//! whole database as a new encrypted snapshot under `states/`; snapshots are
//! immutable once uploaded, so a downloaded copy stays valid forever and is
//! cached locally by version name.
//!
//! # Architecture
//! - [`Database`] owns the connection pool, pragmas and migrations.
//! - [`Repository`] is the only way rows are read or written.
//! - [`StateStore`] moves snapshots between the blob store and the local
//!   cache, and hands out [`WorkingState`] (read-write, for archive runs) and
//!   [`Snapshot`] (read-only, for restores and queries).

mod db;
pub mod error;
mod models;
mod repo;
mod snapshot;

pub use crate::db::Database;
pub use crate::models::{BinaryProperties, ChunkInfo, CurrentEntry, Parent, PointerFileEntry};
pub use crate::repo::{Counts, Repository};
pub use crate::snapshot::{Snapshot, StateStore, VERSION_FORMAT, WorkingState, next_version_name};
