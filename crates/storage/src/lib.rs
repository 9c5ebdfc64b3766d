//! Remote blob storage for arca.
//!
//! A container holds two flat folders, `chunks/` and `states/` (see
//! [`Folder`]). Every object carries a [`StorageTier`]; objects in the
//! archive tier cannot be read until they are rehydrated, which backends
//! report as [`ErrorKind::Archived`](crate::error::ErrorKind::Archived) rather
//! than blocking.

pub mod backend;
pub mod error;
mod models;
mod path;
mod tier;

pub use crate::backend::BlobStore;
pub use crate::models::{BlobInfo, Folder};
pub use crate::path::validate as validate_path;
pub use crate::tier::{SMALL_OBJECT_THRESHOLD, StorageTier, effective_tier};
use std::sync::Arc;

pub type BlobHandle = Arc<dyn BlobStore + Send + Sync>;
