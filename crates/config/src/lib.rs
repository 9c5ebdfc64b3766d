//! Configuration for arca.
//!
//! A [`Config`] is merged from, lowest precedence first: built-in defaults,
//! one configuration file (TOML, YAML or JSON, picked by extension), and
//! `ARCA_`-prefixed environment variables where `__` separates nesting
//! levels (`ARCA_REPOSITORY__BACKEND__BUCKET=photos`).
//!
//! ```toml
//! [repository]
//! passphrase = "correct horse battery staple"
//!
//! [repository.backend]
//! type = "local"
//! path = "/mnt/backup/arca"
//!
//! [archive]
//! tier = "archive"
//!
//! [archive.chunking]
//! strategy = "rolling_hash"
//! min_size = 65536
//! ```

pub mod error;
mod operation;
mod repository;

pub use crate::operation::{
    ArchiveConfig, ArchiveOptions, POINTER_EXTENSION, RestoreConfig, RestoreOptions, normalize_target,
};
pub use crate::repository::{BackendConfig, RepositoryConfig, RetryOptions, Secret};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Prefix of environment variables read by [`Config::load`].
pub const ENV_PREFIX: &str = "ARCA_";

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub archive: ArchiveOptions,
    #[serde(default)]
    pub restore: RestoreOptions,
}

impl Config {
    /// Load from an optional file plus the environment, then validate the
    /// repository section.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(file) = file {
            figment = match file.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file_exact(file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file_exact(file)),
                Some("json") => figment.merge(Json::file_exact(file)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(file.to_path_buf())),
            };
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate from an already assembled [`Figment`].
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.repository.validate()?;
        Ok(config)
    }

    /// Archive settings for `root`, from the configured defaults.
    pub fn archive_config(&self, root: impl Into<PathBuf>) -> ArchiveConfig {
        self.archive.clone().into_config(root)
    }

    /// Restore settings for `root` and `targets`, from the configured
    /// defaults.
    pub fn restore_config(&self, root: impl Into<PathBuf>, targets: Vec<String>) -> RestoreConfig {
        self.restore.clone().into_config(root, targets)
    }
}
