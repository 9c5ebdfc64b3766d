#![allow(dead_code)]

use arca_crypto::Passphrase;
use arca_engine::{ArchiveConfig, ArchiveReport, Engine, RestoreConfig, RestoreReport};
use arca_storage::BlobHandle;
use arca_storage::backend::MockBackend;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const PASSPHRASE: &str = "correct horse battery staple";

/// One machine: a local root and a snapshot cache, on a shared store.
pub struct Machine {
    pub store: Arc<MockBackend>,
    pub engine: Engine,
    pub root: TempDir,
    pub cache: TempDir,
}

impl Machine {
    pub fn new() -> Self {
        Self::on(Arc::new(MockBackend::default()), PASSPHRASE)
    }

    pub fn on(store: Arc<MockBackend>, passphrase: &str) -> Self {
        let cache = tempfile::tempdir().unwrap();
        let handle: BlobHandle = store.clone();
        let engine = Engine::new(handle, Passphrase::new(passphrase), cache.path());
        Self {
            store,
            engine,
            root: tempfile::tempdir().unwrap(),
            cache,
        }
    }

    /// Another machine on the same store, with an empty root and cache.
    pub fn fresh(&self) -> Self {
        Self::on(Arc::clone(&self.store), PASSPHRASE)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    pub fn write(&self, name: &str, data: impl AsRef<[u8]>) -> PathBuf {
        let path = self.path(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        path
    }

    pub fn read(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.path(name)).unwrap()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    pub fn archive_config(&self) -> ArchiveConfig {
        let mut config = ArchiveConfig::new(self.root.path());
        config.hash_parallelism = 2;
        config.transfer_parallelism = 2;
        config
    }

    pub fn restore_config(&self, targets: &[&str]) -> RestoreConfig {
        let mut config = RestoreConfig::new(self.root.path(), targets.iter().map(|t| t.to_string()).collect());
        config.hash_parallelism = 2;
        config.transfer_parallelism = 2;
        config
    }

    pub async fn archive(&self) -> ArchiveReport {
        self.engine.archive(self.archive_config()).await.unwrap()
    }

    pub async fn restore(&self, targets: &[&str]) -> RestoreReport {
        self.engine.restore(self.restore_config(targets)).await.unwrap()
    }

    /// Names of every partial download left below the root.
    pub fn partial_files(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        collect_partials(self.root.path(), &mut found);
        found
    }
}

fn collect_partials(dir: &Path, found: &mut Vec<PathBuf>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect_partials(&path, found);
        } else if path.to_string_lossy().ends_with(".arca-partial") {
            found.push(path);
        }
    }
}

/// Incompressible test content.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill(&mut data[..]);
    data
}
