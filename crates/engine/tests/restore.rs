mod common;

use arca_engine::RunStatus;
use arca_engine::error::ErrorKind;
use arca_storage::{BlobStore, Folder, StorageTier};
use common::{Machine, random_bytes};
use futures::TryStreamExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

#[tokio::test(flavor = "multi_thread")]
async fn test_restore_round_trip_keeps_modification_time() {
    let machine = Machine::new();
    let path = machine.write("docs/report.pdf", random_bytes(30_000, 10));
    let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    std::fs::File::options().write(true).open(&path).unwrap().set_modified(modified).unwrap();
    machine.write("readme.txt", b"hello");
    machine.archive().await;

    let target = machine.fresh();
    let report = target.restore(&[]).await;
    assert_eq!(report.status(), RunStatus::Success);
    assert_eq!(report.stats.resolved, 2);
    assert_eq!(report.stats.restored, 2);
    assert_eq!(target.read("docs/report.pdf"), random_bytes(30_000, 10));
    assert_eq!(target.read("readme.txt"), b"hello");
    assert!(target.exists("docs/report.pdf.pointer.arca"));
    let restored = std::fs::metadata(target.path("docs/report.pdf")).unwrap().modified().unwrap();
    assert_eq!(restored, modified);
    assert!(target.partial_files().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_correct_local_files_are_skipped() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    machine.write("b.txt", b"beta");
    machine.archive().await;

    machine.write("b.txt", b"BETA");
    let reads = machine.store.read_count();
    let report = machine.restore(&[]).await;
    assert_eq!(report.stats.skipped, 1);
    assert_eq!(report.stats.restored, 1);
    assert_eq!(report.stats.chunks_downloaded, 1);
    assert_eq!(machine.read("b.txt"), b"beta");
    assert!(machine.store.read_count() > reads);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restore_without_pointers_removes_them() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    machine.archive().await;
    std::fs::remove_file(machine.path("a.txt")).unwrap();

    let mut config = machine.restore_config(&["a.txt.pointer.arca"]);
    config.keep_pointers = false;
    let report = machine.engine.restore(config).await.unwrap();
    assert_eq!(report.stats.restored, 1);
    assert_eq!(machine.read("a.txt"), b"alpha");
    assert!(!machine.exists("a.txt.pointer.arca"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_archived_binaries_wait_for_rehydration() {
    let machine = Machine::new();
    let data = random_bytes(2 * 1024 * 1024, 11);
    machine.write("cold/movie.mkv", &data);
    machine.write("warm.txt", b"warm");
    let mut config = machine.archive_config();
    config.tier = StorageTier::Archive;
    machine.engine.archive(config).await.unwrap();

    let target = machine.fresh();
    let first = target.restore(&[]).await;
    assert_eq!(first.status(), RunStatus::Success);
    assert_eq!(first.stats.restored, 1);
    assert_eq!(first.stats.pending, 1);
    assert_eq!(first.pending_rehydration, vec!["cold/movie.mkv".to_string()]);
    assert!(!target.exists("cold/movie.mkv"));
    assert!(target.partial_files().is_empty());

    assert_eq!(machine.store.complete_all_rehydrations(), 1);
    let second = target.restore(&[]).await;
    assert_eq!(second.stats.skipped, 1);
    assert_eq!(second.stats.restored, 1);
    assert_eq!(second.stats.pending, 0);
    assert_eq!(target.read("cold/movie.mkv"), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_archived_binaries_without_rehydration_requests() {
    let machine = Machine::new();
    machine.write("movie.mkv", random_bytes(2 * 1024 * 1024, 12));
    let mut config = machine.archive_config();
    config.tier = StorageTier::Archive;
    machine.engine.archive(config).await.unwrap();

    let mut config = machine.restore_config(&[]);
    config.request_rehydration = false;
    std::fs::remove_file(machine.path("movie.mkv")).unwrap();
    let report = machine.engine.restore(config).await.unwrap();
    assert_eq!(report.stats.pending, 1);
    assert_eq!(machine.store.complete_all_rehydrations(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_target_is_an_item_failure() {
    let machine = Machine::new();
    machine.write("photos/a.jpg", b"a");
    machine.archive().await;

    let target = machine.fresh();
    let report = target.restore(&["photos", "videos"]).await;
    assert_eq!(report.status(), RunStatus::PartialFailure);
    assert_eq!(report.stats.restored, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, "videos");
    assert!(target.exists("photos/a.jpg"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_version_aborts() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    machine.archive().await;

    let mut config = machine.restore_config(&[]);
    config.version = Some("1970-01-01T00-00-00".to_string());
    let err = machine.engine.restore(config).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::VersionNotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_repository_restores_nothing() {
    let machine = Machine::new();
    let everything = machine.restore(&[]).await;
    assert_eq!(everything.version, None);
    assert_eq!(everything.status(), RunStatus::Success);

    let specific = machine.restore(&["a.txt"]).await;
    assert_eq!(specific.status(), RunStatus::PartialFailure);
    assert_eq!(specific.failures[0].path, "a.txt");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_store_aborts_restore() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    machine.archive().await;
    machine.store.set_unreachable(true);

    let target = machine.fresh();
    let err = target.engine.restore(target.restore_config(&[])).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Unreachable));
    assert!(!target.exists("a.txt"));
}

/// Flip one byte in the middle of a stored blob.
async fn corrupt(machine: &Machine, key: &Path) {
    let mut data = machine.store.raw(key).unwrap();
    let middle = data.len() / 2;
    data[middle] ^= 0xff;
    machine.store.write(key, &data, StorageTier::Cool).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupt_chunk_is_downloaded_twice_then_fails_alone() {
    let machine = Machine::new();
    machine.write("a.txt", random_bytes(40_000, 13));
    machine.write("b.txt", b"beta");
    machine.archive().await;

    let entries: Vec<arca_engine::CurrentEntry> =
        machine.engine.query_entries(Some("a.txt"), None).try_collect().await.unwrap();
    corrupt(&machine, &Folder::Chunks.key(entries[0].entry.hash.to_string())).await;
    std::fs::remove_file(machine.path("a.txt")).unwrap();

    let reads = machine.store.read_count();
    let report = machine.restore(&[]).await;
    assert_eq!(report.status(), RunStatus::PartialFailure);
    assert_eq!(report.stats.skipped, 1);
    assert_eq!(report.stats.restored, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, "a.txt");
    assert!(report.failures[0].reason.contains("integrity"), "{}", report.failures[0].reason);
    assert_eq!(machine.store.read_count() - reads, 2);
    assert!(!machine.exists("a.txt"));
    assert!(machine.partial_files().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupt_container_fails_its_members() {
    let machine = Machine::new();
    for i in 0..3 {
        machine.write(&format!("notes/{i}.txt"), format!("note number {i}"));
    }
    let mut config = machine.archive_config();
    config.pack_threshold = Some(64 * 1024);
    machine.engine.archive(config).await.unwrap();
    let containers = machine.store.keys(Folder::Chunks);
    assert_eq!(containers.len(), 1);
    corrupt(&machine, &containers[0]).await;

    let target = machine.fresh();
    let report = target.restore(&["notes"]).await;
    assert_eq!(report.status(), RunStatus::PartialFailure);
    assert_eq!(report.stats.restored, 0);
    assert_eq!(report.failures.len(), 3);
    assert!(report.failures.iter().all(|failure| failure.reason.contains("integrity")));
    assert!(!target.exists("notes/0.txt"));
    assert!(target.partial_files().is_empty());
    assert!(!target.exists(&format!(".arca-containers-{}", std::process::id())));
}
