mod common;

use arca_chunk::{Chunker, RollingHashParams};
use arca_engine::error::ErrorKind;
use arca_engine::{CurrentEntry, Engine, RunStatus};
use arca_storage::{Folder, StorageTier};
use common::{Machine, PASSPHRASE, random_bytes};
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;

async fn entries(machine: &Machine, version: Option<&str>) -> Vec<CurrentEntry> {
    machine.engine.query_entries(None, version).try_collect().await.unwrap()
}

fn names(entries: &[CurrentEntry]) -> Vec<&str> {
    entries.iter().map(|current| current.entry.relative_name.as_str()).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_first_archive_uploads_everything() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    machine.write("photos/cat.jpg", random_bytes(200_000, 1));

    let report = machine.archive().await;
    assert_eq!(report.status(), RunStatus::Success);
    assert!(report.version.is_some());
    assert_eq!(report.stats.indexed, 2);
    assert_eq!(report.stats.hashed, 2);
    assert_eq!(report.stats.uploaded, 2);
    assert_eq!(report.stats.pointers_written, 2);
    assert_eq!(report.stats.entries_written, 2);
    assert!(machine.exists("a.txt.pointer.arca"));
    assert!(machine.exists("photos/cat.jpg.pointer.arca"));
    assert_eq!(machine.store.keys(Folder::Chunks).len(), 2);
    assert_eq!(machine.store.keys(Folder::States).len(), 1);

    let current = entries(&machine, None).await;
    assert_eq!(names(&current), vec!["a.txt", "photos/cat.jpg"]);
    let cat = current[1].properties.as_ref().unwrap();
    assert_eq!(cat.original_size, 200_000);
    assert_eq!(cat.tier, StorageTier::Cool);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_archiving_twice_changes_nothing() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    machine.write("b/c.txt", b"gamma");
    let first = machine.archive().await;
    let writes = machine.store.write_count();

    let second = machine.archive().await;
    assert_eq!(second.status(), RunStatus::Success);
    assert_eq!(second.version, None);
    assert_eq!(second.stats.uploaded, 0);
    assert_eq!(second.stats.deduplicated, 2);
    assert_eq!(second.stats.pointers_written, 0);
    assert_eq!(second.stats.entries_written, 0);
    assert_eq!(machine.store.write_count(), writes);
    assert_eq!(machine.engine.list_versions().await.unwrap(), vec![first.version.unwrap()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fast_hash_trusts_matching_pointers() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    machine.archive().await;

    let mut config = machine.archive_config();
    config.fast_hash = true;
    let report = machine.engine.archive(config).await.unwrap();
    assert_eq!(report.stats.hashed, 0);
    assert_eq!(report.version, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fast_hash_rehashes_changed_or_broken_pointers() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    machine.write("b.txt", b"beta");
    machine.archive().await;

    machine.write("a.txt", b"alpha, longer now");
    machine.write("b.txt.pointer.arca", b"not a pointer");
    let mut config = machine.archive_config();
    config.fast_hash = true;
    let report = machine.engine.archive(config).await.unwrap();
    assert_eq!(report.stats.hashed, 2);
    assert!(report.failures.is_empty());
    assert!(report.version.is_some());
    assert!(machine.read("b.txt.pointer.arca").starts_with(b"{"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_identical_content_is_stored_once() {
    let machine = Machine::new();
    let data = random_bytes(50_000, 2);
    machine.write("one.bin", &data);
    machine.write("copies/two.bin", &data);

    let report = machine.archive().await;
    assert_eq!(report.stats.uploaded, 1);
    assert_eq!(report.stats.chunks_uploaded, 1);
    assert_eq!(machine.store.keys(Folder::Chunks).len(), 1);

    let current = entries(&machine, None).await;
    assert_eq!(current.len(), 2);
    assert_eq!(current[0].entry.hash, current[1].entry.hash);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deleted_files_leave_the_current_view() {
    let machine = Machine::new();
    machine.write("keep.txt", b"keep");
    machine.write("gone/old.txt", b"old");
    let first = machine.archive().await.version.unwrap();

    std::fs::remove_dir_all(machine.path("gone")).unwrap();
    let report = machine.archive().await;
    assert_eq!(report.stats.deleted, 1);
    assert!(report.version.is_some());

    assert_eq!(names(&entries(&machine, None).await), vec!["keep.txt"]);
    assert_eq!(names(&entries(&machine, Some(&first)).await), vec!["gone/old.txt", "keep.txt"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rolling_chunks_deduplicate_within_a_file() {
    let machine = Machine::new();
    let half = random_bytes(5 * 1024 * 1024, 3);
    let mut data = half.clone();
    data.extend_from_slice(&half);
    machine.write("big.bin", &data);

    let mut config = machine.archive_config();
    config.chunking = Chunker::RollingHash(RollingHashParams {
        min_size: 10 * 1024,
        mask_bits: 16,
        max_size: 1024 * 1024,
    });
    let report = machine.engine.archive(config).await.unwrap();
    assert_eq!(report.status(), RunStatus::Success);
    assert!(report.stats.chunks_uploaded > 1);
    assert!(report.stats.bytes_uploaded < 7 * 1024 * 1024, "uploaded {}", report.stats.bytes_uploaded);
    assert_eq!(machine.store.keys(Folder::Chunks).len() as u64, report.stats.chunks_uploaded);

    let target = machine.fresh();
    let restored = target.restore(&[]).await;
    assert_eq!(restored.stats.restored, 1);
    assert_eq!(target.read("big.bin"), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chunked_binary_records_the_tier_of_its_chunks() {
    let machine = Machine::new();
    let data = random_bytes(3 * 1024 * 1024, 14);
    machine.write("big.bin", &data);

    let mut config = machine.archive_config();
    config.tier = StorageTier::Archive;
    config.chunking = Chunker::RollingHash(RollingHashParams {
        min_size: 10 * 1024,
        mask_bits: 16,
        max_size: 1024 * 1024,
    });
    machine.engine.archive(config).await.unwrap();

    let current = entries(&machine, None).await;
    assert_eq!(current[0].properties.as_ref().unwrap().tier, StorageTier::Cold);

    let target = machine.fresh();
    let restored = target.restore(&[]).await;
    assert_eq!(restored.stats.pending, 0);
    assert_eq!(target.read("big.bin"), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_small_objects_never_go_to_the_archive_tier() {
    let machine = Machine::new();
    machine.write("small.bin", random_bytes(1024 * 1024, 4));
    machine.write("large.bin", random_bytes(1024 * 1024 + 1, 5));

    let mut config = machine.archive_config();
    config.tier = StorageTier::Archive;
    machine.engine.archive(config).await.unwrap();

    let current = entries(&machine, None).await;
    let tier = |name: &str| {
        let entry = current.iter().find(|current| current.entry.relative_name == name).unwrap();
        entry.properties.as_ref().unwrap().tier
    };
    assert_eq!(tier("small.bin"), StorageTier::Cold);
    assert_eq!(tier("large.bin"), StorageTier::Archive);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_small_files_are_packed_into_one_container() {
    let machine = Machine::new();
    for i in 0..5 {
        machine.write(&format!("notes/{i}.txt"), format!("note number {i}"));
    }
    let mut config = machine.archive_config();
    config.pack_threshold = Some(64 * 1024);
    let report = machine.engine.archive(config).await.unwrap();
    assert_eq!(report.stats.uploaded, 5);
    assert_eq!(report.stats.chunks_uploaded, 1);
    assert_eq!(machine.store.keys(Folder::Chunks).len(), 1);

    let current = entries(&machine, None).await;
    let parents: Vec<_> = current.iter().map(|c| c.properties.as_ref().unwrap().parent.unwrap()).collect();
    assert!(parents.iter().all(|parent| parent.hash == parents[0].hash));

    let target = machine.fresh();
    let restored = target.restore(&["notes"]).await;
    assert_eq!(restored.stats.restored, 5);
    assert_eq!(target.read("notes/3.txt"), b"note number 3");
    assert!(!target.exists(&format!(".arca-containers-{}", std::process::id())));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_local_keeps_pointers() {
    let machine = Machine::new();
    machine.write("video.mp4", random_bytes(10_000, 6));
    let mut config = machine.archive_config();
    config.remove_local = true;
    let report = machine.engine.archive(config).await.unwrap();
    assert_eq!(report.stats.removed_local, 1);
    assert!(!machine.exists("video.mp4"));
    assert!(machine.exists("video.mp4.pointer.arca"));

    // A pointer on its own is still an archived file.
    let again = machine.archive().await;
    assert_eq!(again.version, None);
    assert_eq!(again.stats.deleted, 0);

    let restored = machine.restore(&["video.mp4"]).await;
    assert_eq!(restored.stats.restored, 1);
    assert_eq!(machine.read("video.mp4"), random_bytes(10_000, 6));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pointer_to_unknown_content_fails_alone() {
    let machine = Machine::new();
    machine.write("real.txt", b"real");
    machine.write(
        "ghost.txt.pointer.arca",
        format!(r#"{{"hash":"{}","size":1,"created":0,"modified":0}}"#, "ab".repeat(32)),
    );
    let report = machine.archive().await;
    assert_eq!(report.status(), RunStatus::PartialFailure);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, "ghost.txt");
    assert_eq!(names(&entries(&machine, None).await), vec!["real.txt"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_passphrase_aborts_before_writing() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    machine.archive().await;
    let writes = machine.store.write_count();

    let intruder = Machine::on(machine.store.clone(), "not the passphrase");
    intruder.write("b.txt", b"beta");
    let err = intruder.engine.archive(intruder.archive_config()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::WrongPassphrase));
    assert_eq!(machine.store.write_count(), writes);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_passphrase_with_warm_cache_aborts() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    let first = machine.archive().await.version.unwrap();
    let writes = machine.store.write_count();

    let handle: arca_storage::BlobHandle = machine.store.clone();
    let intruder = Engine::new(handle, arca_crypto::Passphrase::new("not the passphrase"), machine.cache.path());
    let err = intruder.archive(machine.archive_config()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::WrongPassphrase));
    assert_eq!(machine.store.write_count(), writes);
    assert_eq!(machine.engine.list_versions().await.unwrap(), vec![first]);

    let restored = machine.fresh().restore(&[]).await;
    assert_eq!(restored.stats.restored, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_store_aborts() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    machine.store.set_unreachable(true);
    let err = machine.engine.archive(machine.archive_config()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Unreachable));
    assert_eq!(machine.store.write_count(), 0);
    assert!(!machine.exists("a.txt.pointer.arca"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_run_uploads_no_version() {
    let machine = Machine::new();
    machine.write("a.txt", b"alpha");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let handle: arca_storage::BlobHandle = machine.store.clone();
    let engine = Engine::new(handle, arca_crypto::Passphrase::new(PASSPHRASE), machine.cache.path())
        .with_cancellation(cancel);

    let err = engine.archive(machine.archive_config()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Cancelled));
    assert!(machine.store.keys(Folder::States).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_query_entries_by_prefix() {
    let machine = Machine::new();
    machine.write("photos/a.jpg", b"a");
    machine.write("photos-old/b.jpg", b"b");
    machine.archive().await;

    let photos: Vec<CurrentEntry> = machine.engine.query_entries(Some("photos/"), None).try_collect().await.unwrap();
    assert_eq!(names(&photos), vec!["photos/a.jpg"]);

    let err = machine
        .engine
        .query_entries(None, Some("1970-01-01T00-00-00"))
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    assert!(matches!(&*err, ErrorKind::VersionNotFound(_)));
}
