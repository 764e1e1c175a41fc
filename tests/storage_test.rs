//! Storage integration tests: metadata index + blob store + sweeper.
//!
//! Run with: `cargo test`

use std::io::{self, Read};

use tempfile::TempDir;

use stash::error::StashError;
use stash::storage::blob::{BlobStore, Commit};
use stash::storage::entry::{Entry, MetadataIndex};
use stash::storage::id::{is_valid_id, IdGenerator, RandomIdGenerator, ID_LEN};
use stash::storage::metadata::{FileMetadataStore, MemoryMetadataStore, MetadataStore};
use stash::storage::sweeper::{sweep, Sweeper};

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn entry(id: &str, uploaded_at: i64, expire: u64) -> Entry {
    Entry {
        id: id.into(),
        original_name: format!("{id}.txt"),
        size_bytes: 3,
        uploaded_at,
        expire_seconds: expire,
        content_type: "text/plain".into(),
        sha256: String::new(),
    }
}

fn blob_store(dir: &TempDir) -> BlobStore {
    let blobs = BlobStore::new(dir.path().join("files"), dir.path().join("tmp"));
    blobs.ensure_dirs().expect("dirs");
    blobs
}

fn staging_files(blobs: &BlobStore) -> usize {
    std::fs::read_dir(blobs.staging_dir()).expect("read staging").count()
}

/// Yields some bytes, then fails like a dropped connection.
struct BrokenReader {
    sent: bool,
}

impl Read for BrokenReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.sent {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        }
        self.sent = true;
        buf[..4].copy_from_slice(b"part");
        Ok(4)
    }
}

// ─────────────────────────────── identifiers ─────────────────────────────────

#[test]
fn test_random_ids_are_url_safe_and_distinct() {
    let gen = RandomIdGenerator;
    let ids: std::collections::HashSet<String> = (0..1000).map(|_| gen.generate()).collect();
    assert_eq!(ids.len(), 1000);
    for id in &ids {
        assert_eq!(id.len(), ID_LEN);
        assert!(is_valid_id(id), "unexpected id {id}");
    }
}

#[test]
fn test_id_validation_rejects_path_tricks() {
    assert!(!is_valid_id(""));
    assert!(!is_valid_id("../etc"));
    assert!(!is_valid_id("a/b"));
    assert!(!is_valid_id("ls.json"));
    assert!(is_valid_id("Ab3xY9q0"));
}

// ─────────────────────────────── metadata store ──────────────────────────────

#[test]
fn test_missing_index_reads_empty() {
    let dir = tmp_dir();
    let store = FileMetadataStore::new(dir.path().join("index.json"));
    assert!(store.read().expect("read").is_empty());
}

#[test]
fn test_mutate_persists_in_insertion_order() {
    let dir = tmp_dir();
    let path = dir.path().join("index.json");
    let store = FileMetadataStore::new(&path);

    for id in ["zzz", "aaa", "mmm"] {
        store
            .mutate(|index| Ok(index.insert(entry(id, 0, 10))))
            .expect("mutate");
    }

    let reopened = FileMetadataStore::new(&path);
    let ids: Vec<String> = reopened
        .read()
        .expect("read")
        .iter()
        .map(|e| e.id.clone())
        .collect();
    assert_eq!(ids, ["zzz", "aaa", "mmm"]);
}

#[test]
fn test_failed_closure_leaves_index_untouched() {
    let dir = tmp_dir();
    let path = dir.path().join("index.json");
    let store = FileMetadataStore::new(&path);
    store.mutate(|index| Ok(index.insert(entry("keep", 0, 10)))).expect("seed");
    let before = std::fs::read(&path).expect("read file");

    let err = store
        .mutate(|index| {
            index.remove("keep");
            Err::<(), _>(StashError::NotFound { id: "other".into() })
        })
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(std::fs::read(&path).expect("read file"), before);
}

#[test]
fn test_corrupt_index_is_reported_not_truncated() {
    let dir = tmp_dir();
    let path = dir.path().join("index.json");
    std::fs::write(&path, b"{ this is not json").expect("write");
    let store = FileMetadataStore::new(&path);

    assert!(matches!(store.read(), Err(StashError::IndexCorrupt(_))));
    let err = store
        .mutate(|index| Ok(index.insert(entry("new", 0, 10))))
        .unwrap_err();
    assert!(matches!(err, StashError::IndexCorrupt(_)));

    // The broken document is still there for an operator to inspect.
    assert_eq!(std::fs::read(&path).expect("read"), b"{ this is not json");
}

#[test]
fn test_duplicate_ids_on_disk_are_corrupt() {
    let dir = tmp_dir();
    let path = dir.path().join("index.json");
    let doc = serde_json::json!({
        "entries": [entry("dup", 0, 1), entry("dup", 1, 1)]
    });
    std::fs::write(&path, doc.to_string()).expect("write");
    let store = FileMetadataStore::new(&path);
    assert!(matches!(store.read(), Err(StashError::IndexCorrupt(_))));
}

#[test]
fn test_concurrent_mutations_lose_no_updates() {
    let dir = tmp_dir();
    let path = dir.path().join("index.json");
    const N: usize = 32;

    std::thread::scope(|s| {
        for i in 0..N {
            let path = path.clone();
            s.spawn(move || {
                // One store per thread, like separate worker processes.
                let store = FileMetadataStore::new(path);
                store
                    .mutate(|index| Ok(index.insert(entry(&format!("id{i}"), 0, 10))))
                    .expect("mutate");
            });
        }
    });

    let index = FileMetadataStore::new(&path).read().expect("read");
    assert_eq!(index.len(), N);
}

#[test]
fn test_memory_store_simulated_failure_discards_change() {
    let store = MemoryMetadataStore::new();
    store.fail_next_writes(1);
    let err = store
        .mutate(|index| Ok(index.insert(entry("a", 0, 1))))
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(store.read().expect("read").is_empty());

    store.mutate(|index| Ok(index.insert(entry("a", 0, 1)))).expect("second try");
    assert_eq!(store.read().expect("read").len(), 1);
}

// ─────────────────────────────── blob store ──────────────────────────────────

#[test]
fn test_stage_commit_open_roundtrip() {
    let dir = tmp_dir();
    let blobs = blob_store(&dir);
    let data = vec![0xABu8; 200_000];

    let staged = blobs.stage(data.as_slice()).expect("stage");
    assert_eq!(staged.size(), data.len() as u64);
    assert!(!blobs.exists("abc123"));

    match blobs.commit(staged, "abc123").expect("commit") {
        Commit::Done(size) => assert_eq!(size, data.len() as u64),
        Commit::Occupied(_) => panic!("fresh id reported occupied"),
    }

    let mut read_back = Vec::new();
    blobs.open("abc123").expect("open").read_to_end(&mut read_back).expect("read");
    assert_eq!(read_back, data);
    assert_eq!(staging_files(&blobs), 0);
}

#[test]
fn test_stage_computes_sha256() {
    let dir = tmp_dir();
    let blobs = blob_store(&dir);
    let staged = blobs.stage(&b"abc"[..]).expect("stage");
    assert_eq!(
        staged.sha256(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn test_commit_never_clobbers() {
    let dir = tmp_dir();
    let blobs = blob_store(&dir);

    let first = blobs.stage(&b"first"[..]).expect("stage");
    assert!(matches!(blobs.commit(first, "same").expect("commit"), Commit::Done(5)));

    let second = blobs.stage(&b"second"[..]).expect("stage");
    let back = match blobs.commit(second, "same").expect("commit") {
        Commit::Occupied(back) => back,
        Commit::Done(_) => panic!("existing blob was overwritten"),
    };
    assert_eq!(back.size(), 6);
    assert!(back.path().exists());

    let mut content = String::new();
    blobs.open("same").expect("open").read_to_string(&mut content).expect("read");
    assert_eq!(content, "first");

    drop(back);
    assert_eq!(staging_files(&blobs), 0);
}

#[test]
fn test_aborted_stream_leaves_nothing_behind() {
    let dir = tmp_dir();
    let blobs = blob_store(&dir);
    let err = blobs.stage(BrokenReader { sent: false }).unwrap_err();
    assert!(matches!(err, StashError::InvalidUpload(_)));
    assert_eq!(staging_files(&blobs), 0);
}

#[test]
fn test_uncommitted_stage_is_removed_on_drop() {
    let dir = tmp_dir();
    let blobs = blob_store(&dir);
    let staged = blobs.stage(&b"never committed"[..]).expect("stage");
    assert_eq!(staging_files(&blobs), 1);
    drop(staged);
    assert_eq!(staging_files(&blobs), 0);
}

#[test]
fn test_reclaim_moves_blob_back_to_staging() {
    let dir = tmp_dir();
    let blobs = blob_store(&dir);
    let staged = blobs.stage(&b"xyz"[..]).expect("stage");
    let sha = staged.sha256().to_string();
    blobs.commit(staged, "taken").expect("commit");

    let back = blobs.reclaim("taken", 3, &sha).expect("reclaim");
    assert!(!blobs.exists("taken"));
    assert!(matches!(blobs.commit(back, "other").expect("commit"), Commit::Done(3)));
    assert!(blobs.exists("other"));
}

#[test]
fn test_remove_is_idempotent_and_open_missing_is_not_found() {
    let dir = tmp_dir();
    let blobs = blob_store(&dir);
    blobs.remove("ghost").expect("first remove");
    blobs.remove("ghost").expect("second remove");
    assert!(blobs.open("ghost").unwrap_err().is_not_found());
    assert!(blobs.open("../../etc/passwd").unwrap_err().is_not_found());
}

#[test]
fn test_purge_staging_respects_cutoff() {
    let dir = tmp_dir();
    let blobs = blob_store(&dir);
    let staged = blobs.stage(&b"in flight"[..]).expect("stage");
    // Simulate a crash: keep the file but forget the handle.
    let leaked = staged.path().to_path_buf();
    std::mem::forget(staged);

    let now = chrono::Utc::now().timestamp();
    assert_eq!(blobs.purge_staging(now - 3600).expect("purge"), 0);
    assert!(leaked.exists());
    assert_eq!(blobs.purge_staging(now + 10).expect("purge"), 1);
    assert!(!leaked.exists());
}

// ─────────────────────────────── sweeper ─────────────────────────────────────

#[test]
fn test_pure_sweep_partitions_by_expiry() {
    let index = MetadataIndex::from_entries(vec![
        entry("old", 0, 10),
        entry("edge", 90, 10),
        entry("new", 95, 10),
    ])
    .expect("index");

    let (live, expired) = sweep(index, 100);
    let live_ids: Vec<&str> = live.iter().map(|e| e.id.as_str()).collect();
    let expired_ids: Vec<&str> = expired.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(live_ids, ["edge", "new"]);
    assert_eq!(expired_ids, ["old"]);
}

#[test]
fn test_sweeper_removes_index_entries_then_blobs() {
    let dir = tmp_dir();
    let blobs = blob_store(&dir);
    let store = FileMetadataStore::new(dir.path().join("index.json"));

    for (id, at) in [("gone", 0), ("stays", 1_000)] {
        let staged = blobs.stage(&b"abc"[..]).expect("stage");
        blobs.commit(staged, id).expect("commit");
        store.mutate(|index| Ok(index.insert(entry(id, at, 100)))).expect("insert");
    }

    let removed = Sweeper::new(&store, &blobs).run(1_050).expect("sweep");
    assert_eq!(removed, ["gone"]);
    assert!(!blobs.exists("gone"));
    assert!(blobs.exists("stays"));

    let index = store.read().expect("read");
    assert!(!index.contains("gone"));
    assert!(index.contains("stays"));

    // Nothing left to do.
    assert!(Sweeper::new(&store, &blobs).run(1_050).expect("sweep").is_empty());
}

#[test]
fn test_housekeeping_reclaims_orphans_after_grace() {
    let dir = tmp_dir();
    let blobs = blob_store(&dir);
    let store = FileMetadataStore::new(dir.path().join("index.json"));

    let staged = blobs.stage(&b"orphan"[..]).expect("stage");
    blobs.commit(staged, "orphan").expect("commit");
    let staged = blobs.stage(&b"indexed"[..]).expect("stage");
    blobs.commit(staged, "indexed").expect("commit");
    store
        .mutate(|index| Ok(index.insert(entry("indexed", 0, u64::MAX / 4))))
        .expect("insert");

    let now = chrono::Utc::now().timestamp();
    let sweeper = Sweeper::new(&store, &blobs);

    // Within the grace period the orphan could still be an upload in flight.
    let report = sweeper.housekeep(now, 3600, 600).expect("housekeep");
    assert!(report.orphans_removed.is_empty());
    assert!(blobs.exists("orphan"));

    let report = sweeper.housekeep(now + 601, 3600, 600).expect("housekeep");
    assert_eq!(report.orphans_removed, ["orphan"]);
    assert!(!blobs.exists("orphan"));
    assert!(blobs.exists("indexed"));
}
