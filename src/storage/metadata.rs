// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Metadata store: the single source of truth for live entries.
//!
//! The file-backed store keeps the whole [`MetadataIndex`] in one JSON
//! document. Every write goes through [`MetadataStore::mutate`]:
//!
//! ```text
//!   flock(<index>.lock)            exclusive, blocks other writers
//!     read  <index>                missing → empty, unparseable → IndexCorrupt
//!     apply closure
//!     write <dir>/.tmpXXXX         same directory as the index
//!     fsync + rename → <index>     atomic replace
//!   unlock
//! ```
//!
//! Readers never take the lock. Because the document is only ever replaced
//! by rename, a reader sees either the old or the new version; a parse
//! failure is retried once before being reported as corruption.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fs2::FileExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Result, StashError};
use crate::storage::entry::{Entry, MetadataIndex};

const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Durable, concurrency-safe access to the metadata index.
pub trait MetadataStore: Send + Sync {
    /// Current persisted index.
    fn read(&self) -> Result<MetadataIndex>;

    /// Exclusive read-modify-write. If `f` returns an error nothing is
    /// written and the error is passed through.
    fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut MetadataIndex) -> Result<T>;
}

#[derive(Deserialize)]
struct IndexDocument {
    #[serde(default)]
    entries: Vec<Entry>,
}

fn parse_index(bytes: &[u8]) -> Result<MetadataIndex> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(MetadataIndex::new());
    }
    let doc: IndexDocument = serde_json::from_slice(bytes)
        .map_err(|e| StashError::IndexCorrupt(e.to_string()))?;
    MetadataIndex::from_entries(doc.entries)
}

// ─────────────────────────────── file-backed ─────────────────────────────────

/// JSON document on disk guarded by an advisory lock file.
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self { path, lock_path: PathBuf::from(lock_name) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    /// Blocks until the exclusive lock is held. Released when the returned
    /// file is dropped.
    fn lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| {
                StashError::StoreUnavailable(format!(
                    "open lock {}: {e}",
                    self.lock_path.display()
                ))
            })?;
        file.lock_exclusive().map_err(|e| {
            StashError::StoreUnavailable(format!("lock {}: {e}", self.lock_path.display()))
        })?;
        Ok(file)
    }

    fn load(&self) -> Result<MetadataIndex> {
        match std::fs::read(&self.path) {
            Ok(bytes) => parse_index(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(MetadataIndex::new()),
            Err(e) => Err(StashError::StoreUnavailable(format!(
                "read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn persist(&self, index: &MetadataIndex) -> Result<()> {
        let unavailable =
            |what: &str, e: &dyn std::fmt::Display| StashError::StoreUnavailable(format!("{what}: {e}"));

        let tmp = NamedTempFile::new_in(self.dir())
            .map_err(|e| unavailable("create temp index", &e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, index)
                .map_err(|e| unavailable("encode index", &e))?;
            writer.flush().map_err(|e| unavailable("write temp index", &e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| unavailable("sync temp index", &e))?;
        tmp.persist(&self.path)
            .map_err(|e| unavailable("rename temp index", &e.error))?;
        Ok(())
    }
}

impl MetadataStore for FileMetadataStore {
    fn read(&self) -> Result<MetadataIndex> {
        match self.load() {
            Err(StashError::IndexCorrupt(reason)) => {
                debug!(path = ?self.path, reason, "Index parse failed, retrying once");
                std::thread::sleep(READ_RETRY_DELAY);
                self.load()
            }
            other => other,
        }
    }

    fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut MetadataIndex) -> Result<T>,
    {
        let _lock = self.lock()?;
        let mut index = self.load()?;
        let before = index.clone();
        let out = f(&mut index)?;
        if index != before {
            self.persist(&index)?;
            debug!(path = ?self.path, entries = index.len(), "Index written");
        }
        Ok(out)
    }
}

// ─────────────────────────────── in-memory ───────────────────────────────────

/// In-process double with the same transactional contract. Can be told to
/// fail upcoming writes to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    index: Mutex<MetadataIndex>,
    failing_writes: AtomicUsize,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(index: MetadataIndex) -> Self {
        Self { index: Mutex::new(index), failing_writes: AtomicUsize::new(0) }
    }

    /// The next `n` mutations fail with `StoreUnavailable`.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn read(&self) -> Result<MetadataIndex> {
        Ok(self.index.lock().clone())
    }

    fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut MetadataIndex) -> Result<T>,
    {
        let mut guard = self.index.lock();
        let mut working = guard.clone();
        let out = f(&mut working)?;
        if working != *guard {
            let failed = self
                .failing_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                warn!("Simulated index write failure");
                return Err(StashError::StoreUnavailable("simulated write failure".into()));
            }
            *guard = working;
        }
        Ok(out)
    }
}
