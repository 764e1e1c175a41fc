//! Blob store — uploaded content, one file per identifier.
//!
//! ```text
//! TMP_FOLDER/.stage-XXXXXX   ← stage(): streamed, hashed, fsynced
//!        │
//!        │  rename (no-clobber, same filesystem)
//!        ▼
//! UPLOAD_FOLDER/<id>         ← commit(): appears complete or not at all
//! ```
//!
//! A staged file is a [`TempPath`]: dropping a [`StagedBlob`] that never
//! reached `commit` deletes it, so aborted uploads clean up after themselves.
//! Files left behind by a crash are removed by [`BlobStore::purge_staging`].

use std::fs::{File, Metadata};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tracing::{debug, warn};

use crate::error::{Result, StashError};
use crate::storage::id::is_valid_id;

const STAGE_PREFIX: &str = ".stage-";
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Content written to the staging area but not yet visible.
#[derive(Debug)]
pub struct StagedBlob {
    path: TempPath,
    size: u64,
    sha256: String,
}

impl StagedBlob {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Outcome of [`BlobStore::commit`].
#[derive(Debug)]
pub enum Commit {
    /// Blob is live under the requested id; carries its size.
    Done(u64),
    /// A blob already exists under that id. The staged file is handed back
    /// untouched so the caller can retry with another id.
    Occupied(StagedBlob),
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    upload_dir: PathBuf,
    staging_dir: PathBuf,
}

impl BlobStore {
    pub fn new(upload_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self { upload_dir: upload_dir.into(), staging_dir: staging_dir.into() }
    }

    /// Create both directories if needed.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.upload_dir, &self.staging_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| StashError::blob_io(format!("create {}", dir.display()), e))?;
        }
        Ok(())
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.upload_dir.join(id)
    }

    /// Stream `reader` into a new staging file. Memory use is one copy
    /// buffer regardless of upload size.
    ///
    /// A read error (client went away) fails with `InvalidUpload`; a write
    /// error fails with `BlobIo`. Either way the partial file is removed.
    pub fn stage<R: Read>(&self, mut reader: R) -> Result<StagedBlob> {
        let mut tmp = tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .tempfile_in(&self.staging_dir)
            .map_err(|e| StashError::blob_io("create staging file", e))?;

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(StashError::InvalidUpload(format!("upload stream aborted: {e}")))
                }
            };
            tmp.write_all(&buf[..n])
                .map_err(|e| StashError::blob_io("write staging file", e))?;
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        tmp.as_file()
            .sync_all()
            .map_err(|e| StashError::blob_io("sync staging file", e))?;

        let staged = StagedBlob {
            path: tmp.into_temp_path(),
            size,
            sha256: hex::encode(hasher.finalize()),
        };
        debug!(path = ?staged.path(), bytes = size, "Upload staged");
        Ok(staged)
    }

    /// Atomically move a staged blob to its final name. Never replaces an
    /// existing blob.
    pub fn commit(&self, staged: StagedBlob, id: &str) -> Result<Commit> {
        if !is_valid_id(id) {
            return Err(StashError::InvalidUpload(format!("invalid id '{id}'")));
        }

        let on_disk = std::fs::metadata(&staged.path)
            .map_err(|e| StashError::blob_io("stat staging file", e))?
            .len();
        if on_disk != staged.size {
            return Err(StashError::InvalidUpload(format!(
                "staged size mismatch: streamed {} bytes, {} on disk",
                staged.size, on_disk
            )));
        }

        let StagedBlob { path, size, sha256 } = staged;
        let dest = self.blob_path(id);
        match path.persist_noclobber(&dest) {
            Ok(()) => Ok(Commit::Done(size)),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                Ok(Commit::Occupied(StagedBlob { path: e.path, size, sha256 }))
            }
            Err(e) => Err(StashError::blob_io(format!("commit blob {id}"), e.error)),
        }
    }

    /// Undo a commit: move the blob for `id` back into staging.
    pub fn reclaim(&self, id: &str, size: u64, sha256: &str) -> Result<StagedBlob> {
        let path = tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .tempfile_in(&self.staging_dir)
            .map_err(|e| StashError::blob_io("create staging file", e))?
            .into_temp_path();
        std::fs::rename(self.blob_path(id), &path)
            .map_err(|e| StashError::blob_io(format!("reclaim blob {id}"), e))?;
        Ok(StagedBlob { path, size, sha256: sha256.to_string() })
    }

    pub fn open(&self, id: &str) -> Result<File> {
        if !is_valid_id(id) {
            return Err(StashError::NotFound { id: id.to_string() });
        }
        File::open(self.blob_path(id)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StashError::NotFound { id: id.to_string() },
            _ => StashError::blob_io(format!("open blob {id}"), e),
        })
    }

    pub fn exists(&self, id: &str) -> bool {
        is_valid_id(id) && self.blob_path(id).is_file()
    }

    /// Idempotent: a missing blob is not an error.
    pub fn remove(&self, id: &str) -> Result<()> {
        if !is_valid_id(id) {
            return Ok(());
        }
        match std::fs::remove_file(self.blob_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StashError::blob_io(format!("remove blob {id}"), e)),
        }
    }

    /// Every blob id on disk with its modification time (epoch seconds).
    pub fn stored_blobs(&self) -> Result<Vec<(String, i64)>> {
        let mut out = Vec::new();
        for (name, meta) in list_files(&self.upload_dir)? {
            if is_valid_id(&name) {
                out.push((name, modified_secs(&meta)));
            }
        }
        Ok(out)
    }

    /// Remove staging files last touched before `cutoff`. Returns how many
    /// were deleted.
    pub fn purge_staging(&self, cutoff: i64) -> Result<usize> {
        let mut removed = 0;
        for (name, meta) in list_files(&self.staging_dir)? {
            if !name.starts_with(STAGE_PREFIX) || modified_secs(&meta) >= cutoff {
                continue;
            }
            let path = self.staging_dir.join(&name);
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove stale staging file"),
            }
        }
        Ok(removed)
    }
}

fn list_files(dir: &Path) -> Result<Vec<(String, Metadata)>> {
    let rd = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StashError::blob_io(format!("list {}", dir.display()), e)),
    };

    let mut out = Vec::new();
    for item in rd {
        let item = item.map_err(|e| StashError::blob_io(format!("list {}", dir.display()), e))?;
        let Ok(meta) = item.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        if let Some(name) = item.file_name().to_str() {
            out.push((name.to_string(), meta));
        }
    }
    Ok(out)
}

fn modified_secs(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64)
}
