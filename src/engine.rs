// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage engine: the five operations the HTTP layer is built on.
//!
//! Every operation starts with a sweep of expired entries, then works
//! against the persisted index. Nothing is cached between calls, so any
//! number of engines (threads or processes) can share one set of folders.

use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::StorageConfig;
use crate::error::{Result, StashError};
use crate::storage::blob::{BlobStore, Commit};
use crate::storage::entry::{infer_content_type, sanitize_name, Entry, MetadataIndex};
use crate::storage::id::{is_valid_id, IdGenerator, RandomIdGenerator, MAX_ID_ATTEMPTS};
use crate::storage::metadata::{FileMetadataStore, MetadataStore};
use crate::storage::sweeper::{HousekeepingReport, Sweeper};

/// Attempts per store operation before a `StoreUnavailable` is surfaced.
const STORE_ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Optional narrowing of [`StorageEngine::list`].
#[derive(Debug, Default, Clone)]
pub struct ListFilter {
    /// Keep entries whose content type starts with this, e.g. `image/`.
    pub content_type_prefix: Option<String>,
    /// Keep at most this many, oldest first.
    pub limit: Option<usize>,
}

impl ListFilter {
    fn matches(&self, entry: &Entry) -> bool {
        self.content_type_prefix
            .as_deref()
            .map_or(true, |p| entry.content_type.starts_with(p))
    }
}

/// Top-level façade over metadata, blobs and the sweeper.
pub struct StorageEngine<M: MetadataStore = FileMetadataStore> {
    config: StorageConfig,
    store: M,
    blobs: BlobStore,
    ids: Box<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    /// Time of the last housekeeping pass in this process.
    last_housekeeping: AtomicI64,
}

impl StorageEngine<FileMetadataStore> {
    /// Engine over the configured folders with the JSON index, random ids
    /// and the wall clock.
    pub fn open(config: StorageConfig) -> Result<Self> {
        let store = FileMetadataStore::new(config.file_list.clone());
        Self::with_parts(config, store, Box::new(RandomIdGenerator), Arc::new(SystemClock))
    }
}

impl<M: MetadataStore> StorageEngine<M> {
    pub fn with_parts(
        config: StorageConfig,
        store: M,
        ids: Box<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let blobs = BlobStore::new(config.upload_folder.clone(), config.tmp_folder.clone());
        blobs.ensure_dirs()?;
        Ok(Self {
            config,
            store,
            blobs,
            ids,
            clock,
            last_housekeeping: AtomicI64::new(0),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn store(&self) -> &M {
        &self.store
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    // ───────────────────────────── operations ────────────────────────────────

    /// Stream `reader` into a new entry.
    ///
    /// The blob is committed before the index entry is inserted, so a
    /// failure in between leaves at worst an orphan blob, never an entry
    /// without content.
    pub fn upload<R: Read>(
        &self,
        name: &str,
        content_type: Option<&str>,
        reader: R,
    ) -> Result<Entry> {
        self.prelude()?;
        let original_name = sanitize_name(name);
        let content_type = infer_content_type(&original_name, content_type);

        let mut staged = self.blobs.stage(reader)?;
        let size_bytes = staged.size();
        let sha256 = staged.sha256().to_string();

        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = self.ids.generate();
            if !is_valid_id(&id) {
                warn!(id, attempt, "Generator produced an unusable id");
                continue;
            }
            if self.read_index()?.contains(&id) {
                debug!(id, attempt, "Id already indexed, regenerating");
                continue;
            }

            match self.blobs.commit(staged, &id)? {
                Commit::Occupied(back) => {
                    debug!(id, attempt, "Blob already present, regenerating");
                    staged = back;
                }
                Commit::Done(committed) => {
                    let entry = Entry {
                        id,
                        original_name: original_name.clone(),
                        size_bytes: committed,
                        uploaded_at: self.clock.now(),
                        expire_seconds: self.config.expire_secs,
                        content_type: content_type.clone(),
                        sha256: sha256.clone(),
                    };

                    match self.insert(&entry) {
                        Ok(true) => {
                            info!(
                                id = entry.id,
                                name = entry.original_name,
                                bytes = entry.size_bytes,
                                content_type = entry.content_type,
                                "File uploaded"
                            );
                            return Ok(entry);
                        }
                        Ok(false) => {
                            debug!(id = entry.id, attempt, "Id indexed concurrently, regenerating");
                            staged = self.blobs.reclaim(&entry.id, size_bytes, &sha256)?;
                        }
                        Err(e) => {
                            if let Err(rm) = self.blobs.remove(&entry.id) {
                                warn!(id = entry.id, error = %rm, "Uncommitted blob left as orphan");
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }

        Err(StashError::ResourceExhausted { attempts: MAX_ID_ATTEMPTS })
    }

    /// Entry plus an open handle on its content.
    pub fn fetch(&self, id: &str) -> Result<(Entry, File)> {
        let now = self.prelude()?;
        let entry = self.lookup(id, now)?;
        match self.blobs.open(id) {
            Ok(file) => Ok((entry, file)),
            Err(e) if e.is_not_found() => {
                warn!(id, "Index entry without blob");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Metadata only.
    pub fn inspect(&self, id: &str) -> Result<Entry> {
        let now = self.prelude()?;
        self.lookup(id, now)
    }

    /// Remove the entry and its blob. A missing id is `NotFound`.
    pub fn delete(&self, id: &str) -> Result<Entry> {
        self.prelude()?;
        if !is_valid_id(id) {
            return Err(StashError::NotFound { id: id.to_string() });
        }

        let removed = self.with_retry("delete", || {
            self.store.mutate(|index| {
                index
                    .remove(id)
                    .ok_or_else(|| StashError::NotFound { id: id.to_string() })
            })
        })?;

        if let Err(e) = self.blobs.remove(id) {
            warn!(id, error = %e, "Deleted entry's blob left as orphan");
        }
        info!(id, name = removed.original_name, "File deleted");
        Ok(removed)
    }

    /// Live entries in upload order.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Entry>> {
        let now = self.prelude()?;
        let index = self.read_index()?;
        let live = index
            .iter()
            .filter(|e| !e.is_expired(now) && filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(live)
    }

    // ───────────────────────────── sweeping ──────────────────────────────────

    /// Drop expired entries now. Returns the ids removed.
    pub fn sweep(&self) -> Result<Vec<String>> {
        self.sweep_at(self.clock.now())
    }

    /// Force a housekeeping pass regardless of the interval.
    pub fn housekeep(&self) -> Result<HousekeepingReport> {
        let now = self.clock.now();
        self.last_housekeeping.store(now, Ordering::SeqCst);
        self.sweeper().housekeep(
            now,
            self.config.staging_max_age_secs,
            self.config.orphan_grace_secs,
        )
    }

    fn sweep_at(&self, now: i64) -> Result<Vec<String>> {
        self.with_retry("sweep", || self.sweeper().run(now))
    }

    /// Sweep, plus housekeeping when it is due. Returns the time used.
    fn prelude(&self) -> Result<i64> {
        let now = self.clock.now();
        self.sweep_at(now)?;

        let last = self.last_housekeeping.load(Ordering::SeqCst);
        let due = now.saturating_sub(last) >= self.config.housekeeping_interval_secs as i64;
        if due
            && self
                .last_housekeeping
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let report = self.sweeper().housekeep(
                now,
                self.config.staging_max_age_secs,
                self.config.orphan_grace_secs,
            );
            if let Err(e) = report {
                warn!(error = %e, "Housekeeping failed");
            }
        }
        Ok(now)
    }

    fn sweeper(&self) -> Sweeper<'_, M> {
        Sweeper::new(&self.store, &self.blobs)
    }

    // ───────────────────────────── helpers ───────────────────────────────────

    fn lookup(&self, id: &str, now: i64) -> Result<Entry> {
        if !is_valid_id(id) {
            return Err(StashError::NotFound { id: id.to_string() });
        }
        let index = self.read_index()?;
        let entry = index
            .get(id)
            .cloned()
            .ok_or_else(|| StashError::NotFound { id: id.to_string() })?;
        if entry.is_expired(now) {
            return Err(StashError::Expired { id: id.to_string() });
        }
        Ok(entry)
    }

    fn read_index(&self) -> Result<MetadataIndex> {
        self.with_retry("read", || self.store.read())
    }

    fn insert(&self, entry: &Entry) -> Result<bool> {
        self.with_retry("insert", || self.store.mutate(|index| Ok(index.insert(entry.clone()))))
    }

    fn with_retry<T, F>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match f() {
                Err(e) if e.is_retryable() && attempt < STORE_ATTEMPTS => {
                    warn!(op, attempt, error = %e, "Transient store failure, retrying");
                    std::thread::sleep(RETRY_BACKOFF * attempt as u32);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
