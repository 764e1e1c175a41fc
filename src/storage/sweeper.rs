//! Expiration sweeping — lazy, run at the top of each request.
//!
//! Index first, blobs second: a crash in between leaves an orphan blob
//! (picked up later by [`Sweeper::housekeep`]) instead of an index entry
//! pointing at nothing.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::blob::BlobStore;
use crate::storage::entry::{Entry, MetadataIndex};
use crate::storage::metadata::MetadataStore;

/// Split `index` into the live index and the expired entries as of `now`.
pub fn sweep(index: MetadataIndex, now: i64) -> (MetadataIndex, Vec<Entry>) {
    index.partition(|e| !e.is_expired(now))
}

/// What a housekeeping pass cleaned up.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub staging_removed: usize,
    pub orphans_removed: Vec<String>,
}

pub struct Sweeper<'a, M: MetadataStore> {
    store: &'a M,
    blobs: &'a BlobStore,
}

impl<'a, M: MetadataStore> Sweeper<'a, M> {
    pub fn new(store: &'a M, blobs: &'a BlobStore) -> Self {
        Self { store, blobs }
    }

    /// Drop expired entries from the index, then delete their blobs.
    /// Returns the ids removed.
    pub fn run(&self, now: i64) -> Result<Vec<String>> {
        let expired = self.store.mutate(|index| {
            let (live, expired) = sweep(std::mem::take(index), now);
            *index = live;
            Ok(expired)
        })?;

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = expired.into_iter().map(|e| e.id).collect();
        for id in &ids {
            if let Err(e) = self.blobs.remove(id) {
                warn!(id, error = %e, "Expired blob not removed, left as orphan");
            }
        }
        info!(count = ids.len(), "Swept expired entries");
        Ok(ids)
    }

    /// Reclaim abandoned staging files and blobs with no index entry.
    ///
    /// Only files older than their grace period are touched, so uploads
    /// still in flight are left alone.
    pub fn housekeep(
        &self,
        now: i64,
        staging_max_age_secs: u64,
        orphan_grace_secs: u64,
    ) -> Result<HousekeepingReport> {
        let staging_removed = self
            .blobs
            .purge_staging(now.saturating_sub(staging_max_age_secs as i64))?;

        let index = self.store.read()?;
        let orphan_cutoff = now.saturating_sub(orphan_grace_secs as i64);
        let mut orphans_removed = Vec::new();
        for (id, modified) in self.blobs.stored_blobs()? {
            if index.contains(&id) || modified >= orphan_cutoff {
                continue;
            }
            match self.blobs.remove(&id) {
                Ok(()) => {
                    warn!(id, "Removed orphan blob with no index entry");
                    orphans_removed.push(id);
                }
                Err(e) => warn!(id, error = %e, "Failed to remove orphan blob"),
            }
        }

        debug!(
            staging_removed,
            orphans = orphans_removed.len(),
            "Housekeeping done"
        );
        Ok(HousekeepingReport { staging_removed, orphans_removed })
    }
}
