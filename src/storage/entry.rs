// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Entry records and the metadata index document that holds them.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StashError};

const FALLBACK_NAME: &str = "upload";
const MAX_NAME_BYTES: usize = 255;
pub const OCTET_STREAM: &str = "application/octet-stream";

/// One stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub original_name: String,
    pub size_bytes: u64,
    /// Seconds since the epoch at which the blob was committed.
    pub uploaded_at: i64,
    /// TTL frozen at upload time.
    pub expire_seconds: u64,
    pub content_type: String,
    /// Hex SHA-256 of the content.
    pub sha256: String,
}

impl Entry {
    /// Expired iff `now - uploaded_at > expire_seconds`.
    pub fn is_expired(&self, now: i64) -> bool {
        now.saturating_sub(self.uploaded_at) > self.expire_seconds as i64
    }

    /// Last second at which the entry is still served.
    pub fn expires_at(&self) -> i64 {
        self.uploaded_at.saturating_add(self.expire_seconds as i64)
    }
}

/// The whole persisted index, in insertion order, unique by `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetadataIndex {
    entries: Vec<Entry>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index, rejecting duplicate ids.
    pub fn from_entries(entries: Vec<Entry>) -> Result<Self> {
        let mut index = Self::new();
        for entry in entries {
            if !index.insert(entry.clone()) {
                return Err(StashError::IndexCorrupt(format!(
                    "duplicate id '{}'",
                    entry.id
                )));
            }
        }
        Ok(index)
    }

    pub fn get(&self, id: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Append `entry`. Returns `false` (and leaves the index untouched) if
    /// the id is already taken.
    pub fn insert(&mut self, entry: Entry) -> bool {
        if self.contains(&entry.id) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Entry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Split into (kept, removed) preserving order in both.
    pub fn partition<F>(self, mut keep: F) -> (Self, Vec<Entry>)
    where
        F: FnMut(&Entry) -> bool,
    {
        let (kept, removed) = self.entries.into_iter().partition(|e| keep(e));
        (Self { entries: kept }, removed)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reduce a client-supplied filename to a safe display name.
pub fn sanitize_name(raw: &str) -> String {
    let last = raw.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or("");
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return FALLBACK_NAME.to_string();
    }

    let mut end = trimmed.len().min(MAX_NAME_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

/// Client header first (unless it's the generic octet-stream), then a guess
/// from the filename extension.
pub fn infer_content_type(name: &str, client: Option<&str>) -> String {
    if let Some(ct) = client.map(str::trim).filter(|c| !c.is_empty()) {
        let printable = ct.chars().all(|c| c.is_ascii_graphic() || c == ' ');
        if printable && ct.contains('/') && !ct.eq_ignore_ascii_case(OCTET_STREAM) {
            return ct.to_string();
        }
    }
    mime_guess::from_path(name)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}
