//! Persisted saved-albums cache record.
//!
//! One versioned JSON record per cache file. Reads that hit a missing or
//! corrupt file act as "no cache"; writes stage the full record to a sibling
//! temp file and rename it into place, so a crash mid-write never clobbers
//! the previous valid state.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::service::Album;

const CACHE_FILE_NAME: &str = "saved_albums.json";
const CURRENT_VERSION: u32 = 1;

/// One cached library entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumEntry {
    pub album: Album,
    /// ISO-8601 save timestamp; the sort key and freshness cursor.
    pub added_at: String,
}

/// The persisted aggregate. Invariants maintained by the sync algorithm:
/// `album_ids` is exactly the id-set of `entries`, and `entries` stays
/// sorted descending by `added_at`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LibraryModel {
    /// Storage format version for migrations. Absent in v0 records.
    pub schema_version: u32,
    /// `added_at` of the most recently seen entry at last sync.
    pub latest_added_at: Option<String>,
    pub entries: Vec<AlbumEntry>,
    /// Set mirror of `entries` ids, for O(1) duplicate checks.
    pub album_ids: HashSet<String>,
    /// Epoch seconds of the last successful sync.
    pub updated_ts: f64,
}

impl LibraryModel {
    /// The cached albums in stored (descending `added_at`) order.
    pub fn albums(&self) -> Vec<Album> {
        self.entries.iter().map(|e| e.album.clone()).collect()
    }

    /// Prepend freshly fetched entries and advance the cursor. Callers
    /// guarantee the new entries carry ids not already present.
    pub fn merge_new_entries(
        &mut self,
        mut new_entries: Vec<AlbumEntry>,
        newest_cursor: Option<String>,
    ) {
        for entry in &new_entries {
            self.album_ids.insert(entry.album.id.clone());
        }
        new_entries.append(&mut self.entries);
        self.entries = new_entries;
        if newest_cursor.is_some() {
            self.latest_added_at = newest_cursor;
        }
    }

    /// Restore the descending-`added_at` ordering after a merge.
    pub fn sort_entries(&mut self) {
        self.entries
            .sort_by(|a, b| parse_date(&b.added_at).cmp(&parse_date(&a.added_at)));
    }

    /// Normalize a record written by an older version. `#[serde(default)]`
    /// already backfills absent fields, so each step only has to fix up
    /// values whose meaning changed.
    fn migrate(&mut self) {
        if self.schema_version < 1 {
            // v0 records predate the version field; defaults suffice.
        }
        self.schema_version = CURRENT_VERSION;
    }
}

/// Owns the on-disk representation of one saved-albums cache. No other
/// component reads or writes the file directly.
#[derive(Debug, Clone)]
pub struct LibraryStore {
    path: PathBuf,
}

impl LibraryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The per-user default cache location.
    pub fn default_path() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir().context("Could not find cache directory")?;
        Ok(cache_dir.join("attune").join(CACHE_FILE_NAME))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load the record, treating a missing or unparseable file as "no cache".
    pub fn load(&self) -> Option<LibraryModel> {
        if !self.path.exists() {
            return None;
        }
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), %err, "unreadable album cache, ignoring");
                return None;
            }
        };
        let mut model: LibraryModel = match serde_json::from_str(&contents) {
            Ok(model) => model,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), %err, "corrupt album cache, ignoring");
                return None;
            }
        };
        if model.schema_version != CURRENT_VERSION {
            model.migrate();
        }
        Some(model)
    }

    /// Persist the full record atomically: stage to a temp file in the same
    /// directory, then rename over the previous one.
    pub fn save(&self, model: &LibraryModel) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
        }

        let mut record = model.clone();
        record.schema_version = CURRENT_VERSION;
        let contents = serde_json::to_string(&record).context("Failed to encode album cache")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents)
            .with_context(|| format!("Failed to stage album cache {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to commit album cache {}", self.path.display()))?;
        Ok(())
    }

    /// Best-effort removal of the cache file; the next sync rebuilds it.
    pub fn invalidate(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Parse an ISO-like date or date-time string; bare dates read as midnight.
/// Unparseable input sorts before everything else.
pub(crate) fn parse_date(s: &str) -> NaiveDateTime {
    let s = s.trim().trim_end_matches('Z');
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return dt;
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return dt;
        }
    }
    NaiveDateTime::MIN
}
