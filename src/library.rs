//! TTL-bounded, delta-synced saved-albums cache.
//!
//! `get_albums` trusts the persisted cache while it is fresh, then checks a
//! single-entry "peek" against the stored cursor, and only pages through the
//! remote collection when something actually changed upstream — stopping as
//! soon as it reaches an already-known album.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tokio::sync::Mutex;

use crate::library_store::{parse_date, AlbumEntry, LibraryStore};
use crate::service::{Album, LibrarySource, SavedAlbumItem};

const DEFAULT_PAGE_SIZE: usize = 50;

/// The saved-albums cache. Exclusively owns its on-disk record; all calls
/// for the same store go through one instance so refreshes never race.
pub struct LibraryCache {
    source: Arc<dyn LibrarySource>,
    store: LibraryStore,
    page_size: usize,
    sync_lock: Mutex<()>,
}

impl LibraryCache {
    pub fn new(source: Arc<dyn LibrarySource>, store: LibraryStore) -> Self {
        Self {
            source,
            store,
            page_size: DEFAULT_PAGE_SIZE,
            sync_lock: Mutex::new(()),
        }
    }

    /// Override the pagination batch size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Return the user's saved albums, newest first, refreshing the cache
    /// only when it is stale and the service reports upstream changes.
    ///
    /// Calls are serialized: a caller arriving during a refresh blocks until
    /// it completes and then reuses its result via the freshened TTL.
    pub async fn get_albums(&self, ttl: Duration) -> Result<Vec<Album>> {
        let _guard = self.sync_lock.lock().await;

        let mut model = self.store.load().unwrap_or_default();
        let now = epoch_now();

        // Fresh by TTL and non-empty: trust the cache, no network at all.
        if !model.album_ids.is_empty() && now - model.updated_ts < ttl.as_secs_f64() {
            return Ok(model.albums());
        }

        let newest = self
            .source
            .peek_newest_saved_album()
            .await
            .context("Failed to peek newest saved album")?;

        if newest.is_some() && newest == model.latest_added_at {
            // Nothing changed upstream; refresh the TTL window only.
            model.updated_ts = now;
            self.store.save(&model)?;
            return Ok(model.albums());
        }

        let new_entries = self.fetch_new_entries(&model.album_ids).await?;

        if !new_entries.is_empty() {
            let count = new_entries.len();
            model.merge_new_entries(new_entries, newest);
            tracing::debug!(count, "merged new saved albums into cache");
        }
        model.updated_ts = now;
        model.sort_entries();
        self.store.save(&model)?;

        Ok(model.albums())
    }

    /// Page through the collection newest-first, collecting entries until an
    /// already-known id or the last page is reached.
    async fn fetch_new_entries(&self, known_ids: &HashSet<String>) -> Result<Vec<AlbumEntry>> {
        let mut new_entries: Vec<AlbumEntry> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut offset = 0;

        loop {
            let mut items = self
                .source
                .fetch_saved_albums_page(offset, self.page_size)
                .await
                .with_context(|| format!("Failed to fetch saved albums page at offset {offset}"))?;
            if items.is_empty() {
                break;
            }

            // The service can deliver slightly out of order; scan each page
            // newest-first by the later of save time and release time.
            items.sort_by(|a, b| effective_date(b).cmp(&effective_date(a)));

            let page_len = items.len();
            let mut hit_known = false;
            for item in items {
                if not_yet_released(&item) {
                    // Not playable yet; caching it would leave a stale entry
                    // once the album actually releases.
                    continue;
                }
                if known_ids.contains(&item.album.id) {
                    hit_known = true;
                    break;
                }
                if !seen.insert(item.album.id.clone()) {
                    continue;
                }
                new_entries.push(AlbumEntry {
                    album: item.album,
                    added_at: item.added_at,
                });
            }

            // Known territory or a short page both mean we are done.
            if hit_known || page_len < self.page_size {
                break;
            }
            offset += self.page_size;
        }

        Ok(new_entries)
    }

    /// Drop the persisted cache; the next `get_albums` performs a full sync.
    pub fn invalidate(&self) {
        self.store.invalidate();
    }
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The later of the save timestamp and the release timestamp.
fn effective_date(item: &SavedAlbumItem) -> NaiveDateTime {
    parse_date(&item.added_at).max(parse_date(&item.album.release_date))
}

/// Saved before its release date: the album exists in the library but
/// cannot be acted on yet.
fn not_yet_released(item: &SavedAlbumItem) -> bool {
    if item.album.release_date.is_empty() {
        return false;
    }
    parse_date(&item.added_at) < parse_date(&item.album.release_date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library_store::LibraryModel;
    use crate::service::SourceError;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PagedSource {
        /// The full remote collection, newest first.
        items: Vec<SavedAlbumItem>,
        peek_calls: AtomicUsize,
        page_calls: AtomicUsize,
        fail_pages: bool,
    }

    impl PagedSource {
        fn new(items: Vec<SavedAlbumItem>) -> Arc<Self> {
            Arc::new(Self {
                items,
                peek_calls: AtomicUsize::new(0),
                page_calls: AtomicUsize::new(0),
                fail_pages: false,
            })
        }

        fn failing(items: Vec<SavedAlbumItem>) -> Arc<Self> {
            Arc::new(Self {
                items,
                peek_calls: AtomicUsize::new(0),
                page_calls: AtomicUsize::new(0),
                fail_pages: true,
            })
        }
    }

    #[async_trait]
    impl LibrarySource for PagedSource {
        async fn peek_newest_saved_album(&self) -> Result<Option<String>, SourceError> {
            self.peek_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.items.first().map(|i| i.added_at.clone()))
        }

        async fn fetch_saved_albums_page(
            &self,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<SavedAlbumItem>, SourceError> {
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_pages {
                return Err(SourceError::Transient("page fetch failed".to_string()));
            }
            if offset >= self.items.len() {
                return Ok(Vec::new());
            }
            let end = (offset + limit).min(self.items.len());
            Ok(self.items[offset..end].to_vec())
        }
    }

    fn item(id: &str, added_at: &str, release_date: &str) -> SavedAlbumItem {
        SavedAlbumItem {
            album: Album {
                id: id.to_string(),
                name: format!("Album {id}"),
                artists: vec!["Test Artist".to_string()],
                release_date: release_date.to_string(),
            },
            added_at: added_at.to_string(),
        }
    }

    fn entry(id: &str, added_at: &str) -> AlbumEntry {
        let it = item(id, added_at, "2024-01-01");
        AlbumEntry {
            album: it.album,
            added_at: it.added_at,
        }
    }

    fn temp_store() -> (tempfile::TempDir, LibraryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LibraryStore::new(dir.path().join("saved_albums.json"));
        (dir, store)
    }

    fn ids(albums: &[Album]) -> Vec<&str> {
        albums.iter().map(|a| a.id.as_str()).collect()
    }

    #[tokio::test]
    async fn first_sync_populates_the_cache() {
        let source = PagedSource::new(vec![
            item("a", "2025-05-02T10:00:00Z", "2024-01-01"),
            item("b", "2025-05-01T10:00:00Z", "2024-01-01"),
        ]);
        let (_dir, store) = temp_store();
        let cache = LibraryCache::new(source.clone(), store);

        let albums = cache.get_albums(Duration::from_secs(900)).await.unwrap();
        assert_eq!(ids(&albums), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn fresh_cache_skips_the_network_entirely() {
        let source = PagedSource::new(vec![item("a", "2025-05-02T10:00:00Z", "2024-01-01")]);
        let (_dir, store) = temp_store();
        let cache = LibraryCache::new(source.clone(), store);

        let first = cache.get_albums(Duration::from_secs(900)).await.unwrap();
        let peeks = source.peek_calls.load(Ordering::SeqCst);
        let pages = source.page_calls.load(Ordering::SeqCst);

        let second = cache.get_albums(Duration::from_secs(900)).await.unwrap();
        let third = cache.get_albums(Duration::from_secs(900)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(source.peek_calls.load(Ordering::SeqCst), peeks);
        assert_eq!(source.page_calls.load(Ordering::SeqCst), pages);
    }

    #[tokio::test]
    async fn unchanged_cursor_refreshes_ttl_with_one_call() {
        let source = PagedSource::new(vec![item("a", "2025-05-02T10:00:00Z", "2024-01-01")]);
        let (_dir, store) = temp_store();
        let cache = LibraryCache::new(source.clone(), store);

        cache.get_albums(Duration::from_secs(900)).await.unwrap();
        let pages = source.page_calls.load(Ordering::SeqCst);

        // TTL of zero forces the staleness path; the peek matches the stored
        // cursor so no pagination happens.
        let albums = cache.get_albums(Duration::ZERO).await.unwrap();
        assert_eq!(ids(&albums), vec!["a"]);
        assert_eq!(source.peek_calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.page_calls.load(Ordering::SeqCst), pages);
    }

    #[tokio::test]
    async fn delta_sync_stops_at_known_territory() {
        // Store already knows {a, b, c}; remote gained d and e on top.
        let source = PagedSource::new(vec![
            item("d", "2025-05-05T10:00:00Z", "2024-01-01"),
            item("e", "2025-05-04T10:00:00Z", "2024-01-01"),
            item("a", "2025-05-03T10:00:00Z", "2024-01-01"),
            item("b", "2025-05-02T10:00:00Z", "2024-01-01"),
            item("c", "2025-05-01T10:00:00Z", "2024-01-01"),
        ]);
        let (_dir, store) = temp_store();

        let mut model = LibraryModel::default();
        model.merge_new_entries(
            vec![
                entry("a", "2025-05-03T10:00:00Z"),
                entry("b", "2025-05-02T10:00:00Z"),
                entry("c", "2025-05-01T10:00:00Z"),
            ],
            Some("2025-05-03T10:00:00Z".to_string()),
        );
        store.save(&model).unwrap();

        let cache = LibraryCache::new(source.clone(), store.clone()).with_page_size(2);
        let albums = cache.get_albums(Duration::ZERO).await.unwrap();

        assert_eq!(ids(&albums), vec!["d", "e", "a", "b", "c"]);
        // Page [d, e] is full and all-new; page [a, b] hits known territory.
        assert_eq!(source.page_calls.load(Ordering::SeqCst), 2);

        let persisted = store.load().unwrap();
        let expected: HashSet<String> =
            ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        assert_eq!(persisted.album_ids, expected);
        assert_eq!(
            persisted.latest_added_at.as_deref(),
            Some("2025-05-05T10:00:00Z")
        );
    }

    #[tokio::test]
    async fn unreleased_albums_are_excluded() {
        let source = PagedSource::new(vec![
            item("future", "2025-05-03T10:00:00Z", "2999-01-01"),
            item("a", "2025-05-02T10:00:00Z", "2024-01-01"),
        ]);
        let (_dir, store) = temp_store();
        let cache = LibraryCache::new(source, store);

        let albums = cache.get_albums(Duration::from_secs(900)).await.unwrap();
        assert_eq!(ids(&albums), vec!["a"]);
    }

    #[tokio::test]
    async fn missing_release_date_never_excludes() {
        let source = PagedSource::new(vec![item("a", "2025-05-02T10:00:00Z", "")]);
        let (_dir, store) = temp_store();
        let cache = LibraryCache::new(source, store);

        let albums = cache.get_albums(Duration::from_secs(900)).await.unwrap();
        assert_eq!(ids(&albums), vec!["a"]);
    }

    #[tokio::test]
    async fn corrupt_cache_file_triggers_a_full_resync() {
        let source = PagedSource::new(vec![
            item("a", "2025-05-02T10:00:00Z", "2024-01-01"),
            item("b", "2025-05-01T10:00:00Z", "2024-01-01"),
        ]);
        let (_dir, store) = temp_store();
        fs::write(store.path(), "not json at all").unwrap();

        let cache = LibraryCache::new(source, store.clone());
        let albums = cache.get_albums(Duration::from_secs(900)).await.unwrap();
        assert_eq!(ids(&albums), vec!["a", "b"]);

        // The bad file was overwritten with a valid record.
        let persisted = store.load().unwrap();
        assert_eq!(persisted.entries.len(), 2);
    }

    #[tokio::test]
    async fn source_failure_leaves_the_store_untouched() {
        let (_dir, store) = temp_store();
        let mut model = LibraryModel::default();
        model.merge_new_entries(
            vec![entry("a", "2025-05-01T10:00:00Z")],
            Some("2025-05-01T10:00:00Z".to_string()),
        );
        store.save(&model).unwrap();
        let before = fs::read_to_string(store.path()).unwrap();

        // Peek reports a newer cursor, then every page fetch fails.
        let source = PagedSource::failing(vec![item("b", "2025-05-02T10:00:00Z", "2024-01-01")]);
        let cache = LibraryCache::new(source, store.clone());

        let err = cache.get_albums(Duration::ZERO).await.unwrap_err();
        assert!(err.to_string().contains("saved albums page"));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn concurrent_calls_serialize_on_one_refresh() {
        let source = PagedSource::new(vec![
            item("a", "2025-05-02T10:00:00Z", "2024-01-01"),
            item("b", "2025-05-01T10:00:00Z", "2024-01-01"),
        ]);
        let (_dir, store) = temp_store();
        let cache = Arc::new(LibraryCache::new(source.clone(), store.clone()));

        let (left, right) = tokio::join!(
            {
                let cache = Arc::clone(&cache);
                async move { cache.get_albums(Duration::from_secs(900)).await }
            },
            {
                let cache = Arc::clone(&cache);
                async move { cache.get_albums(Duration::from_secs(900)).await }
            },
        );
        let left = left.unwrap();
        let right = right.unwrap();
        assert_eq!(left, right);

        // One refresh only; the second caller reused its result.
        assert_eq!(source.peek_calls.load(Ordering::SeqCst), 1);

        // Persisted invariants: unique ids, descending added_at.
        let persisted = store.load().unwrap();
        let unique: HashSet<String> =
            persisted.entries.iter().map(|e| e.album.id.clone()).collect();
        assert_eq!(unique.len(), persisted.entries.len());
        assert_eq!(persisted.album_ids, unique);
        for pair in persisted.entries.windows(2) {
            assert!(parse_date(&pair[0].added_at) >= parse_date(&pair[1].added_at));
        }
    }

    #[tokio::test]
    async fn invalidate_drops_the_persisted_record() {
        let source = PagedSource::new(vec![item("a", "2025-05-02T10:00:00Z", "2024-01-01")]);
        let (_dir, store) = temp_store();
        let cache = LibraryCache::new(source, store.clone());

        cache.get_albums(Duration::from_secs(900)).await.unwrap();
        assert!(store.path().exists());

        cache.invalidate();
        assert!(!store.path().exists());
    }
}
