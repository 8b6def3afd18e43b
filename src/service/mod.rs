//! Collaborator traits and the shared data model.
//!
//! The remote playback service is reached only through the traits defined
//! here; the HTTP client, auth flow, and presentation layer all live outside
//! this crate and plug in at these seams.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by the remote service collaborators.
///
/// The poller treats these two shapes differently: a rate-limit response is
/// backed off by exactly the server-supplied hint, everything else by a
/// fixed short delay.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The service rejected the call with a rate-limit response. The hint is
    /// the raw `Retry-After` value in seconds, if the response carried one.
    #[error("rate limited by service (retry-after: {retry_after:?})")]
    RateLimited { retry_after: Option<String> },

    /// Any other fetch failure: network hiccup, server error, decode error.
    #[error("transient source error: {0}")]
    Transient(String),
}

/// Identifies the item currently playing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub name: String,
    pub artist: String,
    pub album: String,
}

/// One point-in-time read of playback status.
///
/// Constructed fresh on every successful poll and never mutated; field-wise
/// equality drives the poller's change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub track: Option<TrackInfo>,
    pub progress_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub is_playing: bool,
    pub device_id: Option<String>,
}

/// Identifying metadata for a saved album. Persisted inside cache entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub name: String,
    pub artists: Vec<String>,
    /// Release date as reported by the service; either a full ISO-8601
    /// timestamp or a bare `YYYY-MM-DD`. May be empty when unknown.
    pub release_date: String,
}

/// One raw entry from a saved-albums page, newest first.
#[derive(Debug, Clone)]
pub struct SavedAlbumItem {
    pub album: Album,
    /// ISO-8601 timestamp the user saved the album at; doubles as the
    /// freshness cursor for delta sync.
    pub added_at: String,
}

/// A playback device known to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub is_active: bool,
}

/// Source of playback snapshots for the poller.
#[async_trait]
pub trait PlaybackSource: Send + Sync {
    /// Fetch the current playback state. `Ok(None)` means the service has no
    /// active session, which is a normal idle condition rather than an error.
    async fn fetch_current_playback(&self) -> Result<Option<PlaybackSnapshot>, SourceError>;
}

/// Source of the user's saved-albums collection for the delta-sync cache.
#[async_trait]
pub trait LibrarySource: Send + Sync {
    /// Cheap freshness peek: the `added_at` cursor of the single newest saved
    /// album, or `None` when the library is empty.
    async fn peek_newest_saved_album(&self) -> Result<Option<String>, SourceError>;

    /// Fetch one page of saved albums, newest first. A page shorter than
    /// `limit` (including an empty one) marks the end of the collection.
    async fn fetch_saved_albums_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SavedAlbumItem>, SourceError>;
}

/// Source of the device list for device discovery.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn fetch_devices(&self) -> Result<Vec<Device>, SourceError>;
}
