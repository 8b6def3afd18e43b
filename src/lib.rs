//! attune — the polling and caching engine of a companion process for a
//! remote music-playback service.
//!
//! Two cooperating components:
//!
//! - [`poller::Poller`]: a background task that keeps a local view of "what
//!   is currently playing" fresh via adaptive polling and pushes changed
//!   snapshots out over a channel.
//! - [`library::LibraryCache`]: a TTL-bounded, delta-synchronized disk cache
//!   of the user's saved albums, pulled on demand.
//!
//! The remote service itself, the presentation layer, and credentials all
//! live outside this crate and plug in through the traits in [`service`].

pub mod config;
pub mod device;
pub mod library;
pub mod library_store;
pub mod poller;
pub mod service;

pub use config::{Config, LibraryConfig};
pub use library::LibraryCache;
pub use library_store::{AlbumEntry, LibraryModel, LibraryStore};
pub use poller::{Poller, PollerConfig, PollerHandle};
pub use service::{
    Album, Device, DeviceSource, LibrarySource, PlaybackSnapshot, PlaybackSource, SavedAlbumItem,
    SourceError, TrackInfo,
};
