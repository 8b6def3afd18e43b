//! Background playback poller.
//!
//! Repeatedly fetches the current playback snapshot, pushes changed
//! snapshots out through an mpsc channel, and adapts its poll cadence to
//! what the service reports: fast while playing (faster still near a track
//! boundary), slower while paused, slowest while idle. The loop stops itself
//! after a configurable stretch of continuous pause/idle so nothing polls
//! forever when the user walked away.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::service::{PlaybackSnapshot, PlaybackSource, SourceError};

/// Fallback backoff when a rate-limit response carries no usable hint, and
/// the backoff for any other transient fetch failure.
const TRANSIENT_BACKOFF_SECS: f64 = 2.0;

/// Floor for the near-track-end fast re-poll.
const NEAR_END_FLOOR_SECS: f64 = 0.8;

/// How far ahead of the computed track end the next poll lands.
const NEAR_END_LEAD_SECS: f64 = 0.3;

/// Poll cadence tiers and the idle auto-stop ceiling, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Base delay while a track is playing.
    pub playing_secs: f64,
    /// Delay while a device is connected but playback is paused.
    pub paused_secs: f64,
    /// Delay while no device or session is active.
    pub idle_secs: f64,
    /// Continuous paused/idle time after which the loop stops itself.
    pub max_idle_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            playing_secs: 5.0,
            paused_secs: 10.0,
            idle_secs: 25.0,
            max_idle_secs: 3600,
        }
    }
}

/// Handle to a spawned poller task.
pub struct PollerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Request shutdown. One-way: the loop aborts any in-progress wait,
    /// exits at the next iteration boundary, and performs no further fetches.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether the loop has exited, either via [`stop`](Self::stop) or its
    /// own idle ceiling.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to exit.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// The poll loop state. Owned exclusively by the spawned task.
pub struct Poller {
    source: Arc<dyn PlaybackSource>,
    config: PollerConfig,
    sink: mpsc::UnboundedSender<PlaybackSnapshot>,
    last_snapshot: Option<PlaybackSnapshot>,
    idle_since: Option<Instant>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Poller {
    /// Spawn the poll loop on the current runtime. Every snapshot that
    /// differs from the previous one is sent to `sink`; equal repeats are
    /// never re-announced.
    pub fn spawn(
        source: Arc<dyn PlaybackSource>,
        config: PollerConfig,
        sink: mpsc::UnboundedSender<PlaybackSnapshot>,
    ) -> PollerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = Poller {
            source,
            config,
            sink,
            last_snapshot: None,
            idle_since: None,
            shutdown_rx,
        };
        let task = tokio::spawn(poller.run());
        PollerHandle { shutdown_tx, task }
    }

    async fn run(mut self) {
        tracing::debug!("playback poller started");
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let delay = match self.source.fetch_current_playback().await {
                Ok(snapshot) => self.observe(snapshot),
                Err(err) => self.backoff_for(&err),
            };

            if self.idle_ceiling_reached() {
                tracing::info!(
                    ceiling_secs = self.config.max_idle_secs,
                    "playback idle past ceiling, stopping poller"
                );
                break;
            }

            if !self.pause_between_polls(delay).await {
                break;
            }
        }
        tracing::debug!("playback poller stopped");
    }

    /// Fold one successful fetch into the loop state and pick the next delay.
    fn observe(&mut self, snapshot: Option<PlaybackSnapshot>) -> Duration {
        let Some(state) = snapshot else {
            // No active session at all.
            self.mark_idle();
            return Duration::from_secs_f64(self.config.idle_secs);
        };

        if self.last_snapshot.as_ref() != Some(&state) {
            let _ = self.sink.send(state.clone());
            self.last_snapshot = Some(state.clone());
        }

        if state.is_playing {
            if let (Some(progress), Some(duration)) = (state.progress_ms, state.duration_ms) {
                self.idle_since = None;
                return Duration::from_secs_f64(playing_delay_secs(
                    self.config.playing_secs,
                    progress,
                    duration,
                ));
            }
        }

        self.mark_idle();
        if state.device_id.is_some() {
            Duration::from_secs_f64(self.config.paused_secs)
        } else {
            Duration::from_secs_f64(self.config.idle_secs)
        }
    }

    /// Fetch failures never escape the loop; they only pick the next delay.
    /// `last_snapshot` and the idle clock are left untouched.
    fn backoff_for(&self, err: &SourceError) -> Duration {
        match err {
            SourceError::RateLimited { retry_after } => {
                let secs = retry_after_secs(retry_after.as_deref());
                tracing::warn!(retry_after_secs = secs, "rate limited, honoring retry hint");
                Duration::from_secs_f64(secs)
            }
            SourceError::Transient(reason) => {
                tracing::debug!(%reason, "playback fetch failed, backing off");
                Duration::from_secs_f64(TRANSIENT_BACKOFF_SECS)
            }
        }
    }

    fn mark_idle(&mut self) {
        if self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
        }
    }

    fn idle_ceiling_reached(&self) -> bool {
        self.idle_since
            .map(|since| since.elapsed() >= Duration::from_secs(self.config.max_idle_secs))
            .unwrap_or(false)
    }

    /// Suspend until the delay elapses or shutdown is requested. Returns
    /// false when the wait was aborted by shutdown.
    async fn pause_between_polls(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown_rx.changed() => false,
        }
    }
}

/// Delay while playing: aim just short of the remaining track time so the
/// next poll catches the track transition, floored so we never spin.
fn playing_delay_secs(base_secs: f64, progress_ms: u64, duration_ms: u64) -> f64 {
    let remaining = duration_ms.saturating_sub(progress_ms) as f64 / 1000.0;
    if remaining > 1.0 {
        f64::max(
            NEAR_END_FLOOR_SECS,
            f64::min(base_secs, remaining - NEAR_END_LEAD_SECS),
        )
    } else {
        NEAR_END_FLOOR_SECS
    }
}

/// Parse a `Retry-After` hint as seconds, falling back to the fixed short
/// backoff when the hint is absent or malformed.
fn retry_after_secs(hint: Option<&str>) -> f64 {
    hint.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .unwrap_or(TRANSIENT_BACKOFF_SECS)
}
