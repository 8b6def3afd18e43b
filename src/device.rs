//! Device discovery helpers.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::service::{Device, DeviceSource};

pub const DEFAULT_WAIT_TRIES: u32 = 12;
pub const DEFAULT_WAIT_DELAY: Duration = Duration::from_millis(500);

/// The first device the service flags active. `Ok(None)` when no device is
/// active; only the fetch itself can fail.
pub async fn first_active_device(source: &dyn DeviceSource) -> Result<Option<Device>> {
    let devices = source.fetch_devices().await.context("Failed to fetch devices")?;
    Ok(devices.into_iter().find(|d| d.is_active))
}

/// Poll for an active device, e.g. right after launching a local player,
/// giving up after `tries` attempts spaced `delay` apart.
pub async fn wait_for_device(
    source: &dyn DeviceSource,
    tries: u32,
    delay: Duration,
) -> Result<Option<Device>> {
    for attempt in 0..tries {
        if let Some(device) = first_active_device(source).await? {
            tracing::debug!(device = %device.name, attempt, "active device found");
            return Ok(Some(device));
        }
        tokio::time::sleep(delay).await;
    }
    Ok(None)
}
