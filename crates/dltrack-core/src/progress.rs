//! Throttled, smoothed progress tracking
//!
//! Transfer delegates can report progress far more often than anyone needs
//! to see it. Samples arriving within [`THROTTLE_INTERVAL`] of the last
//! accepted one are dropped outright, and the byte rate is smoothed with an
//! exponential moving average.

use dltrack_types::{DownloadItem, DownloadStatus};
use std::time::{Duration, Instant};

/// Minimum spacing between accepted samples
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

/// Weight of the newest instantaneous rate in the moving average
pub const SMOOTHING_FACTOR: f64 = 0.3;

/// Result of offering a sample to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// The sample was applied to the item
    Accepted,
    /// Too soon after the previous sample; nothing changed
    Throttled,
    /// The item is not downloading
    Ignored,
}

/// Stateless helper applying progress samples to a [`DownloadItem`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressTracker;

impl ProgressTracker {
    pub fn apply(
        item: &mut DownloadItem,
        downloaded: u64,
        total: Option<u64>,
        now: Instant,
    ) -> Sample {
        if item.status != DownloadStatus::Downloading {
            return Sample::Ignored;
        }

        let Some(last_update) = item.last_update_time else {
            Self::record(item, downloaded, total, now);
            return Sample::Accepted;
        };

        let elapsed = now.saturating_duration_since(last_update);
        if elapsed < THROTTLE_INTERVAL {
            return Sample::Throttled;
        }

        let delta = downloaded.saturating_sub(item.last_downloaded_size);
        let instantaneous = delta as f64 / elapsed.as_secs_f64();
        item.bytes_per_second = smooth(item.bytes_per_second, instantaneous);
        Self::record(item, downloaded, total, now);
        Sample::Accepted
    }

    fn record(item: &mut DownloadItem, downloaded: u64, total: Option<u64>, now: Instant) {
        item.downloaded_size = item.downloaded_size.max(downloaded);
        item.last_downloaded_size = item.downloaded_size;
        item.last_update_time = Some(now);
        if let Some(total) = total.filter(|t| *t > 0) {
            item.file_size = Some(total);
        }
    }
}

/// One step of the exponential moving average
pub fn smooth(previous: f64, instantaneous: f64) -> f64 {
    if previous == 0.0 {
        instantaneous
    } else {
        SMOOTHING_FACTOR * instantaneous + (1.0 - SMOOTHING_FACTOR) * previous
    }
}
