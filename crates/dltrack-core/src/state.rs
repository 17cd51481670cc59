//! Download state machine
//!
//! ```text
//!                 progress
//!                 ┌──────┐
//!                 ▼      │
//!   create ──► downloading ──── finish ───► completed
//!                 │   │
//!                 │   └──────── error ────► failed ──(retry: new record)
//!                 │
//!   pending ──────┴──── cancel ───────────► cancelled
//!
//!   pending/downloading on reload ─────────► failed ("Download interrupted")
//! ```
//!
//! Every transition returns whether it applied. A callback that arrives
//! after the item reached a terminal state is a no-op.

use chrono::{DateTime, Utc};
use dltrack_types::{DownloadItem, DownloadStatus};
use std::path::PathBuf;

/// Message recorded on items found mid-transfer at startup
pub const INTERRUPTED_MESSAGE: &str = "Download interrupted";

fn is_in_flight(status: DownloadStatus) -> bool {
    matches!(status, DownloadStatus::Pending | DownloadStatus::Downloading)
}

/// `downloading` → `completed`
pub fn complete(
    item: &mut DownloadItem,
    local_path: Option<PathBuf>,
    size: Option<u64>,
    now: DateTime<Utc>,
) -> bool {
    if item.status != DownloadStatus::Downloading {
        return false;
    }

    if let Some(path) = local_path {
        if let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) {
            if name != item.filename {
                item.filename = name;
            }
        }
        item.local_path = Some(path);
    }
    if let Some(size) = size {
        item.file_size = Some(size);
        item.downloaded_size = size;
    }

    item.status = DownloadStatus::Completed;
    item.completed_at = Some(now);
    item.error_message = None;
    true
}

/// `downloading` → `failed`
pub fn fail(item: &mut DownloadItem, message: impl Into<String>) -> bool {
    if item.status != DownloadStatus::Downloading {
        return false;
    }
    item.status = DownloadStatus::Failed;
    item.error_message = Some(message.into());
    item.bytes_per_second = 0.0;
    true
}

/// `pending`/`downloading` → `cancelled`
pub fn cancel(item: &mut DownloadItem) -> bool {
    if !is_in_flight(item.status) {
        return false;
    }
    item.status = DownloadStatus::Cancelled;
    item.bytes_per_second = 0.0;
    true
}

/// Startup reconciliation: nothing can be in flight before any session exists
pub fn reconcile_interrupted(item: &mut DownloadItem) -> bool {
    if !is_in_flight(item.status) {
        return false;
    }
    item.status = DownloadStatus::Failed;
    item.error_message = Some(INTERRUPTED_MESSAGE.to_string());
    item.bytes_per_second = 0.0;
    true
}

/// Only failed or cancelled records can be retried
pub fn can_retry(item: &DownloadItem) -> bool {
    matches!(item.status, DownloadStatus::Failed | DownloadStatus::Cancelled)
}
