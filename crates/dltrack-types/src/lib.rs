//! Shared types for dltrack
//!
//! This crate contains the data model shared by the core lifecycle
//! manager and the CLI: download records, their status, settings and
//! the events the core broadcasts after every committed change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

// ============================================================================
// Download Types
// ============================================================================

/// A single tracked file transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub id: Uuid,
    pub filename: String,
    pub url: String,
    pub local_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub downloaded_size: u64,
    pub status: DownloadStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub bytes_per_second: f64,
    /// When the last progress sample was accepted. In-memory only.
    #[serde(skip)]
    pub last_update_time: Option<Instant>,
    /// Byte count of the last accepted progress sample. In-memory only.
    #[serde(skip)]
    pub last_downloaded_size: u64,
}

impl DownloadItem {
    /// Create a fresh record in the `downloading` state
    pub fn new(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            url: url.into(),
            local_path: None,
            file_size: None,
            downloaded_size: 0,
            status: DownloadStatus::Downloading,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            bytes_per_second: 0.0,
            last_update_time: None,
            last_downloaded_size: 0,
        }
    }

    /// Percentage complete, 0 when the total size is unknown
    pub fn progress(&self) -> f64 {
        match self.file_size {
            Some(size) if size > 0 => {
                ((self.downloaded_size as f64 / size as f64) * 100.0).min(100.0)
            }
            _ => 0.0,
        }
    }

    /// Seconds left at the current smoothed rate, if it can be estimated
    pub fn eta_seconds(&self) -> Option<u64> {
        let total = self.file_size?;
        if self.bytes_per_second <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.downloaded_size);
        Some((remaining as f64 / self.bytes_per_second).ceil() as u64)
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Status of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    /// Terminal states accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// When finished downloads are removed from the list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetentionPolicy {
    #[default]
    AfterOneDay,
    UponSuccessfulDownload,
    WhenAppQuits,
    Manually,
}

impl std::str::FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "afteroneday" => Ok(RetentionPolicy::AfterOneDay),
            "uponsuccessfuldownload" => Ok(RetentionPolicy::UponSuccessfulDownload),
            "whenappquits" => Ok(RetentionPolicy::WhenAppQuits),
            "manually" => Ok(RetentionPolicy::Manually),
            other => Err(format!("Invalid retention policy: {}", other)),
        }
    }
}

/// Settings the download core reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub open_safe_files_after_download: bool,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
    #[serde(default = "default_max_download_items")]
    pub max_download_items: usize,
    #[serde(default = "default_downloads_directory")]
    pub downloads_directory: PathBuf,
}

fn default_max_download_items() -> usize {
    100
}

fn default_downloads_directory() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            open_safe_files_after_download: false,
            retention_policy: RetentionPolicy::default(),
            max_download_items: default_max_download_items(),
            downloads_directory: default_downloads_directory(),
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events broadcast by the core after each committed mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DownloadEvent {
    Added {
        item: DownloadItem,
    },
    Progress {
        id: Uuid,
        downloaded: u64,
        total: Option<u64>,
        bytes_per_second: f64,
    },
    StatusChanged {
        id: Uuid,
        status: DownloadStatus,
        error: Option<String>,
    },
    Updated {
        item: DownloadItem,
    },
    Removed {
        id: Uuid,
    },
    Cleared,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!DownloadStatus::Pending.is_terminal());
        assert!(!DownloadStatus::Downloading.is_terminal());
        assert!(DownloadStatus::Completed.is_terminal());
        assert!(DownloadStatus::Failed.is_terminal());
        assert!(DownloadStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_item_wire_format() {
        let mut item = DownloadItem::new("https://x/file.zip", "file.zip");
        item.last_update_time = Some(Instant::now());
        item.last_downloaded_size = 42;

        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["status"], "downloading");
        assert_eq!(value["filename"], "file.zip");
        assert!(value.get("downloadedSize").is_some());
        assert!(value.get("lastUpdateTime").is_none());
        assert!(value.get("lastDownloadedSize").is_none());

        let back: DownloadItem = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, item.id);
        assert_eq!(back.last_update_time, None);
        assert_eq!(back.last_downloaded_size, 0);
    }

    #[test]
    fn test_progress_and_eta() {
        let mut item = DownloadItem::new("https://x/a.bin", "a.bin");
        assert_eq!(item.progress(), 0.0);
        assert_eq!(item.eta_seconds(), None);

        item.file_size = Some(2000);
        item.downloaded_size = 500;
        item.bytes_per_second = 500.0;
        assert_eq!(item.progress(), 25.0);
        assert_eq!(item.eta_seconds(), Some(3));
    }

    #[test]
    fn test_settings_defaults_fill_missing_fields() {
        let settings: Settings = serde_json::from_str(r#"{"openSafeFilesAfterDownload":true}"#).unwrap();
        assert!(settings.open_safe_files_after_download);
        assert_eq!(settings.retention_policy, RetentionPolicy::AfterOneDay);
        assert_eq!(settings.max_download_items, 100);
    }

    #[test]
    fn test_retention_policy_parse() {
        assert_eq!("after-one-day".parse::<RetentionPolicy>().unwrap(), RetentionPolicy::AfterOneDay);
        assert_eq!("whenAppQuits".parse::<RetentionPolicy>().unwrap(), RetentionPolicy::WhenAppQuits);
        assert!("never".parse::<RetentionPolicy>().is_err());
    }
}
