//! Progress bar utilities for CLI downloads

use console::style;
use dltrack_types::{DownloadEvent, DownloadItem, DownloadStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use uuid::Uuid;

/// Manages progress bars for the downloads a command is following
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<Uuid, ProgressBar>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Create a progress bar for a download
    pub fn add_download(&mut self, item: &DownloadItem) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(item.file_size.unwrap_or(0)));

        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }

        pb.set_message(item.filename.clone());
        pb.set_position(item.downloaded_size);

        self.bars.insert(item.id, pb.clone());
        pb
    }

    /// Update a progress bar from an event
    pub fn handle_event(&self, event: &DownloadEvent) {
        match event {
            DownloadEvent::Progress {
                id,
                downloaded,
                total,
                ..
            } => {
                if let Some(pb) = self.bars.get(id) {
                    if let Some(total) = total {
                        pb.set_length(*total);
                    }
                    pb.set_position(*downloaded);
                }
            }

            DownloadEvent::StatusChanged { id, status, error } => {
                if let Some(pb) = self.bars.get(id) {
                    match status {
                        DownloadStatus::Completed => {
                            pb.finish_with_message(format!(
                                "{} Download complete",
                                style("✓").green().bold()
                            ));
                        }
                        DownloadStatus::Failed => {
                            pb.abandon_with_message(format!(
                                "{} Failed: {}",
                                style("✗").red().bold(),
                                error.as_deref().unwrap_or("Unknown error")
                            ));
                        }
                        DownloadStatus::Cancelled => {
                            pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
                        }
                        _ => {}
                    }
                }
            }

            _ => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
