//! Output formatting utilities

use crate::OutputFormat;
use console::style;
use dltrack_core::DownloadGroup;
use dltrack_types::{DownloadItem, DownloadStatus};
use tabled::{Table, Tabled};

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec.max(0.0)))
}

/// Format duration as human-readable
pub fn format_eta(seconds: u64) -> String {
    if seconds == 0 {
        return "-".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Shorten a file name to `max` characters for table cells
fn truncate(name: &str, max: usize) -> String {
    if name.chars().count() > max {
        let head: String = name.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        name.to_string()
    }
}

#[derive(Tabled)]
struct DownloadRow {
    id: String,
    filename: String,
    size: String,
    progress: String,
    status: String,
    started: String,
}

impl From<&DownloadItem> for DownloadRow {
    fn from(item: &DownloadItem) -> Self {
        Self {
            id: item.id.to_string()[..8].to_string(),
            filename: truncate(&item.filename, 30),
            size: item
                .file_size
                .map(format_bytes)
                .unwrap_or_else(|| "?".to_string()),
            progress: format!("{:.1}%", item.progress()),
            status: item.status.to_string(),
            started: item
                .started_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
        }
    }
}

pub fn print_item_summary(item: &DownloadItem, detailed: bool) {
    let status_icon = match item.status {
        DownloadStatus::Completed => style("✓").green(),
        DownloadStatus::Downloading => style("↓").cyan(),
        DownloadStatus::Failed => style("✗").red(),
        DownloadStatus::Cancelled => style("○").dim(),
        DownloadStatus::Pending => style("·").dim(),
    };

    let progress = format!("{:.1}%", item.progress());

    println!(
        "{} {} {} [{}]",
        status_icon,
        style(&item.filename).bold(),
        style(&progress).dim(),
        style(item.status).dim()
    );

    if detailed {
        println!("    ID: {}", item.id);
        println!("    URL: {}", item.url);
        if let Some(ref path) = item.local_path {
            println!("    Path: {}", path.display());
        }
        match item.file_size {
            Some(size) => println!(
                "    Size: {} / {}",
                format_bytes(item.downloaded_size),
                format_bytes(size)
            ),
            None => println!("    Downloaded: {}", format_bytes(item.downloaded_size)),
        }
        if item.is_active() {
            println!("    Speed: {}", format_speed(item.bytes_per_second));
            if let Some(eta) = item.eta_seconds() {
                println!("    ETA: {}", format_eta(eta));
            }
        }
        println!(
            "    Started: {}",
            item.started_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(completed) = item.completed_at {
            println!(
                "    Completed: {}",
                completed.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
            );
        }
        if let Some(ref error) = item.error_message {
            println!("    Error: {}", style(error).red());
        }
        println!();
    }
}

/// Print a flat list of downloads
pub fn print_items(items: &[DownloadItem], detailed: bool, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items)?);
        }
        OutputFormat::Table => {
            let rows: Vec<DownloadRow> = items.iter().map(DownloadRow::from).collect();
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if items.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for item in items {
                print_item_summary(item, detailed);
            }
            println!();
            println!("{} download(s) total", style(items.len()).bold());
        }
    }
    Ok(())
}

/// Print downloads grouped by day
pub fn print_groups(groups: &[DownloadGroup], detailed: bool, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(groups)?);
        }
        OutputFormat::Table | OutputFormat::Human => {
            if groups.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for group in groups {
                println!("{}", style(group.label).bold().underlined());
                match format {
                    OutputFormat::Table => {
                        let rows: Vec<DownloadRow> = group.items.iter().map(DownloadRow::from).collect();
                        println!("{}", Table::new(rows));
                    }
                    _ => {
                        for item in &group.items {
                            print_item_summary(item, detailed);
                        }
                    }
                }
                println!();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0), "-");
        assert_eq!(format_eta(42), "42s");
        assert_eq!(format_eta(125), "2m 5s");
        assert_eq!(format_eta(3725), "1h 2m 5s");
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short.txt", 30), "short.txt");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        assert_eq!(truncate("ééééééééé", 5), "éé...");
    }

    #[test]
    fn test_row_uses_short_id() {
        let item = DownloadItem::new("https://x/a.zip", "a.zip");
        let row = DownloadRow::from(&item);
        assert_eq!(row.id.len(), 8);
        assert!(item.id.to_string().starts_with(&row.id));
        assert_eq!(row.size, "?");
        assert_eq!(row.status, "downloading");
    }
}
