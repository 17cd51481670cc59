//! CLI command implementations

use crate::output::{format_bytes, print_groups, print_item_summary, print_items};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, Day, OutputFormat};
use anyhow::{anyhow, bail, Result};
use console::style;
use dltrack_core::{DownloadError, RegistryHandle};
use dltrack_types::{DownloadEvent, DownloadItem, DownloadStatus, RetentionPolicy, Settings};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// Helpers
// ============================================================================

/// Resolve a full download id or a unique prefix of one
async fn resolve_id(registry: &RegistryHandle, id: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }
    let items = registry.items().await?;
    match_prefix(&items, id)
}

fn match_prefix(items: &[DownloadItem], prefix: &str) -> Result<Uuid> {
    let prefix = prefix.trim().to_lowercase();
    if prefix.is_empty() {
        bail!("Download ID must not be empty");
    }

    let mut matches = items
        .iter()
        .filter(|item| item.id.to_string().starts_with(&prefix));

    match (matches.next(), matches.next()) {
        (Some(item), None) => Ok(item.id),
        (None, _) => Err(anyhow!("No download matches '{}'", prefix)),
        (Some(_), Some(_)) => Err(anyhow!("'{}' matches more than one download", prefix)),
    }
}

/// Last URL path segment, used when no name is given
fn filename_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

/// Show progress for `id` until it settles. Ctrl-C cancels it.
async fn follow(
    registry: &RegistryHandle,
    id: Uuid,
    mut events: broadcast::Receiver<DownloadEvent>,
    format: OutputFormat,
) -> Result<Option<DownloadItem>> {
    let mut progress = DownloadProgress::new();
    let show_bars = matches!(format, OutputFormat::Human | OutputFormat::Table);
    let mut last_seen = None;

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                registry.cancel_download(id).await?;
                continue;
            }
            event = events.recv() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Progress display skipped {} event(s)", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                progress.clear();
                break;
            }
        };

        match &event {
            DownloadEvent::Added { item } | DownloadEvent::Updated { item } if item.id == id => {
                if show_bars && matches!(event, DownloadEvent::Added { .. }) {
                    progress.add_download(item);
                }
                last_seen = Some(item.clone());
            }
            _ => {}
        }

        if show_bars {
            progress.handle_event(&event);
        }

        if let DownloadEvent::StatusChanged { id: changed, status, .. } = &event {
            if *changed == id && status.is_terminal() {
                break;
            }
        }
    }

    // The record may already be gone if retention removed it on completion
    Ok(registry.get(id).await?.or(last_seen))
}

fn report_outcome(item: Option<DownloadItem>, format: OutputFormat) -> Result<()> {
    let Some(item) = item else {
        bail!("Download disappeared before it settled");
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            if item.status == DownloadStatus::Completed {
                let path = item
                    .local_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                println!(
                    "{} Saved {} ({})",
                    style("✓").green().bold(),
                    style(path).cyan(),
                    format_bytes(item.file_size.unwrap_or(item.downloaded_size))
                );
            }
        }
    }

    match item.status {
        DownloadStatus::Completed => Ok(()),
        DownloadStatus::Cancelled => bail!("Download cancelled"),
        _ => bail!(
            "Download failed: {}",
            item.error_message.as_deref().unwrap_or("Unknown error")
        ),
    }
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn get(
    registry: &RegistryHandle,
    url: &str,
    name: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let filename = name.unwrap_or_else(|| filename_from_url(url));

    let events = registry.subscribe();
    let id = registry.start_download(url, &filename).await?;

    if let OutputFormat::Human = format {
        println!(
            "{} Downloading {}",
            style("↓").cyan().bold(),
            style(&filename).cyan()
        );
        println!("  ID: {}", id);
    }

    let item = follow(registry, id, events, format).await?;
    report_outcome(item, format)
}

pub async fn retry(registry: &RegistryHandle, id: &str, format: OutputFormat) -> Result<()> {
    let uuid = resolve_id(registry, id).await?;

    let events = registry.subscribe();
    let new_id = registry.retry_download(uuid).await?;

    if let OutputFormat::Human = format {
        println!("{} Retrying as {}", style("↻").cyan().bold(), new_id);
    }

    let item = follow(registry, new_id, events, format).await?;
    report_outcome(item, format)
}

pub async fn list_downloads(
    registry: &RegistryHandle,
    day: Option<Day>,
    grouped: bool,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    if grouped {
        let groups = registry.grouped_by_date().await?;
        return print_groups(&groups, show_all, format);
    }

    let items = match day {
        Some(Day::Today) => registry.today().await?,
        Some(Day::Yesterday) => registry.yesterday().await?,
        Some(Day::Older) => registry.older().await?,
        None => registry.items().await?,
    };
    print_items(&items, show_all, format)
}

pub async fn search(registry: &RegistryHandle, query: &str, format: OutputFormat) -> Result<()> {
    let items = registry.search(query).await?;
    print_items(&items, false, format)
}

pub async fn show_info(registry: &RegistryHandle, id: &str, format: OutputFormat) -> Result<()> {
    let uuid = resolve_id(registry, id).await?;
    let item = registry
        .get(uuid)
        .await?
        .ok_or(DownloadError::NotFound(uuid))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        _ => {
            print_item_summary(&item, true);
        }
    }

    Ok(())
}

pub async fn remove(registry: &RegistryHandle, id: &str, _format: OutputFormat) -> Result<()> {
    let uuid = resolve_id(registry, id).await?;
    registry.remove_download(uuid).await?;
    println!("{} Download removed", style("✓").green().bold());
    Ok(())
}

pub async fn clear(
    registry: &RegistryHandle,
    completed_only: bool,
    yes: bool,
    format: OutputFormat,
) -> Result<()> {
    if !yes {
        use dialoguer::Confirm;

        let prompt = if completed_only {
            "Remove all completed downloads from the history?"
        } else {
            "Remove every download from the history?"
        };
        let confirmed = Confirm::new().with_prompt(prompt).default(false).interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    let removed = if completed_only {
        registry.clear_completed_downloads().await?
    } else {
        registry.clear_all_downloads().await?
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "removed": removed })),
        _ => println!("{} Removed {} download(s)", style("✓").green().bold(), removed),
    }
    Ok(())
}

pub async fn open(registry: &RegistryHandle, id: &str, reveal: bool) -> Result<()> {
    let uuid = resolve_id(registry, id).await?;
    if reveal {
        registry.reveal_download(uuid).await?;
    } else {
        registry.open_download(uuid).await?;
    }
    Ok(())
}

pub async fn prune(registry: &RegistryHandle, format: OutputFormat) -> Result<()> {
    let removed = registry.apply_retention().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "removed": removed })),
        _ => println!("{} Pruned {} download(s)", style("✓").green().bold(), removed),
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

fn retention_label(policy: RetentionPolicy) -> &'static str {
    match policy {
        RetentionPolicy::AfterOneDay => "after-one-day",
        RetentionPolicy::UponSuccessfulDownload => "upon-successful-download",
        RetentionPolicy::WhenAppQuits => "when-app-quits",
        RetentionPolicy::Manually => "manually",
    }
}

fn get_setting(settings: &Settings, key: &str) -> Result<String> {
    let value = match key {
        "open_safe_files_after_download" => settings.open_safe_files_after_download.to_string(),
        "retention_policy" => retention_label(settings.retention_policy).to_string(),
        "max_download_items" => settings.max_download_items.to_string(),
        "downloads_directory" => settings.downloads_directory.display().to_string(),
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    };
    Ok(value)
}

fn set_setting(settings: &mut Settings, key: &str, value: &str) -> Result<()> {
    match key {
        "open_safe_files_after_download" => settings.open_safe_files_after_download = value.parse()?,
        "retention_policy" => settings.retention_policy = value.parse().map_err(|e: String| anyhow!(e))?,
        "max_download_items" => settings.max_download_items = value.parse()?,
        "downloads_directory" => settings.downloads_directory = PathBuf::from(value),
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    }
    Ok(())
}

pub async fn config_action(
    registry: &RegistryHandle,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = registry.settings();

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("dltrack Configuration:");
                    println!();
                    println!(
                        "  Downloads directory: {}",
                        settings.downloads_directory.display()
                    );
                    println!(
                        "  Retention policy: {}",
                        retention_label(settings.retention_policy)
                    );
                    println!("  Max download items: {}", settings.max_download_items);
                    println!(
                        "  Open safe files after download: {}",
                        settings.open_safe_files_after_download
                    );
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            println!("{}", get_setting(&registry.settings(), &key)?);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = registry.settings();
            set_setting(&mut settings, &key, &value)?;
            registry.update_settings(settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset) => {
            use dialoguer::Confirm;

            let confirmed = Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                registry.update_settings(Settings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
