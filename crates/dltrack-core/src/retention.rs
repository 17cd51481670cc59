//! Retention rules for finished downloads

use chrono::{DateTime, Duration, Utc};
use dltrack_types::{DownloadItem, DownloadStatus, RetentionPolicy};

/// How long finished items survive under [`RetentionPolicy::AfterOneDay`]
pub fn retention_window() -> Duration {
    Duration::hours(24)
}

/// Whether `item` should be dropped when the policy runs at startup or on demand
pub fn is_expired(item: &DownloadItem, policy: RetentionPolicy, now: DateTime<Utc>) -> bool {
    match policy {
        RetentionPolicy::AfterOneDay => {
            item.status.is_terminal()
                && now.signed_duration_since(item.completed_at.unwrap_or(item.started_at))
                    > retention_window()
        }
        RetentionPolicy::UponSuccessfulDownload => item.status == DownloadStatus::Completed,
        RetentionPolicy::WhenAppQuits | RetentionPolicy::Manually => false,
    }
}

/// Whether `item` should be dropped when the registry shuts down
pub fn is_expired_on_shutdown(item: &DownloadItem, policy: RetentionPolicy) -> bool {
    match policy {
        RetentionPolicy::WhenAppQuits => item.status.is_terminal(),
        RetentionPolicy::UponSuccessfulDownload => item.status == DownloadStatus::Completed,
        RetentionPolicy::AfterOneDay | RetentionPolicy::Manually => false,
    }
}

/// Split out the expired items, keeping order. Returns the removed ones.
pub fn apply(
    items: &mut Vec<DownloadItem>,
    policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<DownloadItem> {
    let (expired, kept): (Vec<_>, Vec<_>) = items
        .drain(..)
        .partition(|item| is_expired(item, policy, now));
    *items = kept;
    expired
}

/// Drop the oldest items beyond `max`. Items are stored newest-first.
pub fn enforce_cap(items: &mut Vec<DownloadItem>, max: usize) -> Vec<DownloadItem> {
    if items.len() <= max {
        return Vec::new();
    }
    items.split_off(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(status: DownloadStatus, hours_ago: i64) -> DownloadItem {
        let now = Utc::now();
        let mut item = DownloadItem::new("https://x/f.bin", "f.bin");
        item.status = status;
        item.started_at = now - Duration::hours(hours_ago + 1);
        item.completed_at = Some(now - Duration::hours(hours_ago));
        item
    }

    #[test]
    fn test_after_one_day_boundary() {
        let now = Utc::now();
        let mut items = vec![
            finished(DownloadStatus::Completed, 23),
            finished(DownloadStatus::Completed, 25),
        ];
        let removed = apply(&mut items, RetentionPolicy::AfterOneDay, now);
        assert_eq!(removed.len(), 1);
        assert_eq!(items.len(), 1);
        assert!(now.signed_duration_since(items[0].completed_at.unwrap()) < Duration::hours(24));
    }

    #[test]
    fn test_after_one_day_falls_back_to_started_at() {
        let now = Utc::now();
        let mut item = DownloadItem::new("https://x/f.bin", "f.bin");
        item.status = DownloadStatus::Cancelled;
        item.started_at = now - Duration::hours(30);
        assert!(is_expired(&item, RetentionPolicy::AfterOneDay, now));
    }

    #[test]
    fn test_after_one_day_keeps_active_items() {
        let now = Utc::now();
        let mut item = DownloadItem::new("https://x/f.bin", "f.bin");
        item.started_at = now - Duration::hours(48);
        assert!(!is_expired(&item, RetentionPolicy::AfterOneDay, now));
    }

    #[test]
    fn test_upon_successful_download() {
        let now = Utc::now();
        let mut items = vec![
            finished(DownloadStatus::Completed, 0),
            finished(DownloadStatus::Failed, 0),
            DownloadItem::new("https://x/a", "a"),
        ];
        apply(&mut items, RetentionPolicy::UponSuccessfulDownload, now);
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.status != DownloadStatus::Completed));
    }

    #[test]
    fn test_manual_policies_keep_everything() {
        let now = Utc::now();
        for policy in [RetentionPolicy::WhenAppQuits, RetentionPolicy::Manually] {
            let mut items = vec![finished(DownloadStatus::Completed, 100)];
            assert!(apply(&mut items, policy, now).is_empty());
            assert_eq!(items.len(), 1);
        }
    }

    #[test]
    fn test_shutdown_pass() {
        let done = finished(DownloadStatus::Completed, 0);
        let active = DownloadItem::new("https://x/a", "a");
        assert!(is_expired_on_shutdown(&done, RetentionPolicy::WhenAppQuits));
        assert!(!is_expired_on_shutdown(&active, RetentionPolicy::WhenAppQuits));
        assert!(!is_expired_on_shutdown(&done, RetentionPolicy::Manually));
    }

    #[test]
    fn test_cap_drops_oldest() {
        let mut items: Vec<_> = (0..4)
            .map(|i| DownloadItem::new(format!("https://x/{}", i), format!("{}", i)))
            .collect();
        // newest-first: index 3 is the oldest
        let oldest = items[3].id;
        let removed = enforce_cap(&mut items, 3);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, oldest);
        assert_eq!(items.iter().map(|i| i.filename.as_str()).collect::<Vec<_>>(), ["0", "1", "2"]);
    }
}
