//! Read-only views over the download list
//!
//! All functions are pure filters over a snapshot; they keep the
//! newest-first order of their input.

use chrono::{DateTime, Local, NaiveDate};
use dltrack_types::DownloadItem;
use serde::Serialize;

/// Calendar bucket of a download's start time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DateGroup {
    Today,
    Yesterday,
    Older,
}

impl DateGroup {
    pub fn label(self) -> &'static str {
        match self {
            DateGroup::Today => "Today",
            DateGroup::Yesterday => "Yesterday",
            DateGroup::Older => "Older",
        }
    }

    /// Bucket for a local date, relative to `today`
    pub fn for_date(date: NaiveDate, today: NaiveDate) -> Self {
        if date >= today {
            DateGroup::Today
        } else if today.pred_opt() == Some(date) {
            DateGroup::Yesterday
        } else {
            DateGroup::Older
        }
    }
}

/// A labelled, non-empty run of downloads
#[derive(Debug, Clone, Serialize)]
pub struct DownloadGroup {
    pub group: DateGroup,
    pub label: &'static str,
    pub items: Vec<DownloadItem>,
}

fn group_of(item: &DownloadItem, now: DateTime<Local>) -> DateGroup {
    let started = item.started_at.with_timezone(&Local).date_naive();
    DateGroup::for_date(started, now.date_naive())
}

fn in_group(items: &[DownloadItem], group: DateGroup, now: DateTime<Local>) -> Vec<DownloadItem> {
    items
        .iter()
        .filter(|item| group_of(item, now) == group)
        .cloned()
        .collect()
}

pub fn today(items: &[DownloadItem], now: DateTime<Local>) -> Vec<DownloadItem> {
    in_group(items, DateGroup::Today, now)
}

pub fn yesterday(items: &[DownloadItem], now: DateTime<Local>) -> Vec<DownloadItem> {
    in_group(items, DateGroup::Yesterday, now)
}

pub fn older(items: &[DownloadItem], now: DateTime<Local>) -> Vec<DownloadItem> {
    in_group(items, DateGroup::Older, now)
}

/// Case-insensitive substring match over filename and url
pub fn search(items: &[DownloadItem], query: &str) -> Vec<DownloadItem> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return items.to_vec();
    }

    items
        .iter()
        .filter(|item| {
            item.filename.to_lowercase().contains(&needle)
                || item.url.to_lowercase().contains(&needle)
        })
        .cloned()
        .collect()
}

/// Today, Yesterday, Older, skipping empty groups
pub fn grouped_by_date(items: &[DownloadItem], now: DateTime<Local>) -> Vec<DownloadGroup> {
    [DateGroup::Today, DateGroup::Yesterday, DateGroup::Older]
        .into_iter()
        .map(|group| DownloadGroup {
            group,
            label: group.label(),
            items: in_group(items, group, now),
        })
        .filter(|g| !g.items.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn started(name: &str, at: DateTime<Local>) -> DownloadItem {
        let mut item = DownloadItem::new(format!("https://example.com/{}", name), name);
        item.started_at = at.with_timezone(&Utc);
        item
    }

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    fn sample() -> Vec<DownloadItem> {
        let now = noon();
        vec![
            started("Report.PDF", now - Duration::hours(1)),
            started("photo.jpg", now - Duration::days(1)),
            started("old.zip", now - Duration::days(5)),
            started("notes.txt", now - Duration::hours(2)),
        ]
    }

    #[test]
    fn test_day_partitions() {
        let items = sample();
        let now = noon();
        let names = |v: Vec<DownloadItem>| v.into_iter().map(|i| i.filename).collect::<Vec<_>>();
        assert_eq!(names(today(&items, now)), ["Report.PDF", "notes.txt"]);
        assert_eq!(names(yesterday(&items, now)), ["photo.jpg"]);
        assert_eq!(names(older(&items, now)), ["old.zip"]);
    }

    #[test]
    fn test_search_is_case_insensitive_over_name_and_url() {
        let items = sample();
        assert_eq!(search(&items, "report").len(), 1);
        assert_eq!(search(&items, "EXAMPLE.COM").len(), 4);
        assert!(search(&items, "missing").is_empty());
        assert_eq!(search(&items, "  ").len(), 4);
    }

    #[test]
    fn test_grouped_skips_empty_groups() {
        let now = noon();
        let items = vec![
            started("a", now - Duration::days(3)),
            started("b", now),
        ];
        let groups = grouped_by_date(&items, now);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].label, "Today");
        assert_eq!(groups[1].label, "Older");
        assert_eq!(groups[1].items[0].filename, "a");
    }

    #[test]
    fn test_group_for_date() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(DateGroup::for_date(today, today), DateGroup::Today);
        assert_eq!(DateGroup::for_date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(), today), DateGroup::Yesterday);
        assert_eq!(DateGroup::for_date(NaiveDate::from_ymd_opt(2024, 2, 28).unwrap(), today), DateGroup::Older);
    }
}
