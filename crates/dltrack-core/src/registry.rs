//! Download registry - the ordered list of downloads and everything that mutates it
//!
//! The registry is plain single-owner state. It is driven exclusively by the
//! coordinator task (see [`crate::coordinator`]), which is what serializes
//! commands and session events without locks. Mutations queue
//! [`DownloadEvent`]s and mark the list dirty; the coordinator persists and
//! broadcasts once the command has been fully applied.

use crate::error::{DownloadError, TransferError};
use crate::path_resolver::{resolve_destination_excluding, sanitize_filename};
use crate::platform::{FileSystem, ShellOpener};
use crate::progress::{ProgressTracker, Sample};
use crate::retention;
use crate::session::{Completion, SessionEvent, TransferDelegate, TransferSession};
use crate::settings::SettingsHandle;
use crate::state;
use chrono::{DateTime, Utc};
use dltrack_types::{DownloadEvent, DownloadItem, DownloadStatus, RetentionPolicy};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Extensions considered safe to open automatically after download
pub const SAFE_EXTENSIONS: &[&str] = &[
    "pdf", "jpg", "jpeg", "png", "gif", "txt", "rtf", "mp3", "mp4", "mov", "zip",
];

/// Whether `filename` has an extension from [`SAFE_EXTENSIONS`]
pub fn is_safe_to_open(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| SAFE_EXTENSIONS.iter().any(|safe| safe.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Destinations picked by completions whose move has not finished yet
type Reservations = Arc<Mutex<HashSet<PathBuf>>>;

/// Filesystem work needed to finish a download
#[derive(Debug)]
enum CompletionJob {
    /// Self-managed: move the delegate's temp file into the downloads directory
    Move {
        temporary: PathBuf,
        filename: String,
        reserved: Reservations,
    },
    /// Externally managed: the file is already in place, just measure it
    Stat { path: Option<PathBuf> },
}

impl CompletionJob {
    fn run(self, fs: &dyn FileSystem) -> std::io::Result<Completion> {
        match self {
            CompletionJob::Move {
                temporary,
                filename,
                reserved,
            } => {
                let dir = fs.downloads_directory();
                let destination = {
                    let mut taken = reserved.lock();
                    let destination = resolve_destination_excluding(fs, &dir, &filename, &taken);
                    taken.insert(destination.clone());
                    destination
                };

                // Once moved, the file itself keeps the name taken
                let moved = fs
                    .move_file(&temporary, &destination)
                    .and_then(|_| fs.size_of(&destination));
                reserved.lock().remove(&destination);
                let size = moved?;

                Ok(Completion {
                    path: Some(destination),
                    size: Some(size),
                })
            }
            CompletionJob::Stat { path } => {
                let size = path.as_deref().and_then(|p| fs.size_of(p).ok());
                Ok(Completion { path: None, size })
            }
        }
    }
}

/// Everything the registry talks to
#[derive(Clone)]
pub struct Collaborators {
    pub fs: Arc<dyn FileSystem>,
    pub shell: Arc<dyn ShellOpener>,
    pub transfer: Arc<dyn TransferDelegate>,
    pub settings: SettingsHandle,
}

/// The download list, its sessions and the pending change set
pub(crate) struct DownloadRegistry {
    items: Vec<DownloadItem>,
    sessions: HashMap<Uuid, TransferSession>,
    finalizing: HashSet<Uuid>,
    reserved: Reservations,
    next_session: u64,
    collaborators: Collaborators,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    pending_events: Vec<DownloadEvent>,
    settled: Vec<oneshot::Sender<()>>,
    dirty: bool,
}

/// What a step changed, handed to the coordinator for commit
#[derive(Debug, Default)]
pub(crate) struct Changes {
    pub dirty: bool,
    pub events: Vec<DownloadEvent>,
    /// Completion waiters to release once the change is committed
    pub settled: Vec<oneshot::Sender<()>>,
}

impl DownloadRegistry {
    pub(crate) fn new(
        collaborators: Collaborators,
        session_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            items: Vec::new(),
            sessions: HashMap::new(),
            finalizing: HashSet::new(),
            reserved: Arc::default(),
            next_session: 0,
            collaborators,
            session_tx,
            pending_events: Vec::new(),
            settled: Vec::new(),
            dirty: false,
        }
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Install items loaded from storage: reconcile, apply retention, enforce the cap
    pub fn restore(&mut self, items: Vec<DownloadItem>, now: DateTime<Utc>) {
        self.items = items;

        let mut interrupted = 0;
        for item in &mut self.items {
            if state::reconcile_interrupted(item) {
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            info!("Marked {} interrupted download(s) as failed", interrupted);
            self.dirty = true;
        }

        self.apply_retention(now);
        self.pending_events.clear();
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn items(&self) -> &[DownloadItem] {
        &self.items
    }

    pub fn get(&self, id: Uuid) -> Option<&DownloadItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub(crate) fn settings(&self) -> &SettingsHandle {
        &self.collaborators.settings
    }

    fn downloading(&self, id: Uuid) -> Option<&DownloadItem> {
        self.get(id)
            .filter(|item| item.status == DownloadStatus::Downloading)
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut DownloadItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Register a transfer performed by someone else (no session is created)
    pub fn track_download(
        &mut self,
        url: &str,
        suggested_filename: &str,
        destination: Option<PathBuf>,
        expected_size: Option<u64>,
    ) -> Uuid {
        let mut item = DownloadItem::new(url, sanitize_filename(suggested_filename));
        item.local_path = destination;
        item.file_size = expected_size;
        let id = item.id;

        info!("Tracking external download {}: {}", id, item.filename);
        self.insert_front(item);
        id
    }

    /// Create a record and start a session for it
    pub fn start_download(&mut self, url: &str, suggested_filename: &str) -> Result<Uuid, DownloadError> {
        url::Url::parse(url).map_err(|_| DownloadError::InvalidUrl(url.to_string()))?;

        let item = DownloadItem::new(url, sanitize_filename(suggested_filename));
        let id = item.id;

        info!("Starting download {}: {}", id, item.filename);
        self.insert_front(item);
        // A zero cap drops the new item straight away
        if self.position(id).is_some() {
            self.spawn_session(id, url.to_string());
        }
        Ok(id)
    }

    pub fn cancel_download(&mut self, id: Uuid) -> Result<(), DownloadError> {
        let item = self.get_mut(id).ok_or(DownloadError::NotFound(id))?;
        let changed = state::cancel(item);
        self.teardown_session(id);

        if changed {
            info!("Cancelled download {}", id);
            self.status_changed(id);
        }
        Ok(())
    }

    /// Cancel if needed, then delete the record
    pub fn remove_download(&mut self, id: Uuid) -> Result<(), DownloadError> {
        self.cancel_download(id)?;
        if let Some(index) = self.position(id) {
            self.items.remove(index);
            self.finalizing.remove(&id);
            self.dirty = true;
            self.pending_events.push(DownloadEvent::Removed { id });
        }
        Ok(())
    }

    /// Replace a failed or cancelled record with a fresh download of the same URL
    pub fn retry_download(&mut self, id: Uuid) -> Result<Uuid, DownloadError> {
        let item = self.get(id).ok_or(DownloadError::NotFound(id))?;
        if !state::can_retry(item) {
            return Err(DownloadError::InvalidOperation(format!(
                "Cannot retry a download that is {}",
                item.status
            )));
        }
        let url = item.url.clone();
        let filename = item.filename.clone();
        // Externally tracked records may carry a URL we cannot fetch
        url::Url::parse(&url).map_err(|_| DownloadError::InvalidUrl(url.clone()))?;

        self.remove_download(id)?;
        let new_id = self.start_download(&url, &filename)?;
        info!("Retried download {} as {}", id, new_id);
        Ok(new_id)
    }

    /// Remove every completed record. Returns how many were removed.
    pub fn clear_completed(&mut self) -> usize {
        let removed: Vec<Uuid> = self
            .items
            .iter()
            .filter(|item| item.status == DownloadStatus::Completed)
            .map(|item| item.id)
            .collect();

        self.items.retain(|item| item.status != DownloadStatus::Completed);
        for id in &removed {
            self.pending_events.push(DownloadEvent::Removed { id: *id });
        }
        if !removed.is_empty() {
            self.dirty = true;
        }
        removed.len()
    }

    /// Cancel every session and drop every record. Returns how many were removed.
    pub fn clear_all(&mut self) -> usize {
        let ids: Vec<Uuid> = self.sessions.keys().copied().collect();
        for id in ids {
            self.teardown_session(id);
        }

        let count = self.items.len();
        self.items.clear();
        self.finalizing.clear();
        self.dirty = true;
        self.pending_events.push(DownloadEvent::Cleared);
        count
    }

    /// Offer a progress sample. Throttled samples change nothing.
    pub fn update_progress(&mut self, id: Uuid, downloaded: u64, total: Option<u64>, now: Instant) {
        let Some(item) = self.get_mut(id) else {
            return;
        };

        if ProgressTracker::apply(item, downloaded, total, now) == Sample::Accepted {
            let event = DownloadEvent::Progress {
                id,
                downloaded: item.downloaded_size,
                total: item.file_size,
                bytes_per_second: item.bytes_per_second,
            };
            self.pending_events.push(event);
        }
    }

    /// Finish an externally managed download. `reply` fires once the item is settled.
    pub fn complete_managed_download(&mut self, id: Uuid, reply: Option<oneshot::Sender<()>>) {
        let Some(path) = self.downloading(id).map(|item| item.local_path.clone()) else {
            debug!("Ignoring managed completion for {}", id);
            self.settle(reply);
            return;
        };
        self.begin_completion(id, CompletionJob::Stat { path }, reply);
    }

    /// Finish a self-managed download whose bytes are at `temporary`
    pub fn complete_download(
        &mut self,
        id: Uuid,
        temporary: PathBuf,
        reply: Option<oneshot::Sender<()>>,
    ) {
        let Some(filename) = self.downloading(id).map(|item| item.filename.clone()) else {
            debug!("Ignoring completion for {}", id);
            self.settle(reply);
            return;
        };
        let job = CompletionJob::Move {
            temporary,
            filename,
            reserved: Arc::clone(&self.reserved),
        };
        self.begin_completion(id, job, reply);
    }

    /// Record a transfer failure. Cancellations are not failures.
    pub fn fail_download(&mut self, id: Uuid, error: TransferError) {
        self.teardown_session(id);

        let Some(item) = self.get_mut(id) else {
            return;
        };

        let changed = if error.is_cancellation() {
            // Normally already handled by an explicit cancel
            state::cancel(item)
        } else {
            state::fail(item, error.to_string())
        };

        if changed {
            if item.status == DownloadStatus::Failed {
                warn!("Download {} failed: {}", id, error);
            }
            self.status_changed(id);
        }
    }

    /// Re-run the retention policy now. Returns how many records were removed.
    pub fn apply_retention(&mut self, now: DateTime<Utc>) -> usize {
        let settings = self.collaborators.settings.get();
        let mut removed = retention::apply(&mut self.items, settings.retention_policy, now);
        removed.extend(retention::enforce_cap(&mut self.items, settings.max_download_items));
        self.forget(&removed);
        removed.len()
    }

    /// Drop the oldest records beyond the configured cap
    pub fn enforce_cap(&mut self) -> usize {
        let max = self.collaborators.settings.get().max_download_items;
        let removed = retention::enforce_cap(&mut self.items, max);
        self.forget(&removed);
        removed.len()
    }

    /// Path of a completed download, for the shell commands
    pub fn completed_path(&self, id: Uuid) -> Result<PathBuf, DownloadError> {
        let item = self.get(id).ok_or(DownloadError::NotFound(id))?;
        match (&item.status, &item.local_path) {
            (DownloadStatus::Completed, Some(path)) => Ok(path.clone()),
            _ => Err(DownloadError::InvalidOperation(format!(
                "Download {} has no completed file",
                id
            ))),
        }
    }

    /// Cancel all sessions and run the shutdown retention pass
    pub fn shutdown(&mut self) {
        let ids: Vec<Uuid> = self.sessions.keys().copied().collect();
        for id in ids {
            let _ = self.cancel_download(id);
        }

        let policy = self.collaborators.settings.get().retention_policy;
        let before = self.items.len();
        self.items
            .retain(|item| !retention::is_expired_on_shutdown(item, policy));
        if self.items.len() != before {
            info!("Removed {} download(s) on shutdown", before - self.items.len());
            self.dirty = true;
        }
    }

    // ========================================================================
    // Session events
    // ========================================================================

    pub(crate) fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Progress {
                id,
                session,
                downloaded,
                total,
            } => {
                if self.is_current_session(id, session) {
                    self.update_progress(id, downloaded, total, Instant::now());
                }
            }
            SessionEvent::Finished {
                id,
                session,
                location,
            } => {
                if self.is_current_session(id, session) {
                    self.complete_download(id, location, None);
                } else {
                    debug!("Ignoring late completion from session {} for {}", session, id);
                }
            }
            SessionEvent::Failed { id, session, error } => {
                if self.is_current_session(id, session) {
                    self.fail_download(id, error);
                } else {
                    debug!("Ignoring late failure from session {} for {}: {}", session, id, error);
                }
            }
            SessionEvent::Finalized { id, outcome, reply } => {
                self.finish_completion(id, outcome, Utc::now());
                self.settle(reply);
            }
        }
    }

    fn is_current_session(&self, id: Uuid, session: u64) -> bool {
        self.sessions
            .get(&id)
            .map(|s| s.number == session)
            .unwrap_or(false)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Take the change set accumulated since the last call
    pub(crate) fn take_changes(&mut self) -> Changes {
        Changes {
            dirty: std::mem::take(&mut self.dirty),
            events: std::mem::take(&mut self.pending_events),
            settled: std::mem::take(&mut self.settled),
        }
    }

    fn settle(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.settled.extend(reply);
    }

    fn insert_front(&mut self, item: DownloadItem) {
        self.pending_events.push(DownloadEvent::Added { item: item.clone() });
        self.items.insert(0, item);
        self.dirty = true;
        self.enforce_cap();
    }

    fn forget(&mut self, removed: &[DownloadItem]) {
        for item in removed {
            self.teardown_session(item.id);
            self.finalizing.remove(&item.id);
            self.pending_events.push(DownloadEvent::Removed { id: item.id });
        }
        if !removed.is_empty() {
            self.dirty = true;
        }
    }

    fn spawn_session(&mut self, id: Uuid, url: String) {
        self.next_session += 1;
        let session = TransferSession::spawn(
            id,
            self.next_session,
            url,
            Arc::clone(&self.collaborators.transfer),
            self.session_tx.downgrade(),
        );
        if let Some(mut previous) = self.sessions.insert(id, session) {
            previous.teardown();
        }
    }

    fn teardown_session(&mut self, id: Uuid) {
        if let Some(mut session) = self.sessions.remove(&id) {
            session.teardown();
        }
    }

    fn status_changed(&mut self, id: Uuid) {
        if let Some(item) = self.get(id) {
            self.pending_events.push(DownloadEvent::StatusChanged {
                id,
                status: item.status,
                error: item.error_message.clone(),
            });
        }
        self.dirty = true;
    }

    /// Run the filesystem part of a completion on the blocking pool
    fn begin_completion(&mut self, id: Uuid, job: CompletionJob, reply: Option<oneshot::Sender<()>>) {
        if !self.finalizing.insert(id) {
            debug!("Completion for {} already in progress", id);
            self.settle(reply);
            return;
        }

        let fs = Arc::clone(&self.collaborators.fs);
        let events = self.session_tx.downgrade();
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || job.run(fs.as_ref()))
                .await
                .unwrap_or_else(|e| Err(std::io::Error::other(e.to_string())));

            if let Some(tx) = events.upgrade() {
                let _ = tx.send(SessionEvent::Finalized { id, outcome, reply });
            }
        });
    }

    fn finish_completion(&mut self, id: Uuid, outcome: std::io::Result<Completion>, now: DateTime<Utc>) {
        if !self.finalizing.remove(&id) {
            debug!("Dropping completion result for removed download {}", id);
            return;
        }
        self.teardown_session(id);

        let Some(item) = self.get_mut(id) else {
            return;
        };

        match outcome {
            Ok(completion) => {
                let moved_to = completion.path.clone();
                if !state::complete(item, completion.path, completion.size, now) {
                    // Keep a reference to the moved file so it can still be found
                    if let Some(path) = moved_to.filter(|_| item.local_path.is_none()) {
                        warn!(
                            "Download {} was {} before its file was moved to {}",
                            id,
                            item.status,
                            path.display()
                        );
                        item.local_path = Some(path);
                        let item = item.clone();
                        self.pending_events.push(DownloadEvent::Updated { item });
                        self.dirty = true;
                    }
                    return;
                }
                info!("Download {} completed: {}", id, item.filename);
                let item = item.clone();
                self.status_changed(id);
                self.pending_events.push(DownloadEvent::Updated { item: item.clone() });
                self.after_completed(&item);
            }
            Err(e) => {
                if state::fail(item, e.to_string()) {
                    warn!("Download {} could not be finalized: {}", id, e);
                    self.status_changed(id);
                }
            }
        }
    }

    fn after_completed(&mut self, item: &DownloadItem) {
        let settings = self.collaborators.settings.get();

        if settings.open_safe_files_after_download && is_safe_to_open(&item.filename) {
            if let Some(path) = item.local_path.clone() {
                let shell = Arc::clone(&self.collaborators.shell);
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = shell.open(&path) {
                        debug!("Auto-open of {} failed: {}", path.display(), e);
                    }
                });
            }
        }

        if settings.retention_policy == RetentionPolicy::UponSuccessfulDownload {
            if let Some(index) = self.position(item.id) {
                self.items.remove(index);
                self.pending_events.push(DownloadEvent::Removed { id: item.id });
                self.dirty = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::LocalFileSystem;
    use crate::session::ProgressSink;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use dltrack_types::Settings;
    use tokio_util::sync::CancellationToken;

    struct Stalled;

    #[async_trait]
    impl TransferDelegate for Stalled {
        async fn fetch(
            &self,
            _url: &str,
            _progress: ProgressSink,
            cancel: CancellationToken,
        ) -> Result<PathBuf, TransferError> {
            cancel.cancelled().await;
            Err(TransferError::Cancelled)
        }
    }

    struct NoShell;

    impl ShellOpener for NoShell {
        fn open(&self, _path: &Path) -> std::io::Result<()> {
            Ok(())
        }

        fn reveal_in_file_browser(&self, _path: &Path) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Local filesystem whose moves wait until `n` of them are in flight
    struct LockstepFs {
        inner: LocalFileSystem,
        barrier: std::sync::Barrier,
    }

    impl FileSystem for LockstepFs {
        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn move_file(&self, from: &Path, to: &Path) -> std::io::Result<()> {
            self.barrier.wait();
            self.inner.move_file(from, to)
        }

        fn size_of(&self, path: &Path) -> std::io::Result<u64> {
            self.inner.size_of(path)
        }

        fn downloads_directory(&self) -> PathBuf {
            self.inner.downloads_directory()
        }
    }

    fn registry(
        dir: &Path,
        settings: Settings,
    ) -> (DownloadRegistry, mpsc::UnboundedReceiver<SessionEvent>) {
        registry_with_fs(Arc::new(LocalFileSystem::new(dir)), settings)
    }

    fn registry_with_fs(
        fs: Arc<dyn FileSystem>,
        settings: Settings,
    ) -> (DownloadRegistry, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let collaborators = Collaborators {
            fs,
            shell: Arc::new(NoShell),
            transfer: Arc::new(Stalled),
            settings: SettingsHandle::new(settings),
        };
        (DownloadRegistry::new(collaborators, tx), rx)
    }

    async fn next_finalized(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        loop {
            match rx.recv().await {
                Some(event @ SessionEvent::Finalized { .. }) => return event,
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }
    }

    fn manual() -> Settings {
        Settings {
            retention_policy: RetentionPolicy::Manually,
            ..Settings::default()
        }
    }

    #[test]
    fn test_safe_extensions() {
        assert!(is_safe_to_open("report.pdf"));
        assert!(is_safe_to_open("IMAGE.JPEG"));
        assert!(is_safe_to_open("archive.tar.zip"));
        assert!(!is_safe_to_open("setup.exe"));
        assert!(!is_safe_to_open("README"));
        assert!(!is_safe_to_open("pdf"));
    }

    #[tokio::test]
    async fn test_restore_reconciles_then_applies_retention() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, _rx) = registry(dir.path(), Settings::default());

        let active = DownloadItem::new("https://x/a", "a");
        let mut old = DownloadItem::new("https://x/b", "b");
        old.status = DownloadStatus::Completed;
        old.completed_at = Some(Utc::now() - ChronoDuration::days(3));

        registry.restore(vec![active.clone(), old], Utc::now());

        assert_eq!(registry.items().len(), 1);
        let item = registry.get(active.id).unwrap();
        assert_eq!(item.status, DownloadStatus::Failed);
        assert_eq!(item.error_message.as_deref(), Some(state::INTERRUPTED_MESSAGE));

        let changes = registry.take_changes();
        assert!(changes.dirty);
        assert!(changes.events.is_empty());
    }

    #[tokio::test]
    async fn test_start_then_cancel_tears_down_session() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, _rx) = registry(dir.path(), manual());

        let first = registry.start_download("https://x/1.zip", "1.zip").unwrap();
        let second = registry.start_download("https://x/2.zip", "../2.zip").unwrap();
        assert_eq!(registry.items()[0].id, second);
        assert_eq!(registry.items()[0].filename, "2.zip");
        assert_eq!(registry.sessions.len(), 2);

        registry.cancel_download(first).unwrap();
        assert_eq!(registry.get(first).unwrap().status, DownloadStatus::Cancelled);
        assert!(!registry.sessions.contains_key(&first));

        let changes = registry.take_changes();
        assert!(changes.dirty);
        assert_eq!(changes.events.len(), 3);
        assert!(matches!(
            changes.events[2],
            DownloadEvent::StatusChanged { status: DownloadStatus::Cancelled, .. }
        ));
    }

    #[tokio::test]
    async fn test_events_from_stale_sessions_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, _rx) = registry(dir.path(), manual());

        let id = registry.start_download("https://x/a", "a").unwrap();
        let session = registry.sessions[&id].number;

        registry.handle_session_event(SessionEvent::Progress {
            id,
            session: session + 1,
            downloaded: 10,
            total: Some(20),
        });
        assert_eq!(registry.get(id).unwrap().downloaded_size, 0);

        registry.handle_session_event(SessionEvent::Progress {
            id,
            session,
            downloaded: 10,
            total: Some(20),
        });
        assert_eq!(registry.get(id).unwrap().downloaded_size, 10);

        registry.cancel_download(id).unwrap();
        registry.handle_session_event(SessionEvent::Failed {
            id,
            session,
            error: TransferError::Network("late".into()),
        });
        let item = registry.get(id).unwrap();
        assert_eq!(item.status, DownloadStatus::Cancelled);
        assert_eq!(item.error_message, None);
    }

    #[tokio::test]
    async fn test_cancellation_error_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, _rx) = registry(dir.path(), manual());

        let id = registry.start_download("https://x/a", "a").unwrap();
        registry.fail_download(id, TransferError::Cancelled);

        let item = registry.get(id).unwrap();
        assert_eq!(item.status, DownloadStatus::Cancelled);
        assert_eq!(item.error_message, None);
    }

    #[tokio::test]
    async fn test_completion_runs_off_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, mut rx) = registry(dir.path(), manual());

        let id = registry.start_download("https://x/a.bin", "a.bin").unwrap();
        let temp = dir.path().join("a.part");
        std::fs::write(&temp, [0u8; 32]).unwrap();

        let (reply, done) = oneshot::channel();
        registry.complete_download(id, temp, Some(reply));
        // A second completion while the first is in flight is dropped
        registry.complete_download(id, dir.path().join("other.part"), None);
        assert_eq!(registry.get(id).unwrap().status, DownloadStatus::Downloading);

        let event = next_finalized(&mut rx).await;
        registry.handle_session_event(event);

        let item = registry.get(id).unwrap();
        assert_eq!(item.status, DownloadStatus::Completed);
        assert_eq!(item.file_size, Some(32));
        assert_eq!(item.local_path, Some(dir.path().join("a.bin")));
        assert!(registry.sessions.is_empty());

        let changes = registry.take_changes();
        assert_eq!(changes.settled.len(), 1);
        for waiter in changes.settled {
            waiter.send(()).unwrap();
        }
        done.await.unwrap();
    }

    #[tokio::test]
    async fn test_cap_tears_down_evicted_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            max_download_items: 1,
            ..manual()
        };
        let (mut registry, _rx) = registry(dir.path(), settings);

        let first = registry.start_download("https://x/1", "1").unwrap();
        let second = registry.start_download("https://x/2", "2").unwrap();

        assert!(registry.get(first).is_none());
        assert_eq!(registry.sessions.len(), 1);
        assert!(registry.sessions.contains_key(&second));
    }

    #[tokio::test]
    async fn test_clear_completed_keeps_everything_else() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, _rx) = registry(dir.path(), manual());

        let mut items = Vec::new();
        for status in [
            DownloadStatus::Completed,
            DownloadStatus::Failed,
            DownloadStatus::Cancelled,
            DownloadStatus::Completed,
        ] {
            let mut item = DownloadItem::new("https://x/f", "f");
            item.status = status;
            items.push(item);
        }
        registry.restore(items, Utc::now());
        registry.take_changes();

        assert_eq!(registry.clear_completed(), 2);
        assert_eq!(registry.items().len(), 2);
        assert_eq!(registry.take_changes().events.len(), 2);

        assert_eq!(registry.clear_completed(), 0);
        assert!(!registry.take_changes().dirty);
    }

    #[tokio::test]
    async fn test_retry_only_from_failed_or_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, _rx) = registry(dir.path(), manual());

        let mut done = DownloadItem::new("https://x/f", "f");
        done.status = DownloadStatus::Completed;
        let mut cancelled = DownloadItem::new("https://x/g", "g");
        cancelled.status = DownloadStatus::Cancelled;
        registry.restore(vec![done.clone(), cancelled.clone()], Utc::now());

        assert!(matches!(
            registry.retry_download(done.id),
            Err(DownloadError::InvalidOperation(_))
        ));

        let new_id = registry.retry_download(cancelled.id).unwrap();
        assert!(registry.get(cancelled.id).is_none());
        assert_eq!(registry.items()[0].id, new_id);
        assert_eq!(registry.items()[0].filename, "g");
        assert!(registry.sessions.contains_key(&new_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_same_name_completions_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(LockstepFs {
            inner: LocalFileSystem::new(dir.path()),
            barrier: std::sync::Barrier::new(2),
        });
        let (mut registry, mut rx) = registry_with_fs(fs, manual());

        let first = registry.start_download("https://x/file.zip", "file.zip").unwrap();
        let second = registry.start_download("https://y/file.zip", "file.zip").unwrap();
        let first_temp = dir.path().join("first.part");
        let second_temp = dir.path().join("second.part");
        std::fs::write(&first_temp, [1u8; 4]).unwrap();
        std::fs::write(&second_temp, [2u8; 8]).unwrap();

        // Both moves are in flight together before either lands
        registry.complete_download(first, first_temp, None);
        registry.complete_download(second, second_temp, None);
        for _ in 0..2 {
            let event = next_finalized(&mut rx).await;
            registry.handle_session_event(event);
        }

        let a = registry.get(first).unwrap().clone();
        let b = registry.get(second).unwrap().clone();
        assert_eq!(a.status, DownloadStatus::Completed);
        assert_eq!(b.status, DownloadStatus::Completed);

        let a_path = a.local_path.unwrap();
        let b_path = b.local_path.unwrap();
        assert_ne!(a_path, b_path);
        assert_eq!(std::fs::read(&a_path).unwrap(), vec![1u8; 4]);
        assert_eq!(std::fs::read(&b_path).unwrap(), vec![2u8; 8]);

        let mut names = vec![a.filename, b.filename];
        names.sort();
        assert_eq!(names, vec!["file (1).zip", "file.zip"]);
        assert!(registry.reserved.lock().is_empty());
    }

    #[tokio::test]
    async fn test_retry_with_unusable_url_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, _rx) = registry(dir.path(), manual());

        let id = registry.track_download("downloads/photo.png", "photo.png", None, None);
        registry.fail_download(id, TransferError::Network("reset".into()));
        registry.take_changes();

        assert!(matches!(
            registry.retry_download(id),
            Err(DownloadError::InvalidUrl(_))
        ));
        assert_eq!(registry.items().len(), 1);
        assert_eq!(registry.get(id).unwrap().status, DownloadStatus::Failed);
        assert!(registry.sessions.is_empty());

        let changes = registry.take_changes();
        assert!(!changes.dirty);
        assert!(changes.events.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_move_keeps_file_reference() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, mut rx) = registry(dir.path(), manual());

        let id = registry.start_download("https://x/a.bin", "a.bin").unwrap();
        let temp = dir.path().join("a.part");
        std::fs::write(&temp, [0u8; 16]).unwrap();

        registry.complete_download(id, temp, None);
        registry.cancel_download(id).unwrap();
        registry.take_changes();

        let event = next_finalized(&mut rx).await;
        registry.handle_session_event(event);

        let item = registry.get(id).unwrap();
        assert_eq!(item.status, DownloadStatus::Cancelled);
        assert_eq!(item.completed_at, None);
        assert_eq!(item.local_path, Some(dir.path().join("a.bin")));
        assert!(dir.path().join("a.bin").exists());

        let changes = registry.take_changes();
        assert!(changes.dirty);
        assert!(matches!(changes.events[..], [DownloadEvent::Updated { .. }]));
    }
}
