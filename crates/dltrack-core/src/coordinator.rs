//! The coordinator task and its handle
//!
//! All registry state lives on one task. [`RegistryHandle`] turns every
//! public operation into a [`Command`] and waits for the reply; transfer
//! sessions and completion jobs post their events on a second channel. Both
//! are drained by the same `select!` loop, so the item list is never touched
//! concurrently. After each step the loop commits: it persists the list if
//! it changed, broadcasts the queued events, then releases waiters.

use crate::error::{DownloadError, TransferError};
use crate::platform::{LocalFileSystem, ShellOpener, SystemShell};
use crate::query::{self, DownloadGroup};
use crate::registry::{Collaborators, DownloadRegistry};
use crate::session::{SessionEvent, TransferDelegate};
use crate::settings::{load_settings, save_settings, SettingsHandle};
use crate::storage::{KeyValueStore, SqliteStore, HISTORY_KEY};
use chrono::{Local, Utc};
use dltrack_types::{DownloadEvent, DownloadItem, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Database file created inside the data directory
pub const DATABASE_FILE: &str = "dltrack.db";

type Reply<T> = oneshot::Sender<T>;

/// Requests marshalled onto the coordinator
#[derive(Debug)]
enum Command {
    Track {
        url: String,
        filename: String,
        destination: Option<PathBuf>,
        expected_size: Option<u64>,
        reply: Reply<Uuid>,
    },
    Start {
        url: String,
        filename: String,
        reply: Reply<Result<Uuid, DownloadError>>,
    },
    Cancel {
        id: Uuid,
        reply: Reply<Result<(), DownloadError>>,
    },
    Remove {
        id: Uuid,
        reply: Reply<Result<(), DownloadError>>,
    },
    Retry {
        id: Uuid,
        reply: Reply<Result<Uuid, DownloadError>>,
    },
    ClearCompleted {
        reply: Reply<usize>,
    },
    ClearAll {
        reply: Reply<usize>,
    },
    UpdateProgress {
        id: Uuid,
        downloaded: u64,
        total: Option<u64>,
        at: Instant,
    },
    CompleteManaged {
        id: Uuid,
        reply: Reply<()>,
    },
    Complete {
        id: Uuid,
        temporary: PathBuf,
        reply: Reply<()>,
    },
    Fail {
        id: Uuid,
        error: TransferError,
        reply: Reply<()>,
    },
    ApplyRetention {
        reply: Reply<usize>,
    },
    Snapshot {
        reply: Reply<Vec<DownloadItem>>,
    },
    Get {
        id: Uuid,
        reply: Reply<Option<DownloadItem>>,
    },
    CompletedPath {
        id: Uuid,
        reply: Reply<Result<PathBuf, DownloadError>>,
    },
    UpdateSettings {
        settings: Settings,
        reply: Reply<Result<(), DownloadError>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Sends `value` on a reply channel once the step has been committed
type Deferred = Box<dyn FnOnce() + Send>;

fn deferred<T: Send + 'static>(reply: Reply<T>, value: T) -> Deferred {
    Box::new(move || {
        let _ = reply.send(value);
    })
}

/// Cloneable handle to a running download registry
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::UnboundedSender<Command>,
    event_tx: broadcast::Sender<DownloadEvent>,
    settings: SettingsHandle,
    shell: Arc<dyn ShellOpener>,
}

impl RegistryHandle {
    /// Open the SQLite store in `data_dir` and start a registry using the local
    /// filesystem and the system shell
    pub async fn open(
        data_dir: impl AsRef<Path>,
        transfer: Arc<dyn TransferDelegate>,
    ) -> Result<Self, DownloadError> {
        let db_path = data_dir.as_ref().join(DATABASE_FILE);
        let store = Arc::new(SqliteStore::open(&db_path).await?);
        let settings = load_settings(store.as_ref()).await;

        info!("Downloads directory: {}", settings.downloads_directory.display());
        let collaborators = Collaborators {
            fs: Arc::new(LocalFileSystem::new(settings.downloads_directory.clone())),
            shell: Arc::new(SystemShell),
            transfer,
            settings: SettingsHandle::new(settings),
        };

        Self::start(store, collaborators).await
    }

    /// Load history from `store`, reconcile it and spawn the coordinator
    pub async fn start(
        store: Arc<dyn KeyValueStore>,
        collaborators: Collaborators,
    ) -> Result<Self, DownloadError> {
        let items = load_history(store.as_ref()).await?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(1000);

        let settings = collaborators.settings.clone();
        let shell = Arc::clone(&collaborators.shell);

        let mut registry = DownloadRegistry::new(collaborators, session_tx);
        registry.restore(items, Utc::now());
        info!("Loaded {} download(s)", registry.items().len());

        let mut coordinator = Coordinator {
            registry,
            store,
            event_tx: event_tx.clone(),
        };
        coordinator.commit().await;
        tokio::spawn(coordinator.run(command_rx, session_rx));

        Ok(Self {
            commands: command_tx,
            event_tx,
            settings,
            shell,
        })
    }

    /// Subscribe to committed changes
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    /// Current settings
    pub fn settings(&self) -> Settings {
        self.settings.get()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, DownloadError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| DownloadError::Shutdown)?;
        rx.await.map_err(|_| DownloadError::Shutdown)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Register a transfer performed by an external engine
    pub async fn track_download(
        &self,
        url: &str,
        suggested_filename: &str,
        destination: Option<PathBuf>,
        expected_size: Option<u64>,
    ) -> Result<Uuid, DownloadError> {
        self.request(|reply| Command::Track {
            url: url.to_string(),
            filename: suggested_filename.to_string(),
            destination,
            expected_size,
            reply,
        })
        .await
    }

    /// Create a record and start transferring `url`
    pub async fn start_download(&self, url: &str, suggested_filename: &str) -> Result<Uuid, DownloadError> {
        self.request(|reply| Command::Start {
            url: url.to_string(),
            filename: suggested_filename.to_string(),
            reply,
        })
        .await?
    }

    pub async fn cancel_download(&self, id: Uuid) -> Result<(), DownloadError> {
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    pub async fn remove_download(&self, id: Uuid) -> Result<(), DownloadError> {
        self.request(|reply| Command::Remove { id, reply }).await?
    }

    /// Replace a failed or cancelled download with a fresh one. Returns the new id.
    pub async fn retry_download(&self, id: Uuid) -> Result<Uuid, DownloadError> {
        self.request(|reply| Command::Retry { id, reply }).await?
    }

    pub async fn clear_completed_downloads(&self) -> Result<usize, DownloadError> {
        self.request(|reply| Command::ClearCompleted { reply }).await
    }

    pub async fn clear_all_downloads(&self) -> Result<usize, DownloadError> {
        self.request(|reply| Command::ClearAll { reply }).await
    }

    /// Report progress for an externally managed download
    pub fn update_progress(&self, id: Uuid, downloaded: u64, total: Option<u64>) -> Result<(), DownloadError> {
        self.commands
            .send(Command::UpdateProgress {
                id,
                downloaded,
                total,
                at: Instant::now(),
            })
            .map_err(|_| DownloadError::Shutdown)
    }

    /// Mark an externally managed download as completed
    pub async fn complete_managed_download(&self, id: Uuid) -> Result<(), DownloadError> {
        self.request(|reply| Command::CompleteManaged { id, reply }).await
    }

    /// Finish a download whose bytes were written to `temporary`
    pub async fn complete_download(&self, id: Uuid, temporary: PathBuf) -> Result<(), DownloadError> {
        self.request(|reply| Command::Complete { id, temporary, reply })
            .await
    }

    pub async fn fail_download(&self, id: Uuid, error: TransferError) -> Result<(), DownloadError> {
        self.request(|reply| Command::Fail { id, error, reply }).await
    }

    /// Re-evaluate the retention policy. Returns how many records were removed.
    pub async fn apply_retention(&self) -> Result<usize, DownloadError> {
        self.request(|reply| Command::ApplyRetention { reply }).await
    }

    /// Persist new settings and apply them
    pub async fn update_settings(&self, settings: Settings) -> Result<(), DownloadError> {
        if settings.max_download_items == 0 {
            return Err(DownloadError::InvalidOperation(
                "maxDownloadItems must be at least 1".to_string(),
            ));
        }
        self.request(|reply| Command::UpdateSettings { settings, reply })
            .await?
    }

    /// Open a completed download with the system's default application
    pub async fn open_download(&self, id: Uuid) -> Result<(), DownloadError> {
        let path = self.completed_path(id).await?;
        let shell = Arc::clone(&self.shell);
        run_shell(move || shell.open(&path)).await
    }

    /// Show a completed download in the system file browser
    pub async fn reveal_download(&self, id: Uuid) -> Result<(), DownloadError> {
        let path = self.completed_path(id).await?;
        let shell = Arc::clone(&self.shell);
        run_shell(move || shell.reveal_in_file_browser(&path)).await
    }

    async fn completed_path(&self, id: Uuid) -> Result<PathBuf, DownloadError> {
        self.request(|reply| Command::CompletedPath { id, reply })
            .await?
    }

    /// Cancel active transfers, run the shutdown retention pass and stop the coordinator
    pub async fn shutdown(&self) -> Result<(), DownloadError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Every record, newest first
    pub async fn items(&self) -> Result<Vec<DownloadItem>, DownloadError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<DownloadItem>, DownloadError> {
        self.request(|reply| Command::Get { id, reply }).await
    }

    pub async fn today(&self) -> Result<Vec<DownloadItem>, DownloadError> {
        Ok(query::today(&self.items().await?, Local::now()))
    }

    pub async fn yesterday(&self) -> Result<Vec<DownloadItem>, DownloadError> {
        Ok(query::yesterday(&self.items().await?, Local::now()))
    }

    pub async fn older(&self) -> Result<Vec<DownloadItem>, DownloadError> {
        Ok(query::older(&self.items().await?, Local::now()))
    }

    pub async fn search(&self, query: &str) -> Result<Vec<DownloadItem>, DownloadError> {
        Ok(query::search(&self.items().await?, query))
    }

    pub async fn grouped_by_date(&self) -> Result<Vec<DownloadGroup>, DownloadError> {
        Ok(query::grouped_by_date(&self.items().await?, Local::now()))
    }
}

async fn run_shell<F>(f: F) -> Result<(), DownloadError>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DownloadError::InvalidOperation(e.to_string()))?
        .map_err(DownloadError::from)
}

/// Read the persisted item list. Unreadable history starts empty.
async fn load_history(store: &dyn KeyValueStore) -> Result<Vec<DownloadItem>, DownloadError> {
    let Some(json) = store.get(HISTORY_KEY).await? else {
        return Ok(Vec::new());
    };

    match serde_json::from_str(&json) {
        Ok(items) => Ok(items),
        Err(e) => {
            warn!("Download history is unreadable, starting empty: {}", e);
            Ok(Vec::new())
        }
    }
}

struct Coordinator {
    registry: DownloadRegistry,
    store: Arc<dyn KeyValueStore>,
    event_tx: broadcast::Sender<DownloadEvent>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("All registry handles dropped");
                        self.registry.shutdown();
                        self.commit().await;
                        break;
                    };

                    if let Command::Shutdown { reply } = command {
                        info!("Shutting down download registry");
                        self.registry.shutdown();
                        self.commit().await;
                        let _ = reply.send(());
                        break;
                    }

                    let done = self.handle_command(command).await;
                    self.commit().await;
                    if let Some(done) = done {
                        done();
                    }
                }
                Some(event) = session_events.recv() => {
                    self.registry.handle_session_event(event);
                    self.commit().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Option<Deferred> {
        let registry = &mut self.registry;
        let done = match command {
            Command::Track {
                url,
                filename,
                destination,
                expected_size,
                reply,
            } => deferred(
                reply,
                registry.track_download(&url, &filename, destination, expected_size),
            ),
            Command::Start { url, filename, reply } => {
                deferred(reply, registry.start_download(&url, &filename))
            }
            Command::Cancel { id, reply } => deferred(reply, registry.cancel_download(id)),
            Command::Remove { id, reply } => deferred(reply, registry.remove_download(id)),
            Command::Retry { id, reply } => deferred(reply, registry.retry_download(id)),
            Command::ClearCompleted { reply } => deferred(reply, registry.clear_completed()),
            Command::ClearAll { reply } => deferred(reply, registry.clear_all()),
            Command::UpdateProgress {
                id,
                downloaded,
                total,
                at,
            } => {
                registry.update_progress(id, downloaded, total, at);
                return None;
            }
            Command::CompleteManaged { id, reply } => {
                registry.complete_managed_download(id, Some(reply));
                return None;
            }
            Command::Complete { id, temporary, reply } => {
                registry.complete_download(id, temporary, Some(reply));
                return None;
            }
            Command::Fail { id, error, reply } => {
                registry.fail_download(id, error);
                deferred(reply, ())
            }
            Command::ApplyRetention { reply } => deferred(reply, registry.apply_retention(Utc::now())),
            Command::Snapshot { reply } => deferred(reply, registry.items().to_vec()),
            Command::Get { id, reply } => deferred(reply, registry.get(id).cloned()),
            Command::CompletedPath { id, reply } => deferred(reply, registry.completed_path(id)),
            Command::UpdateSettings { settings, reply } => {
                let result = self.update_settings(settings).await;
                deferred(reply, result)
            }
            Command::Shutdown { reply } => deferred(reply, ()),
        };
        Some(done)
    }

    async fn update_settings(&mut self, settings: Settings) -> Result<(), DownloadError> {
        save_settings(self.store.as_ref(), &settings).await?;
        self.registry.settings().replace(settings);
        self.registry.enforce_cap();
        Ok(())
    }

    /// Persist if needed, broadcast queued events, release completion waiters
    async fn commit(&mut self) {
        let changes = self.registry.take_changes();

        if changes.dirty {
            if let Err(e) = self.persist().await {
                warn!("Failed to persist download history: {}", e);
            }
        }

        for event in changes.events {
            // No subscribers is fine
            let _ = self.event_tx.send(event);
        }

        for waiter in changes.settled {
            let _ = waiter.send(());
        }
    }

    async fn persist(&self) -> Result<(), DownloadError> {
        let json = serde_json::to_string(self.registry.items())?;
        self.store.set(HISTORY_KEY, &json).await
    }
}
