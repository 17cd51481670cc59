//! Transfer sessions
//!
//! A session owns one running transfer: the task driving the delegate and
//! the token used to cancel it. The registry owns every session; a session
//! only holds a weak sender back to the coordinator for posting events, so
//! nothing a transfer does can keep the coordinator alive.

use crate::error::TransferError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Performs the actual byte transfer for a URL.
///
/// Implementations report progress through the sink, return the location of
/// the fully written temporary file on success, and should stop promptly
/// with [`TransferError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait TransferDelegate: Send + Sync + 'static {
    async fn fetch(
        &self,
        url: &str,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<PathBuf, TransferError>;
}

/// Events posted from sessions (and completion jobs) to the coordinator
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Progress {
        id: Uuid,
        session: u64,
        downloaded: u64,
        total: Option<u64>,
    },
    Finished {
        id: Uuid,
        session: u64,
        location: PathBuf,
    },
    Failed {
        id: Uuid,
        session: u64,
        error: TransferError,
    },
    /// Off-coordinator completion work is done
    Finalized {
        id: Uuid,
        outcome: std::io::Result<Completion>,
        reply: Option<tokio::sync::oneshot::Sender<()>>,
    },
}

/// What the filesystem said about a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Completion {
    pub path: Option<PathBuf>,
    pub size: Option<u64>,
}

/// Progress channel handed to a [`TransferDelegate`]
#[derive(Debug, Clone)]
pub struct ProgressSink {
    id: Uuid,
    session: u64,
    events: mpsc::WeakUnboundedSender<SessionEvent>,
}

impl ProgressSink {
    pub(crate) fn new(id: Uuid, session: u64, events: mpsc::WeakUnboundedSender<SessionEvent>) -> Self {
        Self { id, session, events }
    }

    /// The download this transfer belongs to
    pub fn download_id(&self) -> Uuid {
        self.id
    }

    /// Report the bytes written so far and the expected total, if known
    pub fn report(&self, bytes_written: u64, total_expected: Option<u64>) {
        self.post(SessionEvent::Progress {
            id: self.id,
            session: self.session,
            downloaded: bytes_written,
            total: total_expected,
        });
    }

    fn finish(&self, outcome: Result<PathBuf, TransferError>) {
        let event = match outcome {
            Ok(location) => SessionEvent::Finished {
                id: self.id,
                session: self.session,
                location,
            },
            Err(error) => SessionEvent::Failed {
                id: self.id,
                session: self.session,
                error,
            },
        };
        self.post(event);
    }

    fn post(&self, event: SessionEvent) {
        match self.events.upgrade() {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => debug!("Coordinator gone, dropping event for {}", self.id),
        }
    }
}

/// One running transfer
#[derive(Debug)]
pub(crate) struct TransferSession {
    pub id: Uuid,
    pub number: u64,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TransferSession {
    /// Spawn the delegate for `url` and wrap it in a session
    pub fn spawn(
        id: Uuid,
        number: u64,
        url: String,
        delegate: Arc<dyn TransferDelegate>,
        events: mpsc::WeakUnboundedSender<SessionEvent>,
    ) -> Self {
        let token = CancellationToken::new();
        let sink = ProgressSink::new(id, number, events);
        let task_token = token.clone();

        let task = tokio::spawn(async move {
            let outcome = delegate.fetch(&url, sink.clone(), task_token).await;
            sink.finish(outcome);
        });

        Self {
            id,
            number,
            token,
            task: Some(task),
        }
    }

    /// Cancel the transfer and release the task. Returns false if already torn down.
    pub fn teardown(&mut self) -> bool {
        match self.task.take() {
            Some(_task) => {
                self.token.cancel();
                debug!("Tore down session {} for download {}", self.number, self.id);
                true
            }
            None => false,
        }
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct WaitForCancel;

    #[async_trait]
    impl TransferDelegate for WaitForCancel {
        async fn fetch(
            &self,
            _url: &str,
            progress: ProgressSink,
            cancel: CancellationToken,
        ) -> Result<PathBuf, TransferError> {
            progress.report(10, Some(100));
            cancel.cancelled().await;
            Err(TransferError::Cancelled)
        }
    }

    struct Immediate;

    #[async_trait]
    impl TransferDelegate for Immediate {
        async fn fetch(
            &self,
            _url: &str,
            _progress: ProgressSink,
            _cancel: CancellationToken,
        ) -> Result<PathBuf, TransferError> {
            Ok(PathBuf::from("/tmp/done.part"))
        }
    }

    #[tokio::test]
    async fn test_events_carry_session_number() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let _session = TransferSession::spawn(id, 7, "https://x/f".into(), Arc::new(Immediate), tx.downgrade());

        match rx.recv().await {
            Some(SessionEvent::Finished { id: got, session, location }) => {
                assert_eq!(got, id);
                assert_eq!(session, 7);
                assert_eq!(location, PathBuf::from("/tmp/done.part"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_teardown_cancels_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session =
            TransferSession::spawn(Uuid::new_v4(), 1, "https://x/f".into(), Arc::new(WaitForCancel), tx.downgrade());

        assert!(matches!(rx.recv().await, Some(SessionEvent::Progress { downloaded: 10, .. })));
        assert!(session.teardown());
        assert!(!session.teardown());

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(
            event,
            Some(SessionEvent::Failed { error: TransferError::Cancelled, .. })
        ));
    }

    #[tokio::test]
    async fn test_sink_is_silent_once_coordinator_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel::<SessionEvent>();
        let sink = ProgressSink::new(Uuid::new_v4(), 1, tx.downgrade());
        drop(rx);
        drop(tx);
        // Must not panic
        sink.report(1, None);
    }
}
