//! HTTP transfer delegate backed by reqwest

use async_trait::async_trait;
use dltrack_core::{ProgressSink, TransferDelegate, TransferError};
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Streams a URL into `<temp dir>/<download id>.part`
pub struct HttpTransfer {
    client: Client,
    temp_dir: PathBuf,
}

impl HttpTransfer {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("dltrack/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            temp_dir: std::env::temp_dir(),
        })
    }

    async fn stream_to(
        &self,
        url: &str,
        path: &Path,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            response = self.client.get(url).send() => response.map_err(network_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Http {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };

            let chunk = chunk.map_err(network_error)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.report(written, total);
        }

        file.flush().await?;
        file.sync_all().await?;
        info!("Fetched {} bytes from {}", written, url);
        Ok(())
    }
}

fn network_error(error: reqwest::Error) -> TransferError {
    TransferError::Network(error.to_string())
}

#[async_trait]
impl TransferDelegate for HttpTransfer {
    async fn fetch(
        &self,
        url: &str,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<PathBuf, TransferError> {
        let path = self.temp_dir.join(format!("{}.part", progress.download_id()));

        match self.stream_to(url, &path, &progress, &cancel).await {
            Ok(()) => Ok(path),
            Err(e) => {
                debug!("Discarding partial file {}: {}", path.display(), e);
                let _ = tokio::fs::remove_file(&path).await;
                Err(e)
            }
        }
    }
}
