//! Concurrent download of remote images into a local staging directory.

use crate::config::TransferConfig;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(String),

    #[error("Invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransferError {
    fn io(path: &Path, e: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        }
    }
}

/// A downloaded file waiting to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub local_path: PathBuf,
    pub source_url: String,
}

/// Completion accounting for one fetch phase
#[derive(Debug, Default)]
pub struct FetchReport {
    pub staged: Vec<StagedFile>,
    /// Downloads that failed (network, status, I/O, bad URL)
    pub failed: usize,
    /// URLs whose file name was already claimed by an earlier URL
    pub skipped: usize,
    /// Downloads not completed because the run was cancelled
    pub cancelled: usize,
}

/// Bounded-concurrency image downloader
pub struct BulkFetcher {
    client: reqwest::Client,
    concurrency: usize,
    chunk_size: usize,
}

impl BulkFetcher {
    pub fn new(config: &TransferConfig) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransferError::ClientBuild(e.to_string()))?;

        Ok(Self::with_client(
            client,
            config.concurrency,
            config.chunk_size_bytes,
        ))
    }

    /// Share an existing client across workers.
    pub fn with_client(client: reqwest::Client, concurrency: usize, chunk_size: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Download every URL into `staging_dir`.
    ///
    /// Individual failures are logged and counted; only an unusable staging
    /// directory fails the call.
    #[instrument(skip(self, urls, cancel), fields(urls = urls.len()))]
    pub async fn fetch_all(
        &self,
        urls: &[String],
        staging_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchReport, TransferError> {
        tokio::fs::create_dir_all(staging_dir)
            .await
            .map_err(|e| TransferError::io(staging_dir, e))?;

        let mut report = FetchReport::default();
        let mut claimed = HashSet::new();
        let mut plan = Vec::with_capacity(urls.len());

        for url in urls {
            match file_name_from_url(url) {
                Ok(name) if claimed.insert(name.clone()) => plan.push((url.clone(), name)),
                Ok(name) => {
                    warn!(url = %url, file = %name, "File name already claimed, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Skipping URL");
                    report.failed += 1;
                }
            }
        }

        let results: Vec<Result<StagedFile, TransferError>> = stream::iter(plan)
            .map(|(url, name)| {
                let client = self.client.clone();
                let cancel = cancel.clone();
                let local_path = staging_dir.join(name);
                let chunk_size = self.chunk_size;

                async move {
                    if cancel.is_cancelled() {
                        return Err(TransferError::Cancelled);
                    }

                    match download(&client, &url, &local_path, chunk_size, &cancel).await {
                        Ok(bytes) => {
                            debug!(url = %url, bytes = bytes, "Downloaded");
                            Ok(StagedFile {
                                local_path,
                                source_url: url,
                            })
                        }
                        Err(e) => {
                            warn!(url = %url, error = %e, "Download failed");
                            Err(e)
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                Ok(staged) => report.staged.push(staged),
                Err(TransferError::Cancelled) => report.cancelled += 1,
                Err(_) => report.failed += 1,
            }
        }

        metrics::counter!("harvester.downloads.succeeded").increment(report.staged.len() as u64);
        metrics::counter!("harvester.downloads.failed").increment(report.failed as u64);

        info!(
            staged = report.staged.len(),
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "Fetch phase complete"
        );

        Ok(report)
    }
}

/// Final path segment of a URL.
pub fn file_name_from_url(raw: &str) -> Result<String, TransferError> {
    let invalid = |message: &str| TransferError::InvalidUrl {
        url: raw.to_string(),
        message: message.to_string(),
    };

    let url = url::Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();

    match name {
        "" => Err(invalid("no file name in path")),
        "." | ".." => Err(invalid("file name is a relative path component")),
        name => Ok(name.to_string()),
    }
}

/// Stream one response body to disk; a partial file is removed on failure.
async fn download(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        sent = client.get(url).send() => sent.map_err(|e| TransferError::Request(e.to_string()))?,
    };

    if !response.status().is_success() {
        return Err(TransferError::Status(response.status().as_u16()));
    }

    let file = File::create(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;

    let result = write_body(response, file, path, chunk_size, cancel).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(path).await;
    }

    result
}

async fn write_body(
    mut response: reqwest::Response,
    mut file: File,
    path: &Path,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let mut written = 0u64;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            chunk = response.chunk() => chunk.map_err(|e| TransferError::Request(e.to_string()))?,
        };

        let Some(bytes) = next else { break };

        for piece in bytes.chunks(chunk_size) {
            file.write_all(piece)
                .await
                .map_err(|e| TransferError::io(path, e))?;
            written += piece.len() as u64;
        }
    }

    file.flush().await.map_err(|e| TransferError::io(path, e))?;

    Ok(written)
}
