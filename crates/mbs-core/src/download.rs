use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::UpdateProgress;

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{context} {}: {source}", path.display())]
    FileSystem {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Network {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("download of {url} failed with HTTP {status}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("download of {url} ended after {received} of {total} bytes")]
    Incomplete {
        url: String,
        received: u64,
        total: u64,
    },
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("failed to build download client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    fn file_system(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::FileSystem {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    fn network(context: &'static str, source: reqwest::Error) -> Self {
        Self::Network { context, source }
    }
}

/// Bookkeeping for a single transfer.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub source_url: String,
    pub destination_path: PathBuf,
    pub bytes_received: u64,
    pub bytes_total: Option<u64>,
}

impl DownloadTask {
    fn new(source_url: &str, destination_path: &Path) -> Self {
        Self {
            source_url: source_url.to_string(),
            destination_path: destination_path.to_path_buf(),
            bytes_received: 0,
            bytes_total: None,
        }
    }

    fn progress(&self) -> UpdateProgress {
        UpdateProgress::Downloading {
            downloaded: self.bytes_received,
            total: self.bytes_total,
        }
    }
}

/// Streams update packages to disk.
///
/// One transfer runs at a time. [`PackageDownloader::cancel`] may be called
/// from another task while [`PackageDownloader::download`] is awaited.
#[derive(Debug)]
pub struct PackageDownloader {
    client: reqwest::Client,
    cancel: Mutex<CancellationToken>,
}

impl PackageDownloader {
    /// Build a downloader with its own HTTP client.
    ///
    /// # Errors
    /// Returns [`DownloadError::Client`] when the TLS backend cannot be
    /// initialised.
    pub fn new(connect_timeout: Duration, timeout: Duration) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .redirect(no_less_safe_redirects())
            .user_agent(format!("mbs-updater/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(DownloadError::Client)?;
        Ok(Self::with_client(client))
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Abort the transfer in progress, if any. Idempotent.
    pub fn cancel(&self) {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !token.is_cancelled() {
            info!("Cancelling update download");
            token.cancel();
        }
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop a pending cancellation so the next transfer can run. Called after
    /// every transfer; callers that start a new attempt call it up front.
    pub fn reset_cancellation(&self) {
        let mut token = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// Download `url` into `destination`, reporting progress per chunk.
    ///
    /// The destination file is opened before the request is sent and is
    /// removed again on any failure or cancellation.
    ///
    /// # Errors
    /// Returns [`DownloadError::FileSystem`] when the destination cannot be
    /// created, a network or status error when the transfer fails, and
    /// [`DownloadError::Cancelled`] after [`PackageDownloader::cancel`]. A
    /// cancel requested before the transfer starts applies to it.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: &mpsc::Sender<UpdateProgress>,
    ) -> Result<PathBuf, DownloadError> {
        let token = self.current_token();
        let result = self.download_with(&token, url, destination, progress).await;
        self.reset_cancellation();
        result
    }

    async fn download_with(
        &self,
        token: &CancellationToken,
        url: &str,
        destination: &Path,
        progress: &mpsc::Sender<UpdateProgress>,
    ) -> Result<PathBuf, DownloadError> {
        if token.is_cancelled() {
            info!("Update download cancelled before it started");
            return Err(DownloadError::Cancelled);
        }

        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                DownloadError::file_system("failed to create download directory", parent, error)
            })?;
        }
        let file = tokio::fs::File::create(destination).await.map_err(|error| {
            DownloadError::file_system("failed to create download file", destination, error)
        })?;

        info!("Downloading update from {url}");
        let mut task = DownloadTask::new(url, destination);

        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(DownloadError::Cancelled),
            result = self.transfer(&mut task, file, progress, token) => result,
        };

        match result {
            Ok(()) => {
                info!(
                    "Download complete: {} bytes to {}",
                    task.bytes_received,
                    task.destination_path.display()
                );
                Ok(task.destination_path)
            }
            Err(error) => {
                remove_partial(destination).await;
                Err(error)
            }
        }
    }

    async fn transfer(
        &self,
        task: &mut DownloadTask,
        mut file: tokio::fs::File,
        progress: &mpsc::Sender<UpdateProgress>,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let response = self
            .client
            .get(&task.source_url)
            .send()
            .await
            .map_err(|error| DownloadError::network("download request failed", error))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                url: task.source_url.clone(),
                status,
            });
        }

        task.bytes_total = response.content_length();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|error| DownloadError::network("download stream error", error))?;
            file.write_all(&chunk).await.map_err(|error| {
                DownloadError::file_system(
                    "failed to write download data",
                    &task.destination_path,
                    error,
                )
            })?;
            task.bytes_received += chunk.len() as u64;

            if !token.is_cancelled() {
                let _ = progress.send(task.progress()).await;
            }
        }

        if let Some(total) = task.bytes_total
            && task.bytes_received < total
        {
            return Err(DownloadError::Incomplete {
                url: task.source_url.clone(),
                received: task.bytes_received,
                total,
            });
        }

        file.flush().await.map_err(|error| {
            DownloadError::file_system(
                "failed to flush download file",
                &task.destination_path,
                error,
            )
        })?;
        file.sync_all().await.map_err(|error| {
            DownloadError::file_system(
                "failed to sync download file",
                &task.destination_path,
                error,
            )
        })?;
        drop(file);

        Ok(())
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial download {}", path.display()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(
            "Failed to remove partial download {}: {error}",
            path.display()
        ),
    }
}

/// Whether a redirect from `from` to `to` keeps at least the same transport
/// security.
#[must_use]
pub fn is_redirect_allowed(from: &reqwest::Url, to: &reqwest::Url) -> bool {
    !(from.scheme() == "https" && to.scheme() != "https")
}

fn no_less_safe_redirects() -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let allowed = attempt
            .previous()
            .last()
            .is_none_or(|previous| is_redirect_allowed(previous, attempt.url()));
        if allowed {
            attempt.follow()
        } else {
            attempt.error("refusing redirect from https to a less secure transport")
        }
    })
}

/// Check `path` against an expected lowercase hex SHA-256 digest. The file is
/// removed when it does not match.
///
/// # Errors
/// Returns [`DownloadError::ChecksumMismatch`] on mismatch or
/// [`DownloadError::FileSystem`] when the file cannot be read.
pub async fn verify_sha256(path: &Path, expected: &str) -> Result<(), DownloadError> {
    let owned = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || sha256_file(&owned))
        .await
        .map_err(|error| {
            DownloadError::file_system(
                "checksum task failed for",
                path,
                std::io::Error::other(error.to_string()),
            )
        })?
        .map_err(|error| {
            DownloadError::file_system("failed to read file for checksum", path, error)
        })?;

    if actual.eq_ignore_ascii_case(expected) {
        info!("Update checksum verified for {}", path.display());
        Ok(())
    } else {
        remove_partial(path).await;
        Err(DownloadError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
