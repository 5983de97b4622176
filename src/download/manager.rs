//! Model weight download.
//!
//! Bytes are streamed into `<dest>.part` through a bounded write buffer and
//! the part file is renamed over `dest` only once every declared byte has
//! arrived, so a file at `dest` is always complete. Part files are never
//! resumed: any leftover is deleted and the transfer starts from zero.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::download::source::{Transfer, TransferSource};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Server responded with status {0}")]
    Status(u16),

    #[error("Server did not declare a content length")]
    UnknownLength,

    #[error("Server declared an empty body")]
    EmptyBody,

    #[error("Declared length {declared} does not match expected size {expected}")]
    SizeMismatch { expected: u64, declared: u64 },

    #[error("Failed to read body: {0}")]
    Body(String),

    #[error("Transfer ended after {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Observable download progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Absent,
    InProgress { bytes_received: u64, total_bytes: u64 },
    Complete { path: PathBuf },
    Failed(String),
}

impl DownloadState {
    /// Fraction in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        match self {
            DownloadState::InProgress {
                bytes_received,
                total_bytes,
            } if *total_bytes > 0 => *bytes_received as f64 / *total_bytes as f64,
            DownloadState::Complete { .. } => 1.0,
            _ => 0.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Complete { .. } | DownloadState::Failed(_))
    }
}

/// Path of the in-flight part file for `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Fetches one file at a time into local storage.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    chunk_size: usize,
    expected_size: Option<u64>,
    channel_capacity: usize,
}

impl DownloadManager {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            expected_size: None,
            channel_capacity: 64,
        }
    }

    pub fn from_config(cfg: &DownloadConfig) -> Self {
        Self::new(cfg.chunk_size).with_expected_size(cfg.expected_size)
    }

    /// Require files to be exactly `size` bytes.
    pub fn with_expected_size(mut self, size: Option<u64>) -> Self {
        self.expected_size = size;
        self
    }

    fn size_is_valid(&self, len: u64) -> bool {
        match self.expected_size {
            Some(expected) => len == expected,
            None => len > 0,
        }
    }

    /// State of `dest` on disk, without touching the network.
    pub async fn status(&self, dest: &Path) -> DownloadState {
        match fs::metadata(dest).await {
            Ok(meta) if meta.is_file() && self.size_is_valid(meta.len()) => DownloadState::Complete {
                path: dest.to_path_buf(),
            },
            _ => DownloadState::Absent,
        }
    }

    /// Fetch `source` into `dest` on a background task.
    ///
    /// The returned stream yields progress and ends with exactly one terminal
    /// state. `on_complete` runs once, after `Complete` has been sent; it is
    /// dropped without running when the download fails.
    pub fn acquire<F>(
        &self,
        source: Arc<dyn TransferSource>,
        dest: PathBuf,
        on_complete: F,
    ) -> ReceiverStream<DownloadState>
    where
        F: FnOnce(PathBuf) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let manager = self.clone();

        tokio::spawn(async move {
            let terminal = match manager.fetch(source.as_ref(), &dest, &tx).await {
                Ok(()) => DownloadState::Complete { path: dest.clone() },
                Err(e) => {
                    warn!(dest = %dest.display(), "Download failed: {e}");
                    DownloadState::Failed(e.to_string())
                }
            };

            let complete = matches!(terminal, DownloadState::Complete { .. });
            let _ = tx.send(terminal).await;
            if complete {
                on_complete(dest);
            }
        });

        ReceiverStream::new(rx)
    }

    async fn fetch(
        &self,
        source: &dyn TransferSource,
        dest: &Path,
        tx: &mpsc::Sender<DownloadState>,
    ) -> Result<(), TransferError> {
        if let DownloadState::Complete { .. } = self.status(dest).await {
            info!(dest = %dest.display(), "Model already exists locally");
            return Ok(());
        }

        let partial = partial_path(dest);
        remove_if_exists(&partial).await?;
        remove_if_exists(dest).await?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        info!(source = %source.describe(), dest = %dest.display(), "Downloading model");
        let transfer = source.open().await?;
        let total = self.check_response(&transfer)?;

        match self.stream_to_file(transfer, &partial, total, tx).await {
            Ok(received) => {
                fs::rename(&partial, dest).await?;
                info!(dest = %dest.display(), bytes = received, "Download complete");
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = remove_if_exists(&partial).await {
                    warn!(path = %partial.display(), "Failed to remove partial file: {cleanup}");
                }
                Err(e)
            }
        }
    }

    fn check_response(&self, transfer: &Transfer) -> Result<u64, TransferError> {
        if !(200..300).contains(&transfer.status) {
            return Err(TransferError::Status(transfer.status));
        }
        let total = transfer.content_length.ok_or(TransferError::UnknownLength)?;
        // An empty file would never pass `status`.
        if total == 0 {
            return Err(TransferError::EmptyBody);
        }
        if let Some(expected) = self.expected_size {
            if expected != total {
                return Err(TransferError::SizeMismatch {
                    expected,
                    declared: total,
                });
            }
        }
        Ok(total)
    }

    async fn stream_to_file(
        &self,
        transfer: Transfer,
        partial: &Path,
        total: u64,
        tx: &mpsc::Sender<DownloadState>,
    ) -> Result<u64, TransferError> {
        let mut file = fs::File::create(partial).await?;
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        let mut body = transfer.body;
        let mut received = 0u64;
        let mut last_percent = 0u64;

        let _ = tx
            .send(DownloadState::InProgress {
                bytes_received: 0,
                total_bytes: total,
            })
            .await;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            if received > total {
                return Err(TransferError::Incomplete {
                    expected: total,
                    received,
                });
            }

            let mut rest = &chunk[..];
            while !rest.is_empty() {
                let take = (self.chunk_size - buffer.len()).min(rest.len());
                buffer.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
                if buffer.len() == self.chunk_size {
                    file.write_all(&buffer).await?;
                    buffer.clear();
                }
            }

            // Report every whole percent.
            let percent = received * 100 / total;
            if percent > last_percent {
                last_percent = percent;
                debug!(received, total, percent, "Download progress");
                let _ = tx
                    .send(DownloadState::InProgress {
                        bytes_received: received,
                        total_bytes: total,
                    })
                    .await;
            }
        }

        if !buffer.is_empty() {
            file.write_all(&buffer).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        if received != total {
            return Err(TransferError::Incomplete {
                expected: total,
                received,
            });
        }
        Ok(received)
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), TransferError> {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed stale file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
