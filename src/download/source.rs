//! Where model bytes come from.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use crate::download::manager::TransferError;

/// An opened transfer: response status, declared length and the body stream.
pub struct Transfer {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, TransferError>>,
}

/// A remote source for a single file.
#[async_trait]
pub trait TransferSource: Send + Sync {
    /// Human-readable origin, for logs.
    fn describe(&self) -> String;

    async fn open(&self) -> Result<Transfer, TransferError>;
}

/// HTTP(S) source backed by `reqwest`.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl TransferSource for HttpSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn open(&self) -> Result<Transfer, TransferError> {
        debug!(url = self.url.as_str(), "Sending GET request");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| TransferError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransferError::Body(e.to_string())))
            .boxed();

        Ok(Transfer {
            status,
            content_length,
            body,
        })
    }
}

/// In-memory source delivering a fixed list of chunks.
pub struct MemorySource {
    status: u16,
    content_length: Option<u64>,
    chunks: Vec<Bytes>,
    fail_after: Option<usize>,
    opens: AtomicUsize,
}

impl MemorySource {
    /// A 200 response declaring the exact length of `chunks`.
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let chunks: Vec<Bytes> = chunks.into_iter().map(Into::into).collect();
        let len = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            status: 200,
            content_length: Some(len),
            chunks,
            fail_after: None,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_content_length(mut self, len: Option<u64>) -> Self {
        self.content_length = len;
        self
    }

    /// Deliver `n` chunks, then fail the body stream.
    pub fn with_error_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// How many times the source was opened.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferSource for MemorySource {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn open(&self) -> Result<Transfer, TransferError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let mut items: Vec<Result<Bytes, TransferError>> =
            self.chunks.iter().cloned().map(Ok).collect();
        if let Some(n) = self.fail_after {
            items.truncate(n);
            items.push(Err(TransferError::Body("connection reset".to_string())));
        }

        Ok(Transfer {
            status: self.status,
            content_length: self.content_length,
            body: stream::iter(items).boxed(),
        })
    }
}
