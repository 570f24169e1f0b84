//! Chunk metadata producer
//!
//! [`ResultFetcher`] runs on its own task, paging chunk descriptors out of the query engine
//! through a [`ChunkLinkFetcher`] and pushing them, in index order, into a bounded channel
//! the download manager drains. The channel bound is the lookahead: once it is full the
//! fetcher waits instead of paging further ahead.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::retry::with_retry;
use crate::types::{ChunkMetadata, MetadataPage};

/// Abstraction over the query engine's result-link API, enabling testability.
///
/// Implementations wrap whatever protocol the session speaks; the pipeline only needs
/// paginated descriptors and a way to refresh a single expired link.
#[async_trait::async_trait]
pub trait ChunkLinkFetcher: Send + Sync {
    /// Fetch the page identified by `token` (`None` for the first page)
    async fn fetch_page(&self, token: Option<&str>) -> Result<MetadataPage>;

    /// Fetch a fresh descriptor for a single chunk whose link expired
    async fn refetch_chunk(&self, index: u64) -> Result<ChunkMetadata>;
}

/// Messages from the metadata producer to the download manager
#[derive(Debug)]
pub(crate) enum FetcherMessage {
    /// Next descriptor in index order
    Chunk(ChunkMetadata),
    /// No more descriptors; carries the total chunk count
    Done { total: u64 },
    /// Metadata can no longer be obtained; the pipeline must stop at this point
    Failed(Error),
}

/// Background producer of chunk descriptors
pub(crate) struct ResultFetcher {
    links: Arc<dyn ChunkLinkFetcher>,
    retry: RetryConfig,
    tx: mpsc::Sender<FetcherMessage>,
    cancel: CancellationToken,
    next_index: u64,
}

impl ResultFetcher {
    pub(crate) fn new(
        links: Arc<dyn ChunkLinkFetcher>,
        retry: RetryConfig,
        tx: mpsc::Sender<FetcherMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            links,
            retry,
            tx,
            cancel,
            next_index: 0,
        }
    }

    /// Start paging on a background task
    pub(crate) fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut token: Option<String> = None;

        loop {
            let page = tokio::select! {
                _ = self.cancel.cancelled() => return,
                page = self.fetch_page(token.as_deref()) => page,
            };

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(
                        next_index = self.next_index,
                        error = %e,
                        "Giving up on chunk metadata"
                    );
                    self.send(FetcherMessage::Failed(e)).await;
                    return;
                }
            };

            tracing::debug!(
                chunks = page.chunks.len(),
                first_index = page.chunks.first().map(|c| c.index),
                has_more = page.next_token.is_some(),
                "Received metadata page"
            );

            for chunk in page.chunks {
                if let Err(e) = validate_chunk(&chunk, self.next_index) {
                    tracing::error!(error = %e, "Metadata collaborator broke index continuity");
                    self.send(FetcherMessage::Failed(e)).await;
                    return;
                }
                self.next_index += 1;
                if !self.send(FetcherMessage::Chunk(chunk)).await {
                    return;
                }
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => {
                    tracing::info!(total = self.next_index, "All chunk metadata fetched");
                    self.send(FetcherMessage::Done {
                        total: self.next_index,
                    })
                    .await;
                    return;
                }
            }
        }
    }

    async fn fetch_page(&self, token: Option<&str>) -> Result<MetadataPage> {
        let links = Arc::clone(&self.links);
        with_retry(&self.retry, || {
            let links = Arc::clone(&links);
            async move { links.fetch_page(token).await }
        })
        .await
        .map_err(|e| match e {
            Error::MetadataFetch(_) | Error::InvalidMetadata(_) | Error::Cancelled => e,
            other => Error::MetadataFetch(other.to_string()),
        })
    }

    /// Returns false once the manager is gone or the pipeline is cancelled.
    async fn send(&self, message: FetcherMessage) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(message) => sent.is_ok(),
        }
    }
}

/// Fetch a fresh link for one chunk, retrying transient failures
pub(crate) async fn refetch_link(
    links: &dyn ChunkLinkFetcher,
    retry: &RetryConfig,
    index: u64,
) -> Result<ChunkMetadata> {
    let chunk = with_retry(retry, || links.refetch_chunk(index))
        .await
        .map_err(|e| match e {
            Error::MetadataFetch(_) | Error::InvalidMetadata(_) | Error::Cancelled => e,
            other => Error::MetadataFetch(other.to_string()),
        })?;
    validate_chunk(&chunk, index)?;
    Ok(chunk)
}

fn validate_chunk(chunk: &ChunkMetadata, expected: u64) -> Result<()> {
    if chunk.index < expected {
        return Err(Error::InvalidMetadata(format!(
            "duplicate chunk index {} (expected {expected})",
            chunk.index
        )));
    }
    if chunk.index > expected {
        return Err(Error::InvalidMetadata(format!(
            "gap in chunk indices: got {} but expected {expected}",
            chunk.index
        )));
    }
    url::Url::parse(&chunk.url).map_err(|e| {
        Error::InvalidMetadata(format!("chunk {} has an invalid URL: {e}", chunk.index))
    })?;
    Ok(())
}
