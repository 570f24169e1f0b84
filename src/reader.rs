//! Consumer surface: in-order row batches out of the pipeline
//!
//! The [`Reader`] receives one downloaded chunk at a time from the download manager,
//! decodes its Arrow IPC stream, releases the chunk's memory lease and acknowledges the
//! chunk so the prefetch window can slide.

use std::collections::VecDeque;
use std::io::Cursor;
use std::time::Duration;

use arrow::ipc::reader::StreamReader;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::downloader::DownloadResult;
use crate::error::{Error, Result};
use crate::manager::Delivery;
use crate::memory::MemoryBufferManager;
use crate::types::{PipelineEvent, RowBatch};

/// Pull-based, strictly ordered view of a CloudFetch result set
///
/// Created by [`crate::CloudFetchPipeline::start`]. Dropping the reader cancels the
/// pipeline; call [`Reader::close`] to also wait for background tasks to stop.
pub struct Reader {
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    consumed: mpsc::UnboundedSender<u64>,
    pending: VecDeque<RowBatch>,
    terminal: Option<Error>,
    finished: bool,
    closed: bool,
    cancel: CancellationToken,
    memory: MemoryBufferManager,
    events: broadcast::Sender<PipelineEvent>,
    handles: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
}

/// Parts the pipeline wires into a reader
pub(crate) struct ReaderParts {
    pub(crate) deliveries: mpsc::UnboundedReceiver<Delivery>,
    pub(crate) consumed: mpsc::UnboundedSender<u64>,
    pub(crate) cancel: CancellationToken,
    pub(crate) memory: MemoryBufferManager,
    pub(crate) events: broadcast::Sender<PipelineEvent>,
    pub(crate) handles: Vec<JoinHandle<()>>,
    pub(crate) drain_timeout: Duration,
}

impl Reader {
    pub(crate) fn new(parts: ReaderParts) -> Self {
        Self {
            deliveries: parts.deliveries,
            consumed: parts.consumed,
            pending: VecDeque::new(),
            terminal: None,
            finished: false,
            closed: false,
            cancel: parts.cancel,
            memory: parts.memory,
            events: parts.events,
            handles: parts.handles,
            drain_timeout: parts.drain_timeout,
        }
    }

    /// Next row batch in chunk order
    ///
    /// Returns `Ok(None)` once every chunk has been delivered, and keeps returning it.
    /// A pipeline failure is returned at the position of the chunk it belongs to; every
    /// later call returns the same error.
    ///
    /// # Errors
    ///
    /// - [`Error::ChunkFailed`] when a chunk exhausted its retries
    /// - [`Error::MetadataFetch`] / [`Error::InvalidMetadata`] when later chunks cannot be described
    /// - [`Error::Decode`] when a chunk is not a valid Arrow IPC stream
    /// - [`Error::Cancelled`] after cancellation or [`Reader::close`]
    pub async fn next(&mut self) -> Result<Option<RowBatch>> {
        loop {
            if let Some(e) = &self.terminal {
                let e = e.clone();
                self.discard_undelivered();
                return Err(e);
            }
            if self.finished && self.pending.is_empty() {
                return Ok(None);
            }
            if self.cancel.is_cancelled() {
                self.pending.clear();
                self.terminal = Some(Error::Cancelled);
                continue;
            }
            if let Some(batch) = self.pending.pop_front() {
                return Ok(Some(batch));
            }

            let delivery = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => continue,
                delivery = self.deliveries.recv() => delivery,
            };

            match delivery {
                Some(Delivery::Chunk(result)) => self.accept(result).await,
                Some(Delivery::Failed(e)) => {
                    tracing::debug!(error = %e, "Reader received terminal pipeline error");
                    self.terminal = Some(e);
                    self.cancel.cancel();
                }
                Some(Delivery::End) => self.finished = true,
                None => {
                    self.terminal = Some(if self.cancel.is_cancelled() {
                        Error::Cancelled
                    } else {
                        Error::Other("download manager stopped unexpectedly".to_string())
                    });
                }
            }
        }
    }

    /// Decode a delivered chunk, free its memory and let the window slide
    async fn accept(&mut self, result: DownloadResult) {
        let DownloadResult {
            index,
            row_count,
            data,
            lease,
        } = result;

        let decoded = tokio::task::spawn_blocking(move || decode_chunk(index, &data))
            .await
            .unwrap_or_else(|e| {
                Err(Error::Decode {
                    index,
                    reason: format!("decode task panicked: {e}"),
                })
            });

        // The buffer is gone; return its bytes before acknowledging
        drop(lease);
        let _ = self.consumed.send(index);

        match decoded {
            Ok(batches) => {
                let rows: usize = batches.iter().map(RowBatch::num_rows).sum();
                if row_count > 0 && rows as u64 != row_count {
                    tracing::warn!(
                        chunk_index = index,
                        expected_rows = row_count,
                        decoded_rows = rows,
                        "Chunk row count differs from its descriptor"
                    );
                }
                tracing::debug!(chunk_index = index, batches = batches.len(), rows, "Chunk decoded");
                self.pending.extend(batches);
            }
            Err(e) => {
                tracing::error!(chunk_index = index, error = %e, "Failed to decode chunk");
                self.terminal = Some(e);
                self.cancel.cancel();
            }
        }
    }

    /// Cancel the pipeline and release everything it holds
    ///
    /// Buffered batches and undelivered chunks are dropped, returning their memory.
    /// Background tasks get [`crate::CloudFetchConfig::drain_timeout`] to stop before
    /// they are aborted. Calling `close` again does nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let fully_read = self.finished && self.pending.is_empty();
        if self.terminal.is_none() && !fully_read {
            self.terminal = Some(Error::Cancelled);
        }

        self.cancel.cancel();
        self.discard_undelivered();

        let handles = std::mem::take(&mut self.handles);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(self.drain_timeout, futures::future::join_all(handles)).await {
            Ok(_) => tracing::debug!("CloudFetch pipeline drained"),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "Background tasks did not stop in time, aborting them"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }

    /// Drop buffered batches and any chunk already handed over, returning its memory
    fn discard_undelivered(&mut self) {
        self.pending.clear();
        self.deliveries.close();
        while self.deliveries.try_recv().is_ok() {}
    }

    /// Receive [`PipelineEvent`]s from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// The pipeline's memory budget, for introspection
    pub fn memory(&self) -> &MemoryBufferManager {
        &self.memory
    }

    /// Token that cancels this pipeline when triggered from anywhere
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Decode one chunk's Arrow IPC stream into row batches
pub(crate) fn decode_chunk(index: u64, data: &[u8]) -> Result<Vec<RowBatch>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let reader = StreamReader::try_new(Cursor::new(data), None).map_err(|e| Error::Decode {
        index,
        reason: format!("invalid Arrow IPC stream: {e}"),
    })?;

    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Decode {
            index,
            reason: format!("failed to read batch: {e}"),
        })
}
