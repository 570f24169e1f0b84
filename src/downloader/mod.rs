//! Download worker pool
//!
//! A fixed set of workers pulls admitted jobs off a shared queue. Each job already carries
//! the memory lease granted at admission, so a worker never waits for budget; it fetches
//! the object, checks its length, decompresses it off the async runtime and reports the
//! outcome (lease included) back to the download manager.
//!
//! - [`transport`] - byte-range GET abstraction and the reqwest implementation
//! - [`decompress`] - LZ4 frame decoding

pub mod decompress;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::memory::MemoryLease;
use crate::types::{ChunkMetadata, CompressionCodec};

pub use transport::{ChunkTransport, HttpChunkTransport};

/// One admitted download attempt
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) metadata: ChunkMetadata,
    pub(crate) lease: MemoryLease,
    /// 0-based attempt number, for logs and events
    pub(crate) attempt: u32,
}

/// A chunk fetched and decompressed, still holding its memory reservation
#[derive(Debug)]
pub(crate) struct DownloadResult {
    pub(crate) index: u64,
    pub(crate) row_count: u64,
    /// Raw Arrow IPC stream
    pub(crate) data: Vec<u8>,
    pub(crate) lease: MemoryLease,
}

/// Outcome reports from workers to the download manager
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Started {
        index: u64,
        attempt: u32,
    },
    Completed(DownloadResult),
    /// The lease comes back with the failure so a retry can reuse it
    Failed {
        index: u64,
        error: Error,
        lease: MemoryLease,
    },
}

/// Shared job queue; workers take turns receiving from it
pub(crate) type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// Settings every worker needs
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) transport: Arc<dyn ChunkTransport>,
    pub(crate) events: mpsc::UnboundedSender<WorkerEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) link_expiry_buffer: Duration,
}

/// Spawn `count` workers draining `jobs`
pub(crate) fn spawn_workers(
    count: usize,
    jobs: JobQueue,
    ctx: WorkerContext,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let jobs = Arc::clone(&jobs);
            let ctx = ctx.clone();
            tokio::spawn(run_worker(worker_id, jobs, ctx))
        })
        .collect()
}

async fn run_worker(worker_id: usize, jobs: JobQueue, ctx: WorkerContext) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        let index = job.metadata.index;
        let attempt = job.attempt;
        if ctx.events.send(WorkerEvent::Started { index, attempt }).is_err() {
            break;
        }

        tracing::debug!(
            worker_id,
            chunk_index = index,
            attempt,
            bytes = job.metadata.byte_length,
            "Downloading chunk"
        );

        let size_hint = usize::try_from(job.lease.bytes()).unwrap_or(0);
        let outcome = download_chunk(
            ctx.transport.as_ref(),
            &job.metadata,
            ctx.link_expiry_buffer,
            size_hint,
            &ctx.cancel,
        )
        .await;

        let event = match outcome {
            Ok(data) => WorkerEvent::Completed(DownloadResult {
                index,
                row_count: job.metadata.row_count,
                data,
                lease: job.lease,
            }),
            Err(Error::Cancelled) => break,
            Err(error) => {
                tracing::debug!(
                    worker_id,
                    chunk_index = index,
                    attempt,
                    error = %error,
                    "Chunk attempt failed"
                );
                WorkerEvent::Failed {
                    index,
                    error,
                    lease: job.lease,
                }
            }
        };

        if ctx.events.send(event).is_err() {
            break;
        }
    }

    tracing::debug!(worker_id, "Download worker stopped");
}

/// Fetch, verify and decompress a single chunk
///
/// A link already inside the expiry buffer is reported as [`Error::ExpiredLink`] without
/// any network traffic. The transfer is abandoned as soon as `cancel` fires.
pub(crate) async fn download_chunk(
    transport: &dyn ChunkTransport,
    chunk: &ChunkMetadata,
    link_expiry_buffer: Duration,
    size_hint: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    if chunk.expires_within(Utc::now(), link_expiry_buffer) {
        return Err(Error::ExpiredLink(format!(
            "link for chunk {} expires at {}",
            chunk.index,
            chunk
                .expires_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        )));
    }

    let payload = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        fetched = transport.fetch(&chunk.url, chunk.byte_length, &chunk.headers) => fetched?,
    };

    if payload.len() as u64 != chunk.byte_length {
        return Err(Error::DataIntegrity(format!(
            "chunk {}: expected {} bytes, received {}",
            chunk.index,
            chunk.byte_length,
            payload.len()
        )));
    }

    // Decompression is CPU-bound; keep it off the runtime threads driving other transfers
    let codec = chunk.compression;
    let data =
        tokio::task::spawn_blocking(move || decompress::decompress(codec, payload, size_hint))
            .await
            .map_err(|e| Error::Other(format!("decompression task panicked: {e}")))??;

    if codec == CompressionCodec::Lz4 {
        if let Some(overrun) =
            decompress::lz4_overrun(size_hint as u64, chunk.byte_length, data.len() as u64)
        {
            tracing::warn!(
                chunk_index = chunk.index,
                compressed = chunk.byte_length,
                decompressed = data.len(),
                leased = size_hint,
                overrun,
                "Decompressed chunk exceeds its memory lease; consider raising lz4_expansion_ratio"
            );
        }
    }
    Ok(data)
}
