//! Ordered memory admission
//!
//! A single task grants memory to first attempts in the order the coordinator requests
//! them, which is strictly increasing chunk index. Because leases are held until a chunk
//! is consumed or the pipeline stops, every chunk below a leased one is itself leased or
//! already delivered, so the chunk the reader waits for can always make progress.

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::downloader::Job;
use crate::memory::MemoryBufferManager;
use crate::types::{ChunkMetadata, PipelineEvent};

/// A first attempt waiting for its memory grant
#[derive(Debug)]
pub(crate) struct AdmissionRequest {
    pub(crate) metadata: ChunkMetadata,
    pub(crate) bytes: u64,
}

pub(crate) fn spawn_admission(
    memory: MemoryBufferManager,
    mut requests: mpsc::UnboundedReceiver<AdmissionRequest>,
    jobs: mpsc::UnboundedSender<Job>,
    events: broadcast::Sender<PipelineEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let index = request.metadata.index;
            let lease = match memory.acquire(request.bytes).await {
                Ok(lease) => lease,
                Err(e) => {
                    tracing::debug!(chunk_index = index, error = %e, "Admission stopped");
                    break;
                }
            };

            let event = if request.bytes > memory.limit() {
                PipelineEvent::OversizedAdmission {
                    index,
                    bytes: request.bytes,
                    limit: memory.limit(),
                }
            } else {
                PipelineEvent::ChunkAdmitted {
                    index,
                    bytes: request.bytes,
                }
            };
            let _ = events.send(event);

            tracing::debug!(
                chunk_index = index,
                bytes = request.bytes,
                leased = memory.leased_bytes(),
                "Chunk admitted"
            );

            let job = Job {
                metadata: request.metadata,
                lease,
                attempt: 0,
            };
            if jobs.send(job).is_err() {
                break;
            }
        }
    })
}
