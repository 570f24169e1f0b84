//! Download manager: the single owner of scheduling state
//!
//! The coordinator loop reacts to four inputs and nothing else mutates [`PipelineState`]:
//! - chunk descriptors from the metadata producer
//! - outcome reports from download workers
//! - retry timers and link refetches it spawned itself
//! - consumption acknowledgements from the reader
//!
//! After every input it runs a scheduling pass (hand new work to admission or straight
//! to the workers) and a delivery pass (give the reader the next chunk in order).
//!
//! - [`state`] - task map, delivery cursor, scheduling decisions
//! - [`admission`] - ordered memory grants for first attempts

pub(crate) mod admission;
pub(crate) mod state;


use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{CloudFetchConfig, RetryConfig};
use crate::downloader::{DownloadResult, Job, WorkerEvent};
use crate::error::{Error, Result};
use crate::fetcher::{ChunkLinkFetcher, FetcherMessage, refetch_link};
use crate::retry::{IsRetryable, backoff_delay};
use crate::types::{ChunkMetadata, PipelineEvent, TaskState};

use admission::AdmissionRequest;
use state::{Dispatch, PipelineState};

/// What the reader receives, one item at a time
#[derive(Debug)]
pub(crate) enum Delivery {
    /// The next chunk in order; the reader must acknowledge it once decoded
    Chunk(DownloadResult),
    /// The pipeline failed at this position
    Failed(Error),
    /// Every chunk has been delivered
    End,
}

/// Timers and refetches spawned by the coordinator
#[derive(Debug)]
enum Followup {
    RetryDue {
        index: u64,
    },
    LinkRefreshed {
        index: u64,
        result: Result<ChunkMetadata>,
    },
}

/// Channels connecting the coordinator to the rest of the pipeline
pub(crate) struct ManagerChannels {
    pub(crate) metadata: mpsc::Receiver<FetcherMessage>,
    pub(crate) worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub(crate) consumed: mpsc::UnboundedReceiver<u64>,
    pub(crate) deliveries: mpsc::UnboundedSender<Delivery>,
    pub(crate) admission: mpsc::UnboundedSender<AdmissionRequest>,
    pub(crate) jobs: mpsc::UnboundedSender<Job>,
    pub(crate) events: broadcast::Sender<PipelineEvent>,
}

pub(crate) struct DownloadManager {
    config: Arc<CloudFetchConfig>,
    chunk_retry: RetryConfig,
    links: Arc<dyn ChunkLinkFetcher>,
    channels: ManagerChannels,
    state: PipelineState,
    followups: JoinSet<Followup>,
    cancel: CancellationToken,
}

impl DownloadManager {
    pub(crate) fn new(
        config: Arc<CloudFetchConfig>,
        links: Arc<dyn ChunkLinkFetcher>,
        channels: ManagerChannels,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            chunk_retry: config.chunk_retry(),
            config,
            links,
            channels,
            state: PipelineState::default(),
            followups: JoinSet::new(),
            cancel,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let outcome = loop {
            self.schedule();
            if let Some(outcome) = self.deliver() {
                break outcome;
            }

            let wants_metadata = self.wants_metadata();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Some(Error::Cancelled),
                consumed = self.channels.consumed.recv() => match consumed {
                    Some(index) => self.on_consumed(index),
                    None => break Some(Error::Cancelled),
                },
                Some(event) = self.channels.worker_events.recv() => self.on_worker_event(event),
                Some(joined) = self.followups.join_next(), if !self.followups.is_empty() => {
                    match joined {
                        Ok(followup) => self.on_followup(followup),
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Retry or refetch task panicked");
                            let error = Error::Other(format!("retry task panicked: {e}"));
                            let _ = self.channels.deliveries.send(Delivery::Failed(error.clone()));
                            break Some(error);
                        }
                    }
                },
                message = self.channels.metadata.recv(), if wants_metadata => {
                    self.on_metadata(message);
                },
            }
        };

        self.shutdown(outcome);
    }

    /// Only read ahead of the prefetch window by the configured lookahead
    fn wants_metadata(&self) -> bool {
        if self.state.metadata_finished() {
            return false;
        }
        let horizon = self
            .state
            .window_end(self.config.prefetch_window)
            .saturating_add(1)
            .saturating_add(self.config.metadata_lookahead as u64);
        self.state.known < horizon
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.channels.events.send(event);
    }

    fn schedule(&mut self) {
        let dispatches = self
            .state
            .plan(self.config.prefetch_window, self.config.max_parallel_downloads);

        for dispatch in dispatches {
            match dispatch {
                Dispatch::Admit(metadata) => {
                    let bytes = metadata.memory_estimate(self.config.lz4_expansion_ratio);
                    tracing::debug!(chunk_index = metadata.index, bytes, "Requesting admission");
                    let _ = self
                        .channels
                        .admission
                        .send(AdmissionRequest { metadata, bytes });
                }
                Dispatch::Resume {
                    metadata,
                    lease,
                    attempt,
                } => {
                    tracing::debug!(chunk_index = metadata.index, attempt, "Re-dispatching chunk");
                    let _ = self.channels.jobs.send(Job {
                        metadata,
                        lease,
                        attempt,
                    });
                }
            }
        }
    }

    /// Hand the reader whatever is next; returns the pipeline outcome once it is over
    fn deliver(&mut self) -> Option<Option<Error>> {
        let delivery = self.state.take_delivery()?;

        let outcome = match &delivery {
            Delivery::Chunk(result) => {
                tracing::debug!(chunk_index = result.index, "Delivering chunk");
                self.emit(PipelineEvent::ChunkDelivered {
                    index: result.index,
                });
                None
            }
            Delivery::Failed(e) => Some(Some(e.clone())),
            Delivery::End => Some(None),
        };

        if self.channels.deliveries.send(delivery).is_err() {
            // Reader is gone
            return Some(Some(Error::Cancelled));
        }
        outcome
    }

    fn on_consumed(&mut self, index: u64) {
        if !self.state.consume(index) {
            tracing::warn!(
                chunk_index = index,
                expected = self.state.next_delivery,
                "Ignoring unexpected consumption acknowledgement"
            );
        }
    }

    fn on_metadata(&mut self, message: Option<FetcherMessage>) {
        match message {
            Some(FetcherMessage::Chunk(metadata)) => {
                self.emit(PipelineEvent::MetadataReceived {
                    index: metadata.index,
                });
                self.state.insert_metadata(metadata);
            }
            Some(FetcherMessage::Done { total }) => {
                tracing::debug!(total, "Metadata complete");
                self.state.total = Some(total);
            }
            Some(FetcherMessage::Failed(e)) => {
                tracing::error!(
                    chunk_index = self.state.known,
                    error = %e,
                    "Metadata producer failed; stopping after the chunks already described"
                );
                self.state.record_metadata_failure(e);
            }
            None => {
                self.state.record_metadata_failure(Error::MetadataFetch(
                    "metadata producer stopped unexpectedly".to_string(),
                ));
            }
        }
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started { index, attempt } => {
                if let Some(task) = self.state.task_mut(index) {
                    task.state = TaskState::Downloading;
                    task.attempts += 1;
                }
                self.emit(PipelineEvent::DownloadStarted { index, attempt });
            }
            WorkerEvent::Completed(result) => {
                let index = result.index;
                let bytes = result.data.len() as u64;
                match self.state.task_mut(index) {
                    Some(task) => {
                        task.state = TaskState::Downloaded;
                        task.result = Some(result);
                    }
                    None => return,
                }
                tracing::debug!(chunk_index = index, bytes, "Chunk downloaded");
                self.emit(PipelineEvent::ChunkDownloaded { index, bytes });
            }
            WorkerEvent::Failed {
                index,
                error,
                lease,
            } => {
                let Some(task) = self.state.task_mut(index) else {
                    return;
                };
                task.lease = Some(lease);
                self.on_attempt_failed(index, error);
            }
        }
    }

    /// Apply the retry policy to a failed attempt
    fn on_attempt_failed(&mut self, index: u64, error: Error) {
        let max_retries = self.config.max_retries;
        let max_refetches = self.config.expired_link_max_refetches;
        let Some(task) = self.state.task_mut(index) else {
            return;
        };

        match error {
            _ if error.is_retryable() && task.retries < max_retries => {
                task.retries += 1;
                task.state = TaskState::Failed;
                let retry = task.retries;
                let delay = backoff_delay(&self.chunk_retry, retry);

                tracing::warn!(
                    chunk_index = index,
                    retry,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Chunk download failed, retrying"
                );
                self.emit(PipelineEvent::RetryScheduled {
                    index,
                    retry,
                    delay_ms: delay.as_millis() as u64,
                    error: error.to_string(),
                });

                let cancel = self.cancel.clone();
                self.followups.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    Followup::RetryDue { index }
                });
            }
            Error::DataIntegrity(_) if task.integrity_retries < 1 => {
                task.integrity_retries += 1;
                task.state = TaskState::Pending;
                tracing::warn!(
                    chunk_index = index,
                    error = %error,
                    "Chunk failed integrity check, retrying once"
                );
            }
            Error::ExpiredLink(_) if task.refetches < max_refetches => {
                task.refetches += 1;
                task.state = TaskState::Expired;
                tracing::warn!(
                    chunk_index = index,
                    refetches = task.refetches,
                    max_refetches,
                    error = %error,
                    "Chunk link expired, fetching a fresh one"
                );

                let links = Arc::clone(&self.links);
                let retry = self.config.metadata_retry.clone();
                let cancel = self.cancel.clone();
                self.followups.spawn(async move {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                        result = refetch_link(links.as_ref(), &retry, index) => result,
                    };
                    Followup::LinkRefreshed { index, result }
                });
            }
            _ => self.fail_chunk(index, error),
        }
    }

    fn on_followup(&mut self, followup: Followup) {
        match followup {
            Followup::RetryDue { index } => {
                if let Some(task) = self.state.task_mut(index) {
                    if task.state == TaskState::Failed && task.error.is_none() {
                        task.state = TaskState::Pending;
                    }
                }
            }
            Followup::LinkRefreshed { index, result } => match result {
                Ok(metadata) => {
                    let Some(task) = self.state.task_mut(index) else {
                        return;
                    };
                    task.metadata = metadata;
                    task.state = TaskState::Pending;
                    let refetches = task.refetches;
                    tracing::info!(chunk_index = index, refetches, "Chunk link refreshed");
                    self.emit(PipelineEvent::LinkRefreshed { index, refetches });
                }
                Err(Error::Cancelled) => {}
                Err(e) => self.fail_chunk(index, e),
            },
        }
    }

    fn fail_chunk(&mut self, index: u64, reason: Error) {
        let attempts = self
            .state
            .task_mut(index)
            .map(|task| task.attempts)
            .unwrap_or_default();
        let error = Error::ChunkFailed {
            index,
            attempts,
            reason: Box::new(reason),
        };

        tracing::error!(chunk_index = index, attempts, error = %error, "Chunk failed terminally");
        self.emit(PipelineEvent::ChunkFailed {
            index,
            error: error.to_string(),
        });
        self.state.fail_task(index, error);
    }

    /// Stop every background task and release all buffered memory
    fn shutdown(mut self, outcome: Option<Error>) {
        self.cancel.cancel();
        self.followups.abort_all();
        self.state.clear();

        let delivered = self.state.delivered;
        match &outcome {
            None => tracing::info!(delivered, "CloudFetch pipeline finished"),
            Some(Error::Cancelled) => tracing::info!(delivered, "CloudFetch pipeline cancelled"),
            Some(e) => tracing::error!(delivered, error = %e, "CloudFetch pipeline failed"),
        }

        self.emit(PipelineEvent::Finished {
            delivered,
            error: outcome.map(|e| e.to_string()),
        });
    }
}
