//! Scheduling state owned by the download manager
//!
//! Everything here is plain data plus synchronous decisions; the coordinator loop in the
//! parent module is the only owner, so nothing is locked.

use std::collections::BTreeMap;

use crate::downloader::DownloadResult;
use crate::error::Error;
use crate::memory::MemoryLease;
use crate::types::{ChunkMetadata, TaskState};

use super::Delivery;

/// Mutable wrapper around one chunk descriptor
#[derive(Debug)]
pub(crate) struct DownloadTask {
    pub(crate) metadata: ChunkMetadata,
    pub(crate) state: TaskState,
    /// Attempts handed to a worker so far
    pub(crate) attempts: u32,
    /// Transient retries used
    pub(crate) retries: u32,
    /// Retries used after integrity failures
    pub(crate) integrity_retries: u32,
    /// Link refetches used
    pub(crate) refetches: u32,
    /// Held between attempts so a retry never waits for memory again
    pub(crate) lease: Option<MemoryLease>,
    pub(crate) result: Option<DownloadResult>,
    /// Set once the task failed terminally
    pub(crate) error: Option<Error>,
}

impl DownloadTask {
    pub(crate) fn new(metadata: ChunkMetadata) -> Self {
        Self {
            metadata,
            state: TaskState::Pending,
            attempts: 0,
            retries: 0,
            integrity_retries: 0,
            refetches: 0,
            lease: None,
            result: None,
            error: None,
        }
    }

    fn in_flight(&self) -> bool {
        matches!(self.state, TaskState::Queued | TaskState::Downloading)
    }
}

/// Work the coordinator must hand out after a scheduling pass
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// First attempt: needs a memory grant from the admission task
    Admit(ChunkMetadata),
    /// Later attempt: already holds its lease and goes straight to a worker
    Resume {
        metadata: ChunkMetadata,
        lease: MemoryLease,
        attempt: u32,
    },
}

/// Ordered task map plus the delivery cursor
#[derive(Debug, Default)]
pub(crate) struct PipelineState {
    pub(crate) tasks: BTreeMap<u64, DownloadTask>,
    /// Index the reader is waiting for
    pub(crate) next_delivery: u64,
    /// Index of the next descriptor expected from the metadata producer
    pub(crate) known: u64,
    /// Total chunk count, once the producer has finished
    pub(crate) total: Option<u64>,
    /// Producer failure, positioned at the first index it could not describe
    pub(crate) metadata_error: Option<(u64, Error)>,
    /// Lowest index that failed terminally
    pub(crate) failed_index: Option<u64>,
    /// A result was handed to the reader and not yet acknowledged
    pub(crate) awaiting_consume: bool,
    pub(crate) delivered: u64,
}

impl PipelineState {
    pub(crate) fn insert_metadata(&mut self, metadata: ChunkMetadata) {
        self.known = metadata.index + 1;
        self.tasks
            .insert(metadata.index, DownloadTask::new(metadata));
    }

    pub(crate) fn record_metadata_failure(&mut self, error: Error) {
        self.metadata_error = Some((self.known, error));
    }

    pub(crate) fn metadata_finished(&self) -> bool {
        self.total.is_some() || self.metadata_error.is_some()
    }

    /// Tasks queued for or running on a worker
    pub(crate) fn in_flight(&self) -> usize {
        self.tasks.values().filter(|t| t.in_flight()).count()
    }

    /// Highest index allowed to start downloading
    pub(crate) fn window_end(&self, prefetch_window: usize) -> u64 {
        self.next_delivery.saturating_add(prefetch_window as u64)
    }

    pub(crate) fn task_mut(&mut self, index: u64) -> Option<&mut DownloadTask> {
        self.tasks.get_mut(&index)
    }

    /// Mark a task terminally failed; later indices stop being scheduled
    pub(crate) fn fail_task(&mut self, index: u64, error: Error) {
        if let Some(task) = self.tasks.get_mut(&index) {
            task.state = TaskState::Failed;
            task.lease = None;
            task.error = Some(error);
        }
        self.failed_index = Some(self.failed_index.map_or(index, |f| f.min(index)));
    }

    /// Pick the tasks to start now, lowest index first
    ///
    /// A task may start when it is inside the prefetch window, below any terminally failed
    /// index, and fewer than `max_parallel` tasks are queued or downloading. Picked tasks
    /// move to `Queued`.
    pub(crate) fn plan(&mut self, prefetch_window: usize, max_parallel: usize) -> Vec<Dispatch> {
        let mut in_flight = self.in_flight();
        let window_end = self.window_end(prefetch_window);
        let stop = self.failed_index.unwrap_or(u64::MAX);
        let mut dispatches = Vec::new();

        for (&index, task) in self.tasks.range_mut(self.next_delivery..) {
            if index > window_end || index >= stop || in_flight >= max_parallel {
                break;
            }
            if task.state != TaskState::Pending {
                continue;
            }

            task.state = TaskState::Queued;
            in_flight += 1;
            match task.lease.take() {
                Some(lease) => dispatches.push(Dispatch::Resume {
                    metadata: task.metadata.clone(),
                    lease,
                    attempt: task.attempts,
                }),
                None => dispatches.push(Dispatch::Admit(task.metadata.clone())),
            }
        }

        dispatches
    }

    /// Next item for the reader, if the cursor can move
    ///
    /// Results are handed over one at a time; nothing else is released until the reader
    /// acknowledges the previous chunk.
    pub(crate) fn take_delivery(&mut self) -> Option<Delivery> {
        if self.awaiting_consume {
            return None;
        }

        let index = self.next_delivery;
        if let Some(task) = self.tasks.get_mut(&index) {
            if let Some(error) = &task.error {
                return Some(Delivery::Failed(error.clone()));
            }
            if task.state == TaskState::Downloaded {
                let result = task.result.take()?;
                self.tasks.remove(&index);
                self.awaiting_consume = true;
                return Some(Delivery::Chunk(result));
            }
            return None;
        }

        match &self.metadata_error {
            Some((at, error)) if *at == index => return Some(Delivery::Failed(error.clone())),
            _ => {}
        }
        if self.total == Some(index) {
            return Some(Delivery::End);
        }
        None
    }

    /// Reader finished with `index`; slide the window
    ///
    /// Returns false for an acknowledgement that does not match the outstanding chunk.
    pub(crate) fn consume(&mut self, index: u64) -> bool {
        if !self.awaiting_consume || index != self.next_delivery {
            return false;
        }
        self.awaiting_consume = false;
        self.next_delivery += 1;
        self.delivered += 1;
        true
    }

    /// Drop every task, returning all held leases and buffered results
    pub(crate) fn clear(&mut self) {
        self.tasks.clear();
    }
}
