//! Core types and events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A decoded batch of rows handed to the caller
pub type RowBatch = arrow::record_batch::RecordBatch;

/// Compression applied to a chunk object in storage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionCodec {
    /// Raw Arrow IPC stream
    #[default]
    None,
    /// LZ4 frame wrapping an Arrow IPC stream
    Lz4,
}

/// Immutable descriptor of one server-assigned result chunk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// 0-based position of the chunk; defines delivery order
    pub index: u64,
    /// Presigned storage URL
    pub url: String,
    /// Exact size of the object in storage (compressed size when `compression` is set)
    ///
    /// A downloaded body of any other length is rejected, so `0` means an empty object.
    pub byte_length: u64,
    /// Compression codec of the stored object
    #[serde(default)]
    pub compression: CompressionCodec,
    /// Number of rows the chunk decodes to
    pub row_count: u64,
    /// When the presigned URL stops being accepted, if known
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Extra request headers the storage link requires
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ChunkMetadata {
    /// True when the link has expired or will expire within `buffer` of `now`
    pub fn expires_within(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::MAX);
                match now.checked_add_signed(buffer) {
                    Some(deadline) => expires_at <= deadline,
                    None => true,
                }
            }
            None => false,
        }
    }

    /// Bytes to reserve against the memory budget before downloading this chunk
    ///
    /// Uncompressed chunks reserve their object size. LZ4 chunks reserve the compressed
    /// bytes plus an estimate of the decompressed output.
    pub fn memory_estimate(&self, lz4_expansion_ratio: f64) -> u64 {
        match self.compression {
            CompressionCodec::None => self.byte_length,
            CompressionCodec::Lz4 => {
                let decompressed = (self.byte_length as f64 * lz4_expansion_ratio).ceil();
                let decompressed = if decompressed >= u64::MAX as f64 {
                    u64::MAX
                } else {
                    decompressed as u64
                };
                self.byte_length.saturating_add(decompressed)
            }
        }
    }
}

/// One page of chunk descriptors from the metadata collaborator
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPage {
    /// Descriptors in index order
    pub chunks: Vec<ChunkMetadata>,
    /// Token for the next page; `None` means the result set has no more chunks
    pub next_token: Option<String>,
}

/// Lifecycle state of a download task
///
/// ```text
/// Pending -> Queued -> Downloading -> Downloaded
///                                  -> Failed (retryable) -> Pending
///                                  -> Expired -> Pending (after link refetch)
///                                  -> Failed (terminal)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Known but not handed to admission or a worker
    Pending,
    /// Waiting for memory admission or a free worker
    Queued,
    /// A worker is fetching/decompressing the chunk
    Downloading,
    /// Payload buffered, waiting for in-order delivery
    Downloaded,
    /// Failed; either waiting out a backoff or terminal
    Failed,
    /// Link reported expired; a metadata refetch is in flight
    Expired,
}

/// Events emitted by the pipeline
///
/// Subscribers receive these through [`crate::Reader::subscribe`]. Lagging subscribers
/// lose the oldest events; the pipeline never blocks on them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A chunk descriptor arrived from the metadata producer
    MetadataReceived {
        /// Chunk index
        index: u64,
    },

    /// Memory was granted for a chunk
    ChunkAdmitted {
        /// Chunk index
        index: u64,
        /// Bytes reserved
        bytes: u64,
    },

    /// A single chunk larger than the whole budget was admitted alone
    OversizedAdmission {
        /// Chunk index
        index: u64,
        /// Bytes reserved
        bytes: u64,
        /// Configured budget
        limit: u64,
    },

    /// A worker started fetching a chunk
    DownloadStarted {
        /// Chunk index
        index: u64,
        /// 0-based attempt number
        attempt: u32,
    },

    /// A chunk finished downloading
    ChunkDownloaded {
        /// Chunk index
        index: u64,
        /// Size of the decompressed payload
        bytes: u64,
    },

    /// A transient failure will be retried after a delay
    RetryScheduled {
        /// Chunk index
        index: u64,
        /// 1-based retry number
        retry: u32,
        /// Backoff before the retry
        delay_ms: u64,
        /// Failure that triggered the retry
        error: String,
    },

    /// A chunk's expired link was replaced by a fresh one
    LinkRefreshed {
        /// Chunk index
        index: u64,
        /// Refetches used so far for this chunk
        refetches: u32,
    },

    /// A chunk failed terminally
    ChunkFailed {
        /// Chunk index
        index: u64,
        /// Error message
        error: String,
    },

    /// A chunk was handed to the reader
    ChunkDelivered {
        /// Chunk index
        index: u64,
    },

    /// The pipeline stopped
    Finished {
        /// Chunks delivered to the reader
        delivered: u64,
        /// Terminal error, if the pipeline did not end cleanly
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}
