//! Pipeline assembly
//!
//! Builds the cancellation tree and channels, then starts the metadata producer, the
//! download manager, the admission task and the worker pool.
//!
//! ```text
//! root token (Reader) ── background token (all spawned tasks, memory budget)
//!
//! ResultFetcher ─metadata─▶ DownloadManager ─requests─▶ admission ─jobs─▶ workers
//!                               ▲      │                                   │
//!                               │      └──────────────jobs (retries)──────▶│
//!                               │◀───────────────worker events─────────────┘
//!                               │
//!                     consumed  │  deliveries
//!                               ▼
//!                             Reader
//! ```

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::CloudFetchConfig;
use crate::downloader::{self, ChunkTransport, HttpChunkTransport, WorkerContext};
use crate::error::Result;
use crate::fetcher::{ChunkLinkFetcher, ResultFetcher};
use crate::manager::admission::spawn_admission;
use crate::manager::{DownloadManager, ManagerChannels};
use crate::memory::MemoryBufferManager;
use crate::reader::{Reader, ReaderParts};

/// Event channel capacity; lagging subscribers lose the oldest events
const EVENT_CAPACITY: usize = 1024;

/// Entry point for streaming a CloudFetch result set
pub struct CloudFetchPipeline;

impl CloudFetchPipeline {
    /// Start downloading a result set and return the reader for it
    ///
    /// Must be called from within a Tokio runtime. Background work begins immediately:
    /// the first metadata page is requested and chunks inside the prefetch window start
    /// downloading before the first call to [`Reader::next`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if `config` fails validation.
    pub fn start(
        config: CloudFetchConfig,
        links: Arc<dyn ChunkLinkFetcher>,
        transport: Arc<dyn ChunkTransport>,
    ) -> Result<Reader> {
        config.validate()?;
        let config = Arc::new(config);

        let root = CancellationToken::new();
        let background = root.child_token();
        let memory = MemoryBufferManager::new(config.memory_limit_bytes, background.clone());

        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (metadata_tx, metadata_rx) = mpsc::channel(config.metadata_lookahead);
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (consumed_tx, consumed_rx) = mpsc::unbounded_channel();
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let (admission_tx, admission_rx) = mpsc::unbounded_channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(config.max_parallel_downloads + 3);

        handles.push(
            ResultFetcher::new(
                Arc::clone(&links),
                config.metadata_retry.clone(),
                metadata_tx,
                background.clone(),
            )
            .spawn(),
        );

        handles.push(spawn_admission(
            memory.clone(),
            admission_rx,
            jobs_tx.clone(),
            events_tx.clone(),
            background.clone(),
        ));

        handles.extend(downloader::spawn_workers(
            config.max_parallel_downloads,
            Arc::new(Mutex::new(jobs_rx)),
            WorkerContext {
                transport,
                events: worker_tx,
                cancel: background.clone(),
                link_expiry_buffer: config.link_expiry_buffer,
            },
        ));

        handles.push(
            DownloadManager::new(
                Arc::clone(&config),
                links,
                ManagerChannels {
                    metadata: metadata_rx,
                    worker_events: worker_rx,
                    consumed: consumed_rx,
                    deliveries: deliveries_tx,
                    admission: admission_tx,
                    jobs: jobs_tx,
                    events: events_tx.clone(),
                },
                background,
            )
            .spawn(),
        );

        tracing::info!(
            max_parallel_downloads = config.max_parallel_downloads,
            prefetch_window = config.prefetch_window,
            memory_limit_bytes = config.memory_limit_bytes,
            "CloudFetch pipeline started"
        );

        Ok(Reader::new(ReaderParts {
            deliveries: deliveries_rx,
            consumed: consumed_tx,
            cancel: root,
            memory,
            events: events_tx,
            handles,
            drain_timeout: config.drain_timeout,
        }))
    }

    /// [`CloudFetchPipeline::start`] with the reqwest-backed transport
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if `config` is invalid or the HTTP client cannot
    /// be built.
    pub fn start_http(
        config: CloudFetchConfig,
        links: Arc<dyn ChunkLinkFetcher>,
    ) -> Result<Reader> {
        config.validate()?;
        let transport = Arc::new(HttpChunkTransport::new(config.request_timeout)?);
        Self::start(config, links, transport)
    }
}
