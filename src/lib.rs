//! # cloudfetch
//!
//! Parallel, memory-bounded download engine for SQL result sets served as presigned
//! cloud-storage chunks.
//!
//! ## Design Philosophy
//!
//! cloudfetch is designed to be:
//! - **Strictly ordered** - Chunks reach the caller in server-assigned order, however the
//!   downloads finish
//! - **Memory bounded** - Every buffered chunk holds a lease against one global budget
//! - **Failure contained** - Transient errors and expired links are retried inside the
//!   pipeline; only terminal failures reach the caller, at the chunk where they happened
//! - **Library-first** - The query-engine protocol and storage transport are traits the
//!   embedding driver implements
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudfetch::{ChunkLinkFetcher, ChunkMetadata, CloudFetchConfig, CloudFetchPipeline, MetadataPage};
//!
//! struct StatementLinks;
//!
//! #[async_trait::async_trait]
//! impl ChunkLinkFetcher for StatementLinks {
//!     async fn fetch_page(&self, token: Option<&str>) -> cloudfetch::Result<MetadataPage> {
//!         // Ask the query engine for the next page of result links
//!         # let _ = token;
//!         Ok(MetadataPage::default())
//!     }
//!
//!     async fn refetch_chunk(&self, index: u64) -> cloudfetch::Result<ChunkMetadata> {
//!         // Ask the query engine for a fresh link to one chunk
//!         # unimplemented!("chunk {index}")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut reader = CloudFetchPipeline::start_http(
//!         CloudFetchConfig::default(),
//!         Arc::new(StatementLinks),
//!     )?;
//!
//!     // Subscribe to events
//!     let mut events = reader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     while let Some(batch) = reader.next().await? {
//!         println!("{} rows", batch.num_rows());
//!     }
//!     reader.close().await;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Chunk download workers and storage transport
pub mod downloader;
/// Error types
pub mod error;
/// Chunk metadata producer and the query-engine link seam
pub mod fetcher;
/// Scheduling, retries and in-order delivery
pub(crate) mod manager;
/// Memory admission control
pub mod memory;
/// Pipeline assembly
pub mod pipeline;
/// In-order consumer surface
pub mod reader;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{CloudFetchConfig, RetryConfig};
pub use downloader::{ChunkTransport, HttpChunkTransport};
pub use error::{Error, Result};
pub use fetcher::ChunkLinkFetcher;
pub use memory::{MemoryBufferManager, MemoryLease};
pub use pipeline::CloudFetchPipeline;
pub use reader::Reader;
pub use types::{
    ChunkMetadata, CompressionCodec, MetadataPage, PipelineEvent, RowBatch, TaskState,
};
