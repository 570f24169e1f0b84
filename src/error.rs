//! Error types for cloudfetch
//!
//! Errors fall into two groups:
//! - Per-chunk failures (`TransientNetwork`, `ExpiredLink`, `DataIntegrity`, `Http`) that the
//!   download manager contains inside its retry loop; which of them are retried is decided
//!   by [`crate::retry::IsRetryable`]
//! - Pipeline-fatal failures (`MetadataFetch`, `InvalidMetadata`, `ChunkFailed`, `Decode`,
//!   `Cancelled`) that reach the caller exactly once, at the index where they occur
//!
//! `Error` is `Clone` so a failed pipeline can keep returning the same terminal error.

use thiserror::Error;

/// Result type alias for cloudfetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cloudfetch
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_parallel_downloads")
        key: Option<String>,
    },

    /// Timeout, connection reset, throttling or a 5xx from storage
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The presigned link is no longer accepted by storage
    #[error("presigned link expired: {0}")]
    ExpiredLink(String),

    /// Transferred length or decompressed payload did not match the descriptor
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// Storage answered with a status that retrying will not fix
    #[error("storage returned HTTP {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// Chunk descriptors could not be obtained from the query engine
    #[error("metadata fetch failed: {0}")]
    MetadataFetch(String),

    /// The query engine returned descriptors that break index continuity or are malformed
    #[error("invalid chunk metadata: {0}")]
    InvalidMetadata(String),

    /// A chunk exhausted its retry budget
    #[error("chunk {index} failed after {attempts} attempt(s): {reason}")]
    ChunkFailed {
        /// Index of the chunk that failed
        index: u64,
        /// Number of download attempts made
        attempts: u32,
        /// The last underlying failure
        #[source]
        reason: Box<Error>,
    },

    /// A downloaded chunk could not be decoded into row batches
    #[error("failed to decode chunk {index}: {reason}")]
    Decode {
        /// Index of the chunk that failed to decode
        index: u64,
        /// Decoder message
        reason: String,
    },

    /// The pipeline was cancelled or closed
    #[error("pipeline cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a configuration error for a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}
