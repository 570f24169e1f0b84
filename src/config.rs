//! Configuration types for cloudfetch

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// CloudFetch pipeline configuration
///
/// Constructed once per result set and shared (behind an `Arc`) by every pipeline
/// component. Every field has a documented default, so an empty JSON object is a valid
/// configuration. Durations serialize as integer milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudFetchConfig {
    /// Number of download workers; also the cap on chunks queued or downloading (default: 3)
    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,

    /// How many chunks past the oldest unconsumed one may be admitted (default: 2)
    #[serde(default = "default_prefetch_window")]
    pub prefetch_window: usize,

    /// Global buffering budget shared by all in-memory chunks (default: 200 MiB)
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,

    /// Retries allowed for a chunk after its first transient failure (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay for chunk retries (default: 500 ms)
    #[serde(
        default = "default_retry_backoff_base",
        rename = "retry_backoff_base_ms",
        with = "duration_ms_serde"
    )]
    pub retry_backoff_base: Duration,

    /// Upper bound for chunk retry backoff (default: 10 s)
    #[serde(
        default = "default_retry_backoff_max",
        rename = "retry_backoff_max_ms",
        with = "duration_ms_serde"
    )]
    pub retry_backoff_max: Duration,

    /// Add random jitter to chunk retry delays (default: true)
    #[serde(default = "default_true")]
    pub retry_jitter: bool,

    /// Link refetches allowed per chunk before it fails terminally (default: 3)
    #[serde(default = "default_expired_link_max_refetches")]
    pub expired_link_max_refetches: u32,

    /// Links expiring within this margin are refreshed before being used (default: 60 s)
    #[serde(
        default = "default_link_expiry_buffer",
        rename = "link_expiry_buffer_ms",
        with = "duration_ms_serde"
    )]
    pub link_expiry_buffer: Duration,

    /// Chunk descriptors the metadata producer may run ahead of the prefetch window (default: 16)
    #[serde(default = "default_metadata_lookahead")]
    pub metadata_lookahead: usize,

    /// Retry policy for paginated metadata calls and link refetches
    #[serde(default)]
    pub metadata_retry: RetryConfig,

    /// Timeout for a single chunk GET (default: 60 s)
    #[serde(
        default = "default_request_timeout",
        rename = "request_timeout_ms",
        with = "duration_ms_serde"
    )]
    pub request_timeout: Duration,

    /// Decompressed-size multiplier used to estimate LZ4 chunk memory (default: 2.0)
    ///
    /// An LZ4 chunk of `n` compressed bytes is admitted as `n + n * ratio` bytes.
    #[serde(default = "default_lz4_expansion_ratio")]
    pub lz4_expansion_ratio: f64,

    /// How long `close()` waits for background tasks before aborting them (default: 5 s)
    #[serde(
        default = "default_drain_timeout",
        rename = "drain_timeout_ms",
        with = "duration_ms_serde"
    )]
    pub drain_timeout: Duration,
}

impl Default for CloudFetchConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: default_max_parallel_downloads(),
            prefetch_window: default_prefetch_window(),
            memory_limit_bytes: default_memory_limit_bytes(),
            max_retries: default_max_retries(),
            retry_backoff_base: default_retry_backoff_base(),
            retry_backoff_max: default_retry_backoff_max(),
            retry_jitter: true,
            expired_link_max_refetches: default_expired_link_max_refetches(),
            link_expiry_buffer: default_link_expiry_buffer(),
            metadata_lookahead: default_metadata_lookahead(),
            metadata_retry: RetryConfig::default(),
            request_timeout: default_request_timeout(),
            lz4_expansion_ratio: default_lz4_expansion_ratio(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl CloudFetchConfig {
    /// Check the configuration for values the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_downloads == 0 {
            return Err(Error::config(
                "max_parallel_downloads",
                "at least one download worker is required",
            ));
        }
        if self.memory_limit_bytes == 0 {
            return Err(Error::config(
                "memory_limit_bytes",
                "memory budget must be greater than zero",
            ));
        }
        if self.metadata_lookahead == 0 {
            return Err(Error::config(
                "metadata_lookahead",
                "metadata lookahead must be at least 1",
            ));
        }
        if !self.lz4_expansion_ratio.is_finite() || self.lz4_expansion_ratio < 0.0 {
            return Err(Error::config(
                "lz4_expansion_ratio",
                format!(
                    "expansion ratio must be a finite, non-negative number (got {})",
                    self.lz4_expansion_ratio
                ),
            ));
        }
        if self.metadata_retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "metadata_retry.backoff_multiplier",
                "backoff multiplier must be >= 1.0",
            ));
        }
        Ok(())
    }

    /// Backoff policy for per-chunk transient failures
    pub fn chunk_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries,
            initial_delay: self.retry_backoff_base,
            max_delay: self.retry_backoff_max,
            backoff_multiplier: 2.0,
            jitter: self.retry_jitter,
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(
        default = "default_initial_delay",
        rename = "initial_delay_ms",
        with = "duration_ms_serde"
    )]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(
        default = "default_max_delay",
        rename = "max_delay_ms",
        with = "duration_ms_serde"
    )]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

fn default_max_parallel_downloads() -> usize {
    3
}

fn default_prefetch_window() -> usize {
    2
}

fn default_memory_limit_bytes() -> u64 {
    200 * 1024 * 1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_retry_backoff_max() -> Duration {
    Duration::from_secs(10)
}

fn default_expired_link_max_refetches() -> u32 {
    3
}

fn default_link_expiry_buffer() -> Duration {
    Duration::from_secs(60)
}

fn default_metadata_lookahead() -> usize {
    16
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_lz4_expansion_ratio() -> f64 {
    2.0
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration <-> integer milliseconds
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CloudFetchConfig::default();

        assert_eq!(config.max_parallel_downloads, 3);
        assert_eq!(config.prefetch_window, 2);
        assert_eq!(config.memory_limit_bytes, 200 * 1024 * 1024);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.expired_link_max_refetches, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_json_object_yields_defaults() {
        let config: CloudFetchConfig = serde_json::from_str("{}").expect("deserialize failed");

        assert_eq!(config.max_parallel_downloads, 3);
        assert_eq!(config.retry_backoff_base, Duration::from_millis(500));
        assert_eq!(config.metadata_retry.max_attempts, 3);
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn durations_serialize_as_milliseconds() {
        let config = CloudFetchConfig {
            retry_backoff_base: Duration::from_millis(250),
            link_expiry_buffer: Duration::from_secs(2),
            ..CloudFetchConfig::default()
        };

        let json = serde_json::to_value(&config).expect("serialize failed");

        assert_eq!(json["retry_backoff_base_ms"], 250);
        assert_eq!(json["link_expiry_buffer_ms"], 2000);
        assert_eq!(json["metadata_retry"]["initial_delay_ms"], 1000);
    }

    #[test]
    fn partial_json_overrides_only_given_fields() {
        let json = r#"{"max_parallel_downloads": 8, "retry_backoff_base_ms": 20}"#;

        let config: CloudFetchConfig = serde_json::from_str(json).expect("deserialize failed");

        assert_eq!(config.max_parallel_downloads, 8);
        assert_eq!(config.retry_backoff_base, Duration::from_millis(20));
        assert_eq!(config.prefetch_window, 2, "untouched field keeps default");
    }

    #[test]
    fn duration_rejects_string_value() {
        let json = r#"{"drain_timeout_ms": "5s"}"#;
        let result: std::result::Result<CloudFetchConfig, _> = serde_json::from_str(json);
        assert!(result.is_err(), "string durations must be rejected");
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let config = CloudFetchConfig {
            max_parallel_downloads: 0,
            ..CloudFetchConfig::default()
        };

        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("max_parallel_downloads"))
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_zero_memory_and_bad_ratio() {
        let zero_memory = CloudFetchConfig {
            memory_limit_bytes: 0,
            ..CloudFetchConfig::default()
        };
        assert!(zero_memory.validate().is_err());

        let bad_ratio = CloudFetchConfig {
            lz4_expansion_ratio: f64::NAN,
            ..CloudFetchConfig::default()
        };
        assert!(bad_ratio.validate().is_err());

        let zero_lookahead = CloudFetchConfig {
            metadata_lookahead: 0,
            ..CloudFetchConfig::default()
        };
        assert!(zero_lookahead.validate().is_err());
    }

    #[test]
    fn chunk_retry_mirrors_top_level_fields() {
        let config = CloudFetchConfig {
            max_retries: 5,
            retry_backoff_base: Duration::from_millis(10),
            retry_backoff_max: Duration::from_millis(80),
            retry_jitter: false,
            ..CloudFetchConfig::default()
        };

        let retry = config.chunk_retry();

        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.initial_delay, Duration::from_millis(10));
        assert_eq!(retry.max_delay, Duration::from_millis(80));
        assert!(!retry.jitter);
    }
}
