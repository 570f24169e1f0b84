//! Byte-range GET of a chunk object from a presigned storage URL.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::RANGE;

use crate::error::{Error, Result};

/// Abstraction over fetching a chunk object, enabling testability.
///
/// Implementations classify failures into the pipeline's taxonomy:
/// [`Error::ExpiredLink`] when storage rejects the presigned link,
/// [`Error::TransientNetwork`] for anything worth retrying, and
/// [`Error::Http`] for statuses a retry cannot fix.
#[async_trait::async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Fetch the first `byte_length` bytes of the object at `url`
    async fn fetch(
        &self,
        url: &str,
        byte_length: u64,
        headers: &HashMap<String, String>,
    ) -> Result<Vec<u8>>;
}

/// Production [`ChunkTransport`] backed by a pooled reqwest client.
pub struct HttpChunkTransport {
    client: reqwest::Client,
}

impl HttpChunkTransport {
    /// Build a transport whose requests time out after `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("cloudfetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config {
                message: format!("failed to build HTTP client: {e}"),
                key: Some("request_timeout_ms".to_string()),
            })?;
        Ok(Self { client })
    }

    /// Wrap an existing client (shared connection pool, custom TLS, proxies)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ChunkTransport for HttpChunkTransport {
    async fn fetch(
        &self,
        url: &str,
        byte_length: u64,
        headers: &HashMap<String, String>,
    ) -> Result<Vec<u8>> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if byte_length > 0 {
            request = request.header(RANGE, format!("bytes=0-{}", byte_length - 1));
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let body = response.bytes().await.map_err(classify_transport_error)?;
        Ok(body.to_vec())
    }
}

/// Errors below the HTTP layer (DNS, connect, TLS, timeouts, truncated bodies).
fn classify_transport_error(e: reqwest::Error) -> Error {
    if e.is_builder() {
        return Error::Http {
            status: 0,
            message: format!("invalid request: {e}"),
        };
    }
    Error::TransientNetwork(e.to_string())
}

/// Map a non-success status to the pipeline's error taxonomy.
///
/// Object stores report a lapsed presigned URL as 403 (S3 "Request has expired",
/// GCS "ExpiredToken") or 401, and Azure as 403 "AuthenticationFailed"; some
/// gateways use 400 with an expiry message.
pub(crate) fn classify_status(status: StatusCode, body: String) -> Error {
    let code = status.as_u16();
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("unknown").to_string()
    } else {
        body
    };

    match code {
        401 | 403 => Error::ExpiredLink(format!("HTTP {code}: {message}")),
        400 if mentions_expiry(&message) => Error::ExpiredLink(format!("HTTP {code}: {message}")),
        408 | 429 => Error::TransientNetwork(format!("HTTP {code}: {message}")),
        500..=599 => Error::TransientNetwork(format!("HTTP {code}: {message}")),
        _ => Error::Http {
            status: code,
            message,
        },
    }
}

fn mentions_expiry(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("expired") || lower.contains("expiredtoken")
}
