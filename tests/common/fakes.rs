//! Scripted stand-ins for the query engine and object storage

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloudfetch::{
    ChunkLinkFetcher, ChunkMetadata, ChunkTransport, CompressionCodec, Error, MetadataPage, Result,
};
use rand::Rng;

use super::fixtures::chunk_url;

/// One chunk of a fake result set
#[derive(Clone)]
pub struct FakeChunk {
    pub payload: Vec<u8>,
    pub compression: CompressionCodec,
    pub row_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl FakeChunk {
    pub fn plain(payload: Vec<u8>, row_count: u64) -> Self {
        Self {
            payload,
            compression: CompressionCodec::None,
            row_count,
            expires_at: None,
        }
    }

    pub fn metadata(&self, index: u64) -> ChunkMetadata {
        ChunkMetadata {
            index,
            url: chunk_url(index),
            byte_length: self.payload.len() as u64,
            compression: self.compression,
            row_count: self.row_count,
            expires_at: self.expires_at,
            headers: HashMap::new(),
        }
    }
}

/// Query engine serving a fixed list of chunks in pages
pub struct ScriptedLinks {
    chunks: Vec<FakeChunk>,
    page_size: usize,
    /// Pages starting at or after this index fail
    fail_from: Option<u64>,
    /// Refetches fail for these indices
    refetch_fails: HashSet<u64>,
    refetches: Mutex<HashMap<u64, u32>>,
    pages_served: AtomicUsize,
}

impl ScriptedLinks {
    pub fn new(chunks: Vec<FakeChunk>, page_size: usize) -> Self {
        Self {
            chunks,
            page_size: page_size.max(1),
            fail_from: None,
            refetch_fails: HashSet::new(),
            refetches: Mutex::new(HashMap::new()),
            pages_served: AtomicUsize::new(0),
        }
    }

    pub fn fail_pages_from(mut self, index: u64) -> Self {
        self.fail_from = Some(index);
        self
    }

    pub fn fail_refetch(mut self, index: u64) -> Self {
        self.refetch_fails.insert(index);
        self
    }

    pub fn refetches(&self, index: u64) -> u32 {
        self.refetches
            .lock()
            .unwrap()
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_refetches(&self) -> u32 {
        self.refetches.lock().unwrap().values().sum()
    }

    pub fn pages_served(&self) -> usize {
        self.pages_served.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChunkLinkFetcher for ScriptedLinks {
    async fn fetch_page(&self, token: Option<&str>) -> Result<MetadataPage> {
        let start: usize = token.map(|t| t.parse().unwrap()).unwrap_or(0);
        if let Some(fail_from) = self.fail_from {
            if start as u64 >= fail_from {
                return Err(Error::MetadataFetch(format!(
                    "statement handle for page {start} not found"
                )));
            }
        }

        let end = (start + self.page_size).min(self.chunks.len());
        let chunks = (start..end)
            .map(|i| self.chunks[i].metadata(i as u64))
            .collect();
        let next_token = (end < self.chunks.len()).then(|| end.to_string());
        self.pages_served.fetch_add(1, Ordering::SeqCst);

        Ok(MetadataPage { chunks, next_token })
    }

    async fn refetch_chunk(&self, index: u64) -> Result<ChunkMetadata> {
        let n = {
            let mut refetches = self.refetches.lock().unwrap();
            let n = refetches.entry(index).or_insert(0);
            *n += 1;
            *n
        };
        if self.refetch_fails.contains(&index) {
            return Err(Error::InvalidMetadata(format!("chunk {index} no longer exists")));
        }

        let mut fresh = self.chunks[index as usize].metadata(index);
        fresh.url = format!("{}?refresh={n}", chunk_url(index));
        fresh.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        Ok(fresh)
    }
}

/// Object storage serving chunk payloads with scripted misbehaviour
pub struct FakeStorage {
    payloads: HashMap<u64, Vec<u8>>,
    /// Remaining transient failures per chunk
    transient: Mutex<HashMap<u64, u32>>,
    /// Chunks that always fail transiently
    broken: HashSet<u64>,
    /// Chunks whose original (unrefreshed) link is rejected as expired
    expired: HashSet<u64>,
    /// Chunks that hang until cancelled
    stalled: HashSet<u64>,
    max_jitter: Duration,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeStorage {
    pub fn new(chunks: &[FakeChunk]) -> Self {
        Self {
            payloads: chunks
                .iter()
                .enumerate()
                .map(|(i, c)| (i as u64, c.payload.clone()))
                .collect(),
            transient: Mutex::new(HashMap::new()),
            broken: HashSet::new(),
            expired: HashSet::new(),
            stalled: HashSet::new(),
            max_jitter: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Random per-request latency up to `max`, so completions arrive out of order
    pub fn with_jitter(mut self, max: Duration) -> Self {
        self.max_jitter = max;
        self
    }

    pub fn fail_transiently(self, index: u64, times: u32) -> Self {
        self.transient.lock().unwrap().insert(index, times);
        self
    }

    pub fn always_fail(mut self, index: u64) -> Self {
        self.broken.insert(index);
        self
    }

    pub fn expire_original_link(mut self, index: u64) -> Self {
        self.expired.insert(index);
        self
    }

    pub fn stall(mut self, index: u64) -> Self {
        self.stalled.insert(index);
        self
    }

    /// Requests made for chunk `index`, any link
    pub fn calls_for(&self, index: u64) -> usize {
        let prefix = chunk_url(index);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|url| **url == prefix || url.starts_with(&format!("{prefix}?")))
            .count()
    }

    /// Requests made with exactly this URL
    pub fn calls_to(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn index_of(url: &str) -> u64 {
        let path = url.split('?').next().unwrap_or(url);
        path.rsplit('/').next().unwrap().parse().unwrap()
    }

    async fn respond(&self, url: &str) -> Result<Vec<u8>> {
        let index = Self::index_of(url);
        let refreshed = url.contains("?refresh=");

        if self.stalled.contains(&index) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if !self.max_jitter.is_zero() {
            let millis = rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }

        if self.expired.contains(&index) && !refreshed {
            return Err(Error::ExpiredLink(format!(
                "HTTP 403: Request has expired ({url})"
            )));
        }
        if self.broken.contains(&index) {
            return Err(Error::TransientNetwork("HTTP 503: Slow Down".into()));
        }
        {
            let mut transient = self.transient.lock().unwrap();
            if let Some(remaining) = transient.get_mut(&index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::TransientNetwork("connection reset by peer".into()));
                }
            }
        }

        self.payloads.get(&index).cloned().ok_or(Error::Http {
            status: 404,
            message: "NoSuchKey".into(),
        })
    }
}

#[async_trait::async_trait]
impl ChunkTransport for FakeStorage {
    async fn fetch(
        &self,
        url: &str,
        _byte_length: u64,
        _headers: &HashMap<String, String>,
    ) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(url.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let _guard = ActiveGuard(&self.active);
        self.respond(url).await
    }
}

/// Decrements the active-transfer count even when the transfer is abandoned
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
